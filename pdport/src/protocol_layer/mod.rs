//! The protocol layer is controlled by the policy engines, and commands the driver.
//!
//! It turns the unreliable framed transport into an at-most-once, in-order
//! delivery abstraction per logical endpoint (SOP, SOP', SOP''):
//! - per-endpoint message-ID sequencing and duplicate filtering,
//! - GoodCRC generation and checking,
//! - bounded transmission retry,
//! - chunked extended-message assembly and serving,
//! - reset plumbing.

pub mod message;

use core::future::Future;
use core::marker::PhantomData;

use embassy_futures::select::{Either, select};
use message::extended::chunked::{ChunkResult, ChunkedMessageAssembler, ChunkedMessageSender};
use message::extended::{Extended, ExtendedHeader};
use message::header::{ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType};
use message::{Message, ParseError, Payload};
use pdport_traits::{Driver, DriverRxError, DriverTxError, SopTarget};

use crate::counters::{Counter, CounterType, Error as CounterError};
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::data::{Data, request};
use crate::timers::{Timer, TimerType};

/// The maximum size of a single frame on the wire.
///
/// Two header bytes plus seven data objects, which also covers one extended
/// header plus one 26 byte chunk.
pub const MAX_FRAME_SIZE: usize = 30;

/// Errors that can occur while receiving.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxError {
    /// Port partner requested soft reset.
    SoftReset,
    /// Driver reported a hard reset.
    HardReset,
    /// A timeout during message reception.
    ReceiveTimeout,
    /// An unsupported (reserved) message was received.
    UnsupportedMessage,
}

/// Errors that can occur while transmitting.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxError {
    /// Driver reported a hard reset.
    HardReset,
}

/// Errors that can occur in the protocol layer.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// A receive error.
    RxError(RxError),
    /// A transmit error.
    TxError(TxError),
    /// Transmission failed after the maximum number of allowed retries.
    TransmitRetriesExceeded(SopTarget),
    /// An unexpected message was received.
    UnexpectedMessage,
    /// A message could not be parsed.
    Parse(ParseError),
}

impl From<RxError> for ProtocolError {
    fn from(value: RxError) -> Self {
        ProtocolError::RxError(value)
    }
}

impl From<TxError> for ProtocolError {
    fn from(value: TxError) -> Self {
        ProtocolError::TxError(value)
    }
}

impl From<ParseError> for ProtocolError {
    fn from(value: ParseError) -> Self {
        ProtocolError::Parse(value)
    }
}

/// Message and retry counters of one logical endpoint.
#[derive(Debug)]
struct EndpointCounters {
    /// `None` until the first message after a reset was accepted.
    rx_message: Option<Counter>,
    tx_message: Counter,
    retry: Counter,
}

impl Default for EndpointCounters {
    fn default() -> Self {
        EndpointCounters {
            rx_message: None,
            tx_message: Counter::new(CounterType::MessageId),
            retry: Counter::new(CounterType::Retry),
        }
    }
}

/// The USB PD protocol layer.
#[derive(Debug)]
pub struct ProtocolLayer<DRIVER: Driver, TIMER: Timer> {
    driver: DRIVER,
    counters: [EndpointCounters; 3],
    header_template: Header,
    assembler: ChunkedMessageAssembler,
    /// Capabilities against which received request data objects are resolved.
    pdo_state: Option<SourceCapabilities>,
    _timer: PhantomData<TIMER>,
}

impl<DRIVER: Driver, TIMER: Timer> ProtocolLayer<DRIVER, TIMER> {
    /// Create a new protocol layer from a driver and default header.
    pub fn new(driver: DRIVER, header_template: Header) -> Self {
        Self {
            driver,
            counters: Default::default(),
            header_template,
            assembler: ChunkedMessageAssembler::new(),
            pdo_state: None,
            _timer: PhantomData,
        }
    }

    /// Reset message counters and assembly state for all endpoints.
    pub fn reset(&mut self) {
        self.counters = Default::default();
        self.assembler.reset();
    }

    /// Reset message counters for a single endpoint.
    pub fn reset_endpoint(&mut self, sop: SopTarget) {
        self.counters[sop.index()] = Default::default();
    }

    /// Access the underlying driver.
    pub fn driver(&mut self) -> &mut DRIVER {
        &mut self.driver
    }

    /// Tear down the protocol layer, returning the driver.
    pub fn into_driver(self) -> DRIVER {
        self.driver
    }

    /// The current SOP header template.
    pub fn header(&self) -> &Header {
        &self.header_template
    }

    /// The currently negotiated specification revision.
    pub fn spec_revision(&self) -> message::header::SpecificationRevision {
        self.header_template
            .spec_revision()
            .unwrap_or(message::header::SpecificationRevision::R3_X)
    }

    /// Update the data role used in transmitted SOP headers.
    pub fn set_data_role(&mut self, data_role: crate::DataRole) {
        self.header_template = self.header_template.with_port_data_role(data_role);
    }

    /// Update the power role used in transmitted SOP headers.
    pub fn set_power_role(&mut self, power_role: crate::PowerRole) {
        self.header_template = self.header_template.with_port_power_role(power_role);
    }

    /// Set the capabilities against which received requests are resolved.
    pub fn set_pdo_state(&mut self, capabilities: Option<SourceCapabilities>) {
        self.pdo_state = capabilities;
    }

    /// The header template for messages towards the given endpoint.
    ///
    /// Cable plugs do not see port roles; bit 8 carries the cable plug
    /// indication (zero, we are a port) and the data role bit is reserved.
    fn template_for(&self, sop: SopTarget) -> Header {
        match sop {
            SopTarget::Sop => self.header_template,
            SopTarget::SopPrime | SopTarget::SopDoublePrime => {
                Header(0).with_spec_revision(self.spec_revision())
            }
        }
    }

    fn get_message_buffer() -> [u8; MAX_FRAME_SIZE] {
        [0u8; MAX_FRAME_SIZE]
    }

    /// Get a timer future for a given type.
    pub fn get_timer(timer_type: TimerType) -> impl Future<Output = ()> {
        TimerType::get_timer::<TIMER>(timer_type)
    }

    /// Receive a single frame from the driver, without protocol handling.
    async fn receive_frame(&mut self) -> Result<(SopTarget, [u8; MAX_FRAME_SIZE], usize), RxError> {
        loop {
            let mut buffer = Self::get_message_buffer();

            match self.driver.receive(&mut buffer).await {
                Ok((sop, length)) => {
                    if length < 2 {
                        continue;
                    }
                    return Ok((sop, buffer, length));
                }
                Err(DriverRxError::Discarded) => continue,
                Err(DriverRxError::HardReset) => return Err(RxError::HardReset),
            }
        }
    }

    async fn transmit_inner(&mut self, sop: SopTarget, buffer: &[u8]) -> Result<(), TxError> {
        loop {
            match self.driver.transmit(sop, buffer).await {
                Ok(_) => return Ok(()),
                Err(DriverTxError::HardReset) => return Err(TxError::HardReset),
                Err(DriverTxError::Discarded) => {
                    // Collision with an incoming message. Retry transmission.
                }
            }
        }
    }

    /// Wait until a GoodCrc message is received on the endpoint, or a timeout occurs.
    async fn wait_for_good_crc(&mut self, sop: SopTarget) -> Result<(), RxError> {
        trace!("Wait for GoodCrc on {:?}", sop);

        let receive_fut = async {
            loop {
                let (rx_sop, buffer, _) = self.receive_frame().await?;
                let Ok(header) = Header::from_bytes(&buffer[..2]) else {
                    continue;
                };

                if rx_sop != sop {
                    continue;
                }

                return if matches!(
                    header.message_type(),
                    MessageType::Control(ControlMessageType::GoodCRC)
                ) {
                    let counters = &mut self.counters[sop.index()];
                    trace!(
                        "Received GoodCrc, TX message count: {}, expected: {}",
                        header.message_id(),
                        counters.tx_message.value()
                    );
                    if header.message_id() == counters.tx_message.value() {
                        // See spec, [6.7.1.1]
                        counters.retry.reset();
                        _ = counters.tx_message.increment();
                        Ok(())
                    } else {
                        // A different transmitted message was acknowledged.
                        Err(RxError::UnsupportedMessage)
                    }
                } else {
                    // Any other message while waiting for GoodCrc means the
                    // transmission collided; let the retry logic handle it.
                    Err(RxError::ReceiveTimeout)
                };
            }
        };

        let timeout_fut = Self::get_timer(TimerType::CRCReceive);

        match select(timeout_fut, receive_fut).await {
            Either::First(_) => Err(RxError::ReceiveTimeout),
            Either::Second(receive_result) => receive_result,
        }
    }

    /// Transmit a raw frame with GoodCrc checking and bounded retry.
    async fn transmit_with_retry(&mut self, sop: SopTarget, buffer: &[u8]) -> Result<(), ProtocolError> {
        self.counters[sop.index()].retry.reset();

        loop {
            self.transmit_inner(sop, buffer).await?;

            match self.wait_for_good_crc(sop).await {
                Ok(()) => {
                    trace!("Transmit success on {:?}", sop);
                    return Ok(());
                }
                Err(RxError::ReceiveTimeout) => match self.counters[sop.index()].retry.increment() {
                    Ok(_) => continue,
                    Err(CounterError::Overrun) => return Err(ProtocolError::TransmitRetriesExceeded(sop)),
                },
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Transmit a message to the port partner or a cable plug.
    ///
    // GoodCrc message transmission is handled separately.
    // See `transmit_good_crc()` instead.
    pub async fn transmit(&mut self, sop: SopTarget, message: Message) -> Result<(), ProtocolError> {
        debug_assert!(!matches!(
            message.header.message_type(),
            MessageType::Control(ControlMessageType::GoodCRC)
        ));

        trace!("Transmit message {:?} on {:?}", message.header, sop);

        let mut buffer = Self::get_message_buffer();
        let size = message.to_bytes(&mut buffer);

        self.transmit_with_retry(sop, &buffer[..size]).await
    }

    /// Send a GoodCrc message for the last accepted message on the endpoint.
    async fn transmit_good_crc(&mut self, sop: SopTarget) -> Result<(), ProtocolError> {
        // A message must have been received on the endpoint before.
        let rx_message = self.counters[sop.index()].rx_message.unwrap();
        trace!("Transmit GoodCrc for RX message count {}", rx_message.value());

        let mut buffer = Self::get_message_buffer();

        let size = Message::new(Header::new_control(
            self.template_for(sop),
            rx_message,
            ControlMessageType::GoodCRC,
        ))
        .to_bytes(&mut buffer);

        Ok(self.transmit_inner(sop, &buffer[..size]).await?)
    }

    /// Updates the received message counter for the endpoint.
    ///
    /// If receiving the first message after protocol layer reset, copy its ID.
    /// Otherwise, compare the received ID with the stored ID. If they are equal, this is a retransmission.
    ///
    /// Returns `true`, if this was a retransmission.
    fn update_rx_message_counter(&mut self, sop: SopTarget, message_id: u8) -> bool {
        match self.counters[sop.index()].rx_message.as_mut() {
            None => {
                trace!(
                    "First message after reset on {:?} with RX counter value {}",
                    sop, message_id
                );
                self.counters[sop.index()].rx_message =
                    Some(Counter::new_from_value(CounterType::MessageId, message_id));
                false
            }
            Some(counter) => {
                if message_id == counter.value() {
                    trace!("Received retransmission of RX counter value {}", counter.value());
                    true
                } else {
                    counter.set(message_id);
                    false
                }
            }
        }
    }

    /// Receive a message on any endpoint, acknowledging and de-duplicating it.
    ///
    /// Chunked extended messages are assembled transparently, requesting
    /// further chunks from the sender as needed.
    pub async fn receive_message(&mut self) -> Result<(SopTarget, Message), ProtocolError> {
        loop {
            let (sop, buffer, length) = self.receive_frame().await?;
            let header = Header::from_bytes(&buffer[..2])?;

            // Update specification revision, based on received SOP frames.
            if sop == SopTarget::Sop {
                if let Ok(revision) = header.spec_revision() {
                    self.header_template = self.header_template.with_spec_revision(revision);
                }
            }

            match header.message_type() {
                MessageType::Control(ControlMessageType::GoodCRC) => {
                    // Stale acknowledgment, e.g. for a message whose GoodCrc
                    // window already timed out. Ignore.
                    continue;
                }
                MessageType::Control(ControlMessageType::SoftReset) => return Err(RxError::SoftReset.into()),
                MessageType::Control(ControlMessageType::Reserved)
                | MessageType::Data(DataMessageType::Reserved) => {
                    let is_retransmission = self.update_rx_message_counter(sop, header.message_id());
                    self.transmit_good_crc(sop).await?;
                    if is_retransmission {
                        continue;
                    }
                    return Err(RxError::UnsupportedMessage.into());
                }
                _ => (),
            }

            // See spec, [6.7.1.2]
            let is_retransmission = self.update_rx_message_counter(sop, header.message_id());
            self.transmit_good_crc(sop).await?;

            if is_retransmission {
                continue;
            }

            match Message::parse_with_state(&buffer[..length], &self.pdo_state) {
                Ok(message) => return Ok((sop, message)),
                Err(ParseError::ChunkedExtendedMessage) => {
                    match self.process_extended_chunk(sop, &buffer[..length]).await? {
                        Some(message) => return Ok((sop, message)),
                        None => continue,
                    }
                }
                Err(_) => return Err(RxError::UnsupportedMessage.into()),
            }
        }
    }

    /// Feed one frame of a chunked extended transfer into the assembler.
    ///
    /// Returns the assembled message once complete. Transmits a chunk request
    /// and waits for the next chunk otherwise.
    async fn process_extended_chunk(
        &mut self,
        sop: SopTarget,
        frame: &[u8],
    ) -> Result<Option<Message>, ProtocolError> {
        let (mut header, mut ext_header, chunk) = Message::parse_extended_chunk(frame)?;
        let mut chunk_buffer = Self::get_message_buffer();
        let mut chunk_len = chunk.len();
        chunk_buffer[..chunk_len].copy_from_slice(chunk);

        loop {
            match self.assembler.process_chunk(header, ext_header, &chunk_buffer[..chunk_len]) {
                Ok(ChunkResult::Complete(data)) => {
                    let message_type: ExtendedMessageType = header.message_type_raw().into();
                    self.assembler.reset();

                    let mut message = Message::new(header);
                    message.payload = Some(Payload::Extended(Extended::parse(message_type, &data)?));
                    return Ok(Some(message));
                }
                Ok(ChunkResult::NeedMoreChunks(next_chunk)) => {
                    let message_type: ExtendedMessageType = header.message_type_raw().into();
                    self.transmit_chunk_request(sop, message_type, next_chunk).await?;

                    // An unresponsive chunk sender aborts the transfer.
                    let selected = {
                        let receive_fut = self.receive_frame();
                        let timeout_fut = Self::get_timer(TimerType::ChunkSenderResponse);
                        select(timeout_fut, receive_fut).await
                    };

                    let (rx_sop, buffer, length) = match selected {
                        Either::First(_) => {
                            self.assembler.reset();
                            return Err(RxError::ReceiveTimeout.into());
                        }
                        Either::Second(result) => result?,
                    };

                    if rx_sop != sop {
                        self.assembler.reset();
                        return Err(ProtocolError::UnexpectedMessage);
                    }

                    let (next_header, next_ext_header, next_chunk_data) =
                        Message::parse_extended_chunk(&buffer[..length])?;

                    let is_retransmission =
                        self.update_rx_message_counter(sop, next_header.message_id());
                    self.transmit_good_crc(sop).await?;
                    if is_retransmission {
                        continue;
                    }

                    header = next_header;
                    ext_header = next_ext_header;
                    chunk_len = next_chunk_data.len();
                    let (dst, src) = (&mut chunk_buffer[..chunk_len], &buffer[4..4 + chunk_len]);
                    dst.copy_from_slice(src);
                }
                Ok(ChunkResult::ChunkRequested(_)) => {
                    // A chunk request outside of an extended transmission.
                    self.assembler.reset();
                    return Err(ProtocolError::UnexpectedMessage);
                }
                Err(error) => {
                    self.assembler.reset();
                    return Err(error.into());
                }
            }
        }
    }

    /// Transmit a chunk request for the given chunk number.
    async fn transmit_chunk_request(
        &mut self,
        sop: SopTarget,
        message_type: ExtendedMessageType,
        chunk_number: u8,
    ) -> Result<(), ProtocolError> {
        let header = Header::new_extended(
            self.template_for(sop),
            self.counters[sop.index()].tx_message,
            message_type,
            1,
        );

        let mut buffer = Self::get_message_buffer();
        let mut size = header.to_bytes(&mut buffer);
        size += ChunkedMessageAssembler::build_chunk_request_header(chunk_number).to_bytes(&mut buffer[size..]);
        // Pad to a full data object.
        size += 2;

        self.transmit_with_retry(sop, &buffer[..size]).await
    }

    /// Wait until a message of one of the chosen types is received on the
    /// endpoint, or a timeout occurs.
    ///
    /// Messages on other endpoints are acknowledged and dropped.
    pub async fn receive_message_type(
        &mut self,
        sop: SopTarget,
        message_types: &[MessageType],
        timer_type: TimerType,
    ) -> Result<Message, ProtocolError> {
        // GoodCrc message reception is handled separately.
        // See `wait_for_good_crc()` instead.
        debug_assert!(
            !message_types.contains(&MessageType::Control(ControlMessageType::GoodCRC))
        );

        let receive_fut = async {
            loop {
                let (rx_sop, message) = self.receive_message().await?;

                if rx_sop != sop {
                    trace!("Dropping message on unexpected endpoint {:?}", rx_sop);
                    continue;
                }

                return if message_types.contains(&message.header.message_type()) {
                    Ok(message)
                } else {
                    Err(ProtocolError::UnexpectedMessage)
                };
            }
        };

        let timeout_fut = Self::get_timer(timer_type);

        match select(timeout_fut, receive_fut).await {
            Either::First(_) => Err(RxError::ReceiveTimeout.into()),
            Either::Second(receive_result) => receive_result,
        }
    }

    /// Perform a hard-reset procedure.
    ///
    // See spec, [6.7.1.1]
    pub async fn hard_reset(&mut self) -> Result<(), ProtocolError> {
        self.reset();

        loop {
            match self.driver.transmit_hard_reset().await {
                Ok(_) | Err(DriverTxError::HardReset) => break,
                Err(DriverTxError::Discarded) => (),
            }
        }

        Ok(())
    }

    /// Wait for VBUS to be available.
    pub async fn wait_for_vbus(&mut self) {
        self.driver.wait_for_vbus().await
    }

    /// Wait for the source to provide its capabilities.
    ///
    /// Accepts both Source_Capabilities and (in EPR mode) the chunked
    /// EPR_Source_Capabilities message.
    pub async fn wait_for_source_capabilities(&mut self) -> Result<Message, ProtocolError> {
        self.receive_message_type(
            SopTarget::Sop,
            &[
                MessageType::Data(DataMessageType::SourceCapabilities),
                MessageType::Extended(ExtendedMessageType::EprSourceCapabilities),
            ],
            TimerType::SinkWaitCap,
        )
        .await
    }

    /// Transmit a control message of the provided type.
    pub async fn transmit_control_message(
        &mut self,
        sop: SopTarget,
        control_message_type: ControlMessageType,
    ) -> Result<(), ProtocolError> {
        let message = Message::new(Header::new_control(
            self.template_for(sop),
            self.counters[sop.index()].tx_message,
            control_message_type,
        ));

        self.transmit(sop, message).await
    }

    /// Transmit a data message with the provided payload.
    pub async fn transmit_data_message(&mut self, data: Data) -> Result<(), ProtocolError> {
        let message_type = match &data {
            Data::SourceCapabilities(_) => DataMessageType::SourceCapabilities,
            Data::SinkCapabilities(_) => DataMessageType::SinkCapabilities,
            Data::Request(request::PowerSource::EprRequest(_)) => DataMessageType::EprRequest,
            Data::Request(_) => DataMessageType::Request,
            Data::EprMode(_) => DataMessageType::EprMode,
            Data::Bist(_) => DataMessageType::Bist,
            Data::VendorDefined(_) => DataMessageType::VendorDefined,
            Data::Unknown => return Err(ProtocolError::UnexpectedMessage),
        };

        let header = Header::new_data(
            self.header_template,
            self.counters[SopTarget::Sop.index()].tx_message,
            message_type,
            data.num_objects(),
        );

        self.transmit(SopTarget::Sop, Message::new_with_data(header, data)).await
    }

    /// Request a certain power level from the source.
    pub async fn request_power(&mut self, supply: request::PowerSource) -> Result<(), ProtocolError> {
        self.transmit_data_message(Data::Request(supply)).await
    }

    /// Transmit an EPR mode data message.
    pub async fn transmit_epr_mode(
        &mut self,
        action: message::data::epr_mode::Action,
        data: u8,
    ) -> Result<(), ProtocolError> {
        let epr_mode = message::data::epr_mode::EprModeDataObject::default()
            .with_action(action)
            .with_data(data);

        self.transmit_data_message(Data::EprMode(epr_mode)).await
    }

    /// Transmit sink capabilities.
    pub async fn transmit_sink_capabilities(
        &mut self,
        capabilities: message::data::sink_capabilities::SinkCapabilities,
    ) -> Result<(), ProtocolError> {
        self.transmit_data_message(Data::SinkCapabilities(capabilities)).await
    }

    /// Transmit source capabilities.
    pub async fn transmit_source_capabilities(
        &mut self,
        capabilities: SourceCapabilities,
    ) -> Result<(), ProtocolError> {
        self.transmit_data_message(Data::SourceCapabilities(capabilities)).await
    }

    /// Transmit a vendor defined message on the given endpoint.
    pub async fn transmit_vdm(
        &mut self,
        sop: SopTarget,
        header: message::data::vendor_defined::VdmHeader,
        objects: heapless::Vec<u32, 7>,
    ) -> Result<(), ProtocolError> {
        let data = Data::VendorDefined((header, objects));

        let message_header = Header::new_data(
            self.template_for(sop),
            self.counters[sop.index()].tx_message,
            DataMessageType::VendorDefined,
            data.num_objects(),
        );

        self.transmit(sop, Message::new_with_data(message_header, data)).await
    }

    /// Transmit an extended message, chunking it when it exceeds one frame.
    ///
    /// Subsequent chunks are sent on demand, as the receiver requests them.
    /// An unresponsive receiver aborts the transfer.
    pub async fn transmit_extended(
        &mut self,
        sop: SopTarget,
        message_type: ExtendedMessageType,
        extended: &Extended,
    ) -> Result<(), ProtocolError> {
        let mut data = [0u8; message::extended::chunked::MAX_EXTENDED_MSG_LEN];
        let data_size = extended.to_bytes(&mut data) as u16;

        let sender = ChunkedMessageSender::new(&data[..data_size as usize]);
        let total_chunks = sender.total_chunks();

        let (ext_header, chunk) = sender.get_chunk(0).unwrap();
        self.transmit_extended_frame(sop, message_type, ext_header, chunk).await?;

        let mut next_chunk = 1;
        while next_chunk < total_chunks {
            let requested = self.wait_for_chunk_request(sop, message_type).await?;

            let Some((ext_header, chunk)) = sender.get_chunk(requested) else {
                return Err(ProtocolError::UnexpectedMessage);
            };
            self.transmit_extended_frame(sop, message_type, ext_header, chunk).await?;
            next_chunk = requested + 1;
        }

        Ok(())
    }

    /// Transmit a single frame of an extended message.
    async fn transmit_extended_frame(
        &mut self,
        sop: SopTarget,
        message_type: ExtendedMessageType,
        ext_header: ExtendedHeader,
        chunk: &[u8],
    ) -> Result<(), ProtocolError> {
        // Extended header and chunk data, padded to full data objects.
        let num_objects = (2 + chunk.len()).div_ceil(4) as u8;

        let header = Header::new_extended(
            self.template_for(sop),
            self.counters[sop.index()].tx_message,
            message_type,
            num_objects,
        );

        let mut buffer = Self::get_message_buffer();
        let mut size = header.to_bytes(&mut buffer);
        size += ext_header.to_bytes(&mut buffer[size..]);
        buffer[size..size + chunk.len()].copy_from_slice(chunk);
        size += chunk.len();

        self.transmit_with_retry(sop, &buffer[..size]).await
    }

    /// Wait for the receiver of a chunked transfer to request the next chunk.
    async fn wait_for_chunk_request(
        &mut self,
        sop: SopTarget,
        message_type: ExtendedMessageType,
    ) -> Result<u8, ProtocolError> {
        let receive_fut = async {
            loop {
                let (rx_sop, buffer, length) = self.receive_frame().await?;

                if rx_sop != sop {
                    continue;
                }

                let Ok((header, ext_header, _)) = Message::parse_extended_chunk(&buffer[..length]) else {
                    continue;
                };

                let is_retransmission = self.update_rx_message_counter(sop, header.message_id());
                self.transmit_good_crc(sop).await?;
                if is_retransmission {
                    continue;
                }

                if header.extended()
                    && ext_header.request_chunk()
                    && ExtendedMessageType::from(header.message_type_raw()) == message_type
                {
                    return Ok(ext_header.chunk_number());
                }

                return Err(ProtocolError::UnexpectedMessage);
            }
        };

        let timeout_fut = Self::get_timer(TimerType::ChunkSenderRequest);

        match select(timeout_fut, receive_fut).await {
            Either::First(_) => Err(RxError::ReceiveTimeout.into()),
            Either::Second(result) => result,
        }
    }

    /// Transmit an extended control message.
    pub async fn transmit_extended_control_message(
        &mut self,
        control_type: message::extended::extended_control::ExtendedControlMessageType,
    ) -> Result<(), ProtocolError> {
        let extended = Extended::ExtendedControl(
            message::extended::extended_control::ExtendedControl::default().with_message_type(control_type),
        );

        self.transmit_extended(SopTarget::Sop, ExtendedMessageType::ExtendedControl, &extended)
            .await
    }

    /// Transmit EPR sink capabilities.
    pub async fn transmit_epr_sink_capabilities(
        &mut self,
        capabilities: message::data::sink_capabilities::SinkCapabilities,
    ) -> Result<(), ProtocolError> {
        let extended = Extended::EprSinkCapabilities(capabilities.0);
        self.transmit_extended(SopTarget::Sop, ExtendedMessageType::EprSinkCapabilities, &extended)
            .await
    }

    /// Transmit EPR source capabilities, chunked as necessary.
    pub async fn transmit_epr_source_capabilities(
        &mut self,
        capabilities: SourceCapabilities,
    ) -> Result<(), ProtocolError> {
        let extended = Extended::EprSourceCapabilities(capabilities.0);
        self.transmit_extended(SopTarget::Sop, ExtendedMessageType::EprSourceCapabilities, &extended)
            .await
    }

    /// Transmit a manufacturer info response.
    pub async fn transmit_manufacturer_info(
        &mut self,
        info: message::extended::manufacturer_info::ManufacturerInfo,
    ) -> Result<(), ProtocolError> {
        let extended = Extended::ManufacturerInfo(info);
        self.transmit_extended(SopTarget::Sop, ExtendedMessageType::ManufacturerInfo, &extended)
            .await
    }

    /// Perform a soft reset of the given endpoint: send Soft_Reset and await Accept.
    pub async fn soft_reset_endpoint(&mut self, sop: SopTarget) -> Result<(), ProtocolError> {
        self.reset_endpoint(sop);
        self.transmit_control_message(sop, ControlMessageType::SoftReset).await?;

        self.receive_message_type(
            sop,
            &[MessageType::Control(ControlMessageType::Accept)],
            TimerType::SenderResponse,
        )
        .await?;

        Ok(())
    }

    /// Delay the start of a sink-initiated AMS.
    ///
    /// Under PD 3.x collision avoidance, a sink waits out the SinkTx window
    /// before starting an AMS of its own.
    pub async fn sink_tx_delay(&mut self) {
        if matches!(self.spec_revision(), message::header::SpecificationRevision::R3_X) {
            Self::get_timer(TimerType::SinkTx).await;
        }
    }
}
