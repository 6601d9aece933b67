//! Policy engine for the implementation of a source.
//!
//! Advertises capabilities, negotiates requests, drives the supply through
//! contract transitions, and serves swaps, resets, vendor messages and EPR
//! mode entry for an attached sink.
use core::marker::PhantomData;

use embassy_futures::select::{Either, Either3, select, select3};
use heapless::Vec;
use pdport_traits::{Driver, SopTarget};

use super::cable::{CableDiscovery, CableIdentity};
use super::device_policy_manager::{DevicePolicyManager, Event};
use crate::config::PortConfig;
use crate::counters::{Counter, CounterType};
use crate::data_reset::DataResetState;
use crate::dpm::{self, Command, Contract, Decision, Response, ResponseStatus, SwapKind, VdmBuffer};
use crate::protocol_layer::message::data::epr_mode::{self, Action};
use crate::protocol_layer::message::data::request::PowerSource;
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::data::vendor_defined::{CableMaxVoltage, VdmHeader};
use crate::protocol_layer::message::data::{Data, bist};
use crate::protocol_layer::message::extended::extended_control::ExtendedControlMessageType;
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload, extended};
use crate::protocol_layer::{ProtocolError, ProtocolLayer, RxError, TxError};
use crate::timers::{Timer, TimerType};
use crate::{DataRole, PowerRole};

#[cfg(test)]
mod tests;

/// Power range the port operates in.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Spr,
    Epr,
}

/// Source policy engine states.
#[derive(Debug, Clone)]
enum State {
    /// Default state at startup.
    Startup,
    /// Interrogating the cable marker before advertising capabilities.
    CableDiscovery,
    /// Advertising source capabilities.
    SendCapabilities,
    /// Waiting between capability advertisements.
    Discovery,
    /// A request was received and is judged against the advertisement.
    NegotiateCapability(PowerSource),
    /// Adjusting the supply to an accepted request.
    TransitionSupply(PowerSource),
    /// An explicit contract is in place.
    Ready,
    SendNotSupported,
    SendSoftReset,
    SoftReset,
    HardReset,
    TransitionToDefault,
    /// Answer Get_Sink_Cap / EPR_Get_Sink_Cap from the dual-role sink list.
    GiveSinkCap(bool),
    GiveManufacturerInfo,
    /// Ask the partner for its capabilities.
    GetPartnerCap(bool),

    /// A swap offer was received.
    EvaluateSwap(SwapKind),
    /// The application asked to initiate a swap.
    SendSwap(SwapKind),

    /// The partner initiated a Data_Reset.
    DataResetReceived,
    /// The application asked to initiate a Data_Reset.
    SendDataReset,

    /// A vendor defined message was received and is relayed for evaluation.
    EvaluateVdm(VdmHeader, Vec<u32, 7>),
    /// The application asked to send a vendor defined message.
    SendVdm(VdmBuffer),

    /// BIST carrier mode for tBISTContMode.
    BistCarrierMode,
    /// BIST test data: discard all traffic until reset.
    BistTestData,

    /// The sink asked to enter EPR mode; judge the entry conditions.
    EprEvaluateEntry(u8),
    /// Advertise the EPR capability set.
    EprSendCapabilities,
}

/// Reasons for the engine to hand control back to the port.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Exit {
    /// The power role was swapped; the port shall run the sink engine.
    PowerRoleSwap,
    /// The partner never answered a capability advertisement; it does not
    /// speak PD. The port stays attached with the Type-C default contract.
    PdIncapablePartner,
    /// A Type-C level command must be applied by the port.
    TypeCCommand(Command),
}

/// Errors that can occur in the source policy engine state machine.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The port partner is unresponsive.
    PortPartnerUnresponsive,
    /// A protocol error has occured.
    Protocol(ProtocolError),
}

impl From<ProtocolError> for Error {
    fn from(protocol_error: ProtocolError) -> Self {
        Error::Protocol(protocol_error)
    }
}

/// Implementation of the source policy engine.
#[derive(Debug)]
pub struct Source<DRIVER: Driver, TIMER: Timer, DPM: DevicePolicyManager> {
    device_policy_manager: DPM,
    pub(crate) protocol_layer: ProtocolLayer<DRIVER, TIMER>,
    config: PortConfig,
    pub(crate) state: State,
    caps_counter: Counter,
    hard_reset_counter: Counter,
    mode: Mode,
    /// The capability set most recently advertised.
    advertised: SourceCapabilities,
    /// The request the current explicit contract grants, if any.
    granted: Option<PowerSource>,
    /// Identity of the attached cable, once discovered.
    cable: Option<CableIdentity>,
    cable_discovery: CableDiscovery,
    /// Whether this port currently sources VCONN.
    vconn_source: bool,
    /// Entered through a power role swap: ramp VBUS before advertising.
    swap_entry: bool,
    /// The command currently being executed, for completion reporting.
    pending_command: Option<Command>,

    _timer: PhantomData<TIMER>,
}

impl<DRIVER: Driver, TIMER: Timer, DPM: DevicePolicyManager> Source<DRIVER, TIMER, DPM> {
    fn new_protocol_layer(driver: DRIVER) -> ProtocolLayer<DRIVER, TIMER> {
        let header = Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X);
        ProtocolLayer::new(driver, header)
    }

    /// Create a new source policy engine with a given `driver`.
    pub fn new(driver: DRIVER, device_policy_manager: DPM, config: PortConfig) -> Self {
        let advertised = config.spr_source_capabilities();
        Self {
            device_policy_manager,
            protocol_layer: Self::new_protocol_layer(driver),
            config,
            state: State::Startup,
            caps_counter: Counter::new(CounterType::Caps),
            hard_reset_counter: Counter::new(CounterType::HardReset),
            mode: Mode::Spr,
            advertised,
            granted: None,
            cable: None,
            cable_discovery: CableDiscovery::new(),
            vconn_source: true,
            swap_entry: false,
            pending_command: None,
            _timer: PhantomData,
        }
    }

    /// Create a source engine that takes over after a power role swap.
    pub fn new_after_power_role_swap(driver: DRIVER, device_policy_manager: DPM, config: PortConfig) -> Self {
        let mut source = Self::new(driver, device_policy_manager, config);
        source.swap_entry = true;
        source.vconn_source = false;
        source
    }

    /// Tear down the engine, returning driver and device policy manager.
    pub fn into_parts(self) -> (DRIVER, DPM) {
        (self.protocol_layer.into_driver(), self.device_policy_manager)
    }

    /// Report completion of the command currently being executed, if any.
    async fn complete_command(&mut self, status: ResponseStatus) {
        if let Some(command) = self.pending_command.take() {
            self.device_policy_manager
                .command_complete(Response { command, status })
                .await;
        }
    }

    /// Send Not_Supported (PD 3.x) or Reject (PD 2.0).
    async fn transmit_not_supported(&mut self) -> Result<(), ProtocolError> {
        let message_type = match self.protocol_layer.spec_revision() {
            SpecificationRevision::R3_X => ControlMessageType::NotSupported,
            _ => ControlMessageType::Reject,
        };

        self.protocol_layer
            .transmit_control_message(SopTarget::Sop, message_type)
            .await
    }

    /// Run a single step in the policy engine state machine.
    pub(crate) async fn run_step(&mut self) -> Result<Option<Exit>, Error> {
        let result = self.update_state().await;

        let error = match result {
            Ok(exit) => return Ok(exit),
            Err(Error::Protocol(protocol_error)) => protocol_error,
            Err(other) => {
                error!("Unrecoverable error {:?} in source state transition", other);
                return Err(other);
            }
        };

        let new_state = match (&self.state, error) {
            // Hard reset signaled by the driver itself.
            (_, ProtocolError::RxError(RxError::HardReset) | ProtocolError::TxError(TxError::HardReset)) => {
                Some(State::TransitionToDefault)
            }

            // Soft reset requested by the port partner.
            (_, ProtocolError::RxError(RxError::SoftReset)) => Some(State::SoftReset),

            // If the Soft_Reset message itself fails, escalate to hard reset.
            (State::SoftReset | State::SendSoftReset, ProtocolError::TransmitRetriesExceeded(_)) => {
                Some(State::HardReset)
            }

            // The sink did not answer the advertisement in time.
            (State::SendCapabilities, ProtocolError::RxError(RxError::ReceiveTimeout)) => Some(State::HardReset),

            // No GoodCRC for the advertisement: likely a PD-incapable sink.
            (State::SendCapabilities, ProtocolError::TransmitRetriesExceeded(_)) => Some(State::Discovery),

            // Any protocol error during the supply transition is fatal for
            // the contract.
            (State::TransitionSupply(_), _) => Some(State::HardReset),

            // Unexpected messages inside an AMS demand a soft reset.
            (_, ProtocolError::UnexpectedMessage) => Some(State::SendSoftReset),

            // Unsupported or malformed messages in Ready are answered
            // without a reset.
            (State::Ready, ProtocolError::RxError(RxError::UnsupportedMessage) | ProtocolError::Parse(_)) => {
                Some(State::SendNotSupported)
            }

            // Transmission failure (no GoodCRC after retries) triggers a soft reset.
            (_, ProtocolError::TransmitRetriesExceeded(_)) => Some(State::SendSoftReset),

            (_, error) => {
                error!("Protocol error {:?} in source state transition", error);
                None
            }
        };

        if let Some(state) = new_state {
            self.state = state
        }

        Ok(None)
    }

    /// Run the source's state machine continuously.
    ///
    /// Returns when the port must take over, or with an unrecoverable error.
    pub async fn run(&mut self) -> Result<Exit, Error> {
        loop {
            if let Some(exit) = self.run_step().await? {
                return Ok(exit);
            }
        }
    }

    /// Dispatch a message received in the Ready state.
    fn dispatch_ready_message(&mut self, message: Message) -> State {
        match message.header.message_type() {
            MessageType::Data(DataMessageType::Request) | MessageType::Data(DataMessageType::EprRequest) => {
                if let Some(Payload::Data(Data::Request(request))) = message.payload {
                    State::NegotiateCapability(request)
                } else {
                    State::SendNotSupported
                }
            }
            MessageType::Control(ControlMessageType::GetSourceCap) => {
                self.caps_counter.reset();
                State::SendCapabilities
            }
            MessageType::Control(ControlMessageType::GetSinkCap) => State::GiveSinkCap(false),
            MessageType::Data(DataMessageType::EprMode) => {
                let Some(Payload::Data(Data::EprMode(epr_mode))) = message.payload else {
                    return State::SendNotSupported;
                };

                match epr_mode.action() {
                    Ok(Action::Enter) => State::EprEvaluateEntry(epr_mode.data()),
                    Ok(Action::Exit) => {
                        self.mode = Mode::Spr;
                        self.caps_counter.reset();
                        State::SendCapabilities
                    }
                    _ => State::SendSoftReset,
                }
            }
            MessageType::Extended(ExtendedMessageType::ExtendedControl) => {
                if let Some(Payload::Extended(extended::Extended::ExtendedControl(ctrl))) = &message.payload {
                    match ctrl.message_type() {
                        // Keep-alives are acknowledged in the Ready state.
                        Ok(ExtendedControlMessageType::EprKeepAlive) => State::Ready,
                        Ok(ExtendedControlMessageType::EprGetSourceCap) => State::EprSendCapabilities,
                        Ok(ExtendedControlMessageType::EprGetSinkCap) => State::GiveSinkCap(true),
                        _ => State::SendNotSupported,
                    }
                } else {
                    State::SendNotSupported
                }
            }
            MessageType::Extended(ExtendedMessageType::GetManufacturerInfo) => State::GiveManufacturerInfo,
            MessageType::Control(ControlMessageType::DrSwap) => State::EvaluateSwap(SwapKind::DataRole),
            MessageType::Control(ControlMessageType::PrSwap) => State::EvaluateSwap(SwapKind::PowerRole),
            MessageType::Control(ControlMessageType::VconnSwap) => State::EvaluateSwap(SwapKind::Vconn),
            MessageType::Control(ControlMessageType::FrSwap) => State::EvaluateSwap(SwapKind::FastRole),
            MessageType::Control(ControlMessageType::DataReset) => State::DataResetReceived,
            MessageType::Data(DataMessageType::VendorDefined) => {
                if let Some(Payload::Data(Data::VendorDefined((header, objects)))) = message.payload {
                    State::EvaluateVdm(header, objects)
                } else {
                    State::SendNotSupported
                }
            }
            MessageType::Data(DataMessageType::Bist) => {
                if let Some(Payload::Data(Data::Bist(object))) = message.payload {
                    match object.mode() {
                        bist::BistMode::CarrierMode2 => State::BistCarrierMode,
                        bist::BistMode::TestData => State::BistTestData,
                        bist::BistMode::Other(_) => State::Ready,
                    }
                } else {
                    State::SendNotSupported
                }
            }
            _ => State::SendNotSupported,
        }
    }

    /// Map a device policy event to the next state.
    fn dispatch_command(&mut self, command: Command) -> Result<State, Option<Exit>> {
        self.pending_command = Some(command.clone());

        Ok(match command {
            Command::HardReset => State::HardReset,
            Command::SoftReset(_) => State::SendSoftReset,
            Command::DataReset => State::SendDataReset,
            Command::PowerRoleSwap => State::SendSwap(SwapKind::PowerRole),
            Command::DataRoleSwap => State::SendSwap(SwapKind::DataRole),
            Command::VconnSwap => State::SendSwap(SwapKind::Vconn),
            Command::FastRoleSwap => State::SendSwap(SwapKind::FastRole),
            Command::GetSourceCapabilities => State::GetPartnerCap(true),
            Command::GetSinkCapabilities => State::GetPartnerCap(false),
            Command::SendVdm(buffer) => State::SendVdm(buffer),
            Command::EnterEprMode | Command::ExitEprMode | Command::RequestPower(_) => {
                // Sink-role commands are invalid on a source port; leave the
                // pending command in place for failure reporting.
                warn!("Rejecting sink-role command on source port");
                return Err(None);
            }
            Command::SetRp(_) | Command::PortDisable | Command::ErrorRecovery => {
                let command = self.pending_command.take().unwrap();
                return Err(Some(Exit::TypeCCommand(command)));
            }
        })
    }

    /// Validate an incoming request against the advertisement.
    ///
    /// Distinguishes malformed requests (answered with Not_Supported) from
    /// EPR protocol violations (hard reset).
    fn validate_request(&self, request: &PowerSource) -> Result<(), State> {
        let position = request.object_position();
        if position == 0 || usize::from(position) > self.advertised.pdos().len() {
            return Err(State::SendNotSupported);
        }

        match request {
            PowerSource::Unknown(_) => Err(State::SendNotSupported),
            PowerSource::EprRequest(epr) => {
                if self.mode != Mode::Epr {
                    return Err(State::HardReset);
                }

                // The copied PDO must match the advertised one exactly.
                let advertised = self.advertised.pdos()[usize::from(position) - 1];
                if epr.pdo.to_raw() != advertised.to_raw() {
                    warn!("EPR request PDO mismatch at position {}", position);
                    return Err(State::HardReset);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn update_state(&mut self) -> Result<Option<Exit>, Error> {
        let state = self.state.clone();

        let new_state = match state {
            State::Startup => {
                self.protocol_layer.reset();
                self.mode = Mode::Spr;
                self.granted = None;
                self.caps_counter.reset();
                self.advertised = self.config.spr_source_capabilities();
                self.protocol_layer.set_pdo_state(Some(self.advertised.clone()));
                self.complete_command(ResponseStatus::Aborted).await;

                if self.swap_entry {
                    // New source after a power role swap: ramp VBUS first.
                    self.swap_entry = false;
                    TimerType::get_timer::<TIMER>(TimerType::SwapSourceStart).await;
                    self.device_policy_manager.set_vbus(true).await;
                }

                if self.config.cable_discovery && self.vconn_source && self.cable.is_none() {
                    State::CableDiscovery
                } else {
                    State::SendCapabilities
                }
            }
            State::CableDiscovery => {
                match self.cable_discovery.run(&mut self.protocol_layer).await? {
                    Some(identity) => {
                        self.cable = Some(identity);
                        self.device_policy_manager.notify(&dpm::Event::CableIdentified).await;
                    }
                    None => {
                        self.device_policy_manager
                            .notify(&dpm::Event::CableDiscoveryFailed)
                            .await;
                    }
                }

                State::SendCapabilities
            }
            State::SendCapabilities => {
                if self.caps_counter.increment().is_err() {
                    // The partner never acknowledged any advertisement.
                    info!("Partner does not respond to capability advertisements");
                    return Ok(Some(Exit::PdIncapablePartner));
                }

                self.advertised = match self.mode {
                    Mode::Spr => self.config.spr_source_capabilities(),
                    Mode::Epr => self.config.epr_source_capabilities(),
                };
                self.protocol_layer.set_pdo_state(Some(self.advertised.clone()));
                self.protocol_layer
                    .transmit_source_capabilities(self.advertised.clone())
                    .await?;

                // An acknowledged advertisement proves a PD-capable partner.
                self.hard_reset_counter.reset();
                self.caps_counter.reset();

                let message = self
                    .protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[
                            MessageType::Data(DataMessageType::Request),
                            MessageType::Data(DataMessageType::EprRequest),
                        ],
                        TimerType::SenderResponse,
                    )
                    .await?;

                let Some(Payload::Data(Data::Request(request))) = message.payload else {
                    return Err(ProtocolError::UnexpectedMessage.into());
                };

                State::NegotiateCapability(request)
            }
            State::Discovery => {
                // Advertise again after the capability retry period.
                TimerType::get_timer::<TIMER>(TimerType::SourceCapability).await;
                State::SendCapabilities
            }
            State::NegotiateCapability(request) => {
                if let Err(error_state) = self.validate_request(&request) {
                    error_state
                } else {
                    match self
                        .device_policy_manager
                        .evaluate_request(&request, &self.advertised)
                        .await
                    {
                        Decision::Accept => {
                            self.protocol_layer
                                .transmit_control_message(SopTarget::Sop, ControlMessageType::Accept)
                                .await?;
                            State::TransitionSupply(request)
                        }
                        Decision::Reject => {
                            self.protocol_layer
                                .transmit_control_message(SopTarget::Sop, ControlMessageType::Reject)
                                .await?;

                            if self.granted.is_some() {
                                State::Ready
                            } else {
                                // No contract to fall back to; advertise again.
                                State::Discovery
                            }
                        }
                        Decision::Wait => {
                            self.protocol_layer
                                .transmit_control_message(SopTarget::Sop, ControlMessageType::Wait)
                                .await?;

                            if self.granted.is_some() { State::Ready } else { State::Discovery }
                        }
                    }
                }
            }
            State::TransitionSupply(request) => {
                // Give the sink time to settle on the lower current limit
                // before the supply changes.
                TimerType::get_timer::<TIMER>(TimerType::SourceTransition).await;
                self.device_policy_manager.transition_supply(&request).await;

                self.protocol_layer
                    .transmit_control_message(SopTarget::Sop, ControlMessageType::PsRdy)
                    .await?;

                self.granted = Some(request);

                if let Some(contract) = Contract::from_request(&request, &self.advertised) {
                    self.device_policy_manager
                        .notify(&dpm::Event::ContractNegotiated(contract))
                        .await;
                }

                State::Ready
            }
            State::Ready => {
                // The select borrows disjoint parts of the engine; its
                // outcome is handled after those borrows end.
                let outcome = {
                    let mode = self.mode;
                    let receive_fut = self.protocol_layer.receive_message();
                    let event_fut = self.device_policy_manager.get_event();
                    let keep_alive_watchdog_fut = async {
                        match mode {
                            // A sink in EPR mode must keep the link alive.
                            Mode::Epr => TimerType::get_timer::<TIMER>(TimerType::SourceEPRKeepAlive).await,
                            Mode::Spr => core::future::pending().await,
                        }
                    };

                    select3(receive_fut, event_fut, keep_alive_watchdog_fut).await
                };

                match outcome {
                    Either3::First(message) => {
                        let (sop, message) = message?;
                        if sop != SopTarget::Sop {
                            State::Ready
                        } else {
                            let is_keep_alive = matches!(
                                &message.payload,
                                Some(Payload::Extended(extended::Extended::ExtendedControl(ctrl)))
                                    if ctrl.message_type() == Ok(ExtendedControlMessageType::EprKeepAlive)
                            );

                            if is_keep_alive {
                                self.protocol_layer
                                    .transmit_extended_control_message(ExtendedControlMessageType::EprKeepAliveAck)
                                    .await?;
                                State::Ready
                            } else {
                                self.dispatch_ready_message(message)
                            }
                        }
                    }
                    Either3::Second(event) => match event {
                        Event::Command(command) => match self.dispatch_command(command) {
                            Ok(state) => state,
                            Err(Some(exit)) => return Ok(Some(exit)),
                            Err(None) => {
                                self.complete_command(ResponseStatus::Failed).await;
                                State::Ready
                            }
                        },
                        Event::None => State::Ready,
                    },
                    Either3::Third(_) => {
                        warn!("EPR keep-alive watchdog expired");
                        State::HardReset
                    }
                }
            }
            State::SendNotSupported => {
                self.transmit_not_supported().await?;

                if self.granted.is_some() { State::Ready } else { State::Discovery }
            }
            State::SendSoftReset => {
                self.protocol_layer.reset();

                self.protocol_layer
                    .transmit_control_message(SopTarget::Sop, ControlMessageType::SoftReset)
                    .await?;

                self.protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[MessageType::Control(ControlMessageType::Accept)],
                        TimerType::SenderResponse,
                    )
                    .await?;

                self.device_policy_manager.notify(&dpm::Event::SoftResetSent).await;
                self.granted = None;
                self.caps_counter.reset();

                State::SendCapabilities
            }
            State::SoftReset => {
                self.protocol_layer
                    .transmit_control_message(SopTarget::Sop, ControlMessageType::Accept)
                    .await?;

                self.protocol_layer.reset();
                self.granted = None;
                self.caps_counter.reset();

                State::SendCapabilities
            }
            State::HardReset => {
                // The hard-reset counter increments exactly once per cycle.
                if self.hard_reset_counter.increment().is_err() {
                    return Err(Error::PortPartnerUnresponsive);
                }

                self.protocol_layer.hard_reset().await?;
                self.device_policy_manager.notify(&dpm::Event::HardResetSent).await;
                self.complete_command(ResponseStatus::Sent).await;

                // Let hard reset signaling complete before cycling VBUS.
                TimerType::get_timer::<TIMER>(TimerType::PSHardReset).await;

                State::TransitionToDefault
            }
            State::TransitionToDefault => {
                self.device_policy_manager.hard_reset().await;

                // Power cycle VBUS: off, recover, back on at vSafe5V.
                self.device_policy_manager.set_vbus(false).await;
                TimerType::get_timer::<TIMER>(TimerType::SourceRecover).await;
                self.device_policy_manager.set_vbus(true).await;

                self.protocol_layer.reset();
                self.protocol_layer.set_data_role(DataRole::Dfp);
                self.mode = Mode::Spr;
                self.granted = None;

                State::Startup
            }
            State::GiveSinkCap(epr) => {
                // Only a dual-role port has sink capabilities to report.
                if !self.config.port_role.supports_sink() {
                    State::SendNotSupported
                } else {
                    let sink_caps = self.config.sink_capabilities();
                    if epr {
                        self.protocol_layer.transmit_epr_sink_capabilities(sink_caps).await?;
                    } else {
                        self.protocol_layer.transmit_sink_capabilities(sink_caps).await?;
                    }
                    State::Ready
                }
            }
            State::GiveManufacturerInfo => {
                let info = self.config.manufacturer.info();
                self.protocol_layer.transmit_manufacturer_info(info).await?;

                State::Ready
            }
            State::GetPartnerCap(source_caps) => {
                let (request_type, response_type) = if source_caps {
                    (
                        ControlMessageType::GetSourceCap,
                        MessageType::Data(DataMessageType::SourceCapabilities),
                    )
                } else {
                    (
                        ControlMessageType::GetSinkCap,
                        MessageType::Data(DataMessageType::SinkCapabilities),
                    )
                };

                self.protocol_layer
                    .transmit_control_message(SopTarget::Sop, request_type)
                    .await?;

                let result = self
                    .protocol_layer
                    .receive_message_type(SopTarget::Sop, &[response_type], TimerType::SenderResponse)
                    .await;

                match result {
                    Ok(_) => self.complete_command(ResponseStatus::ResponseReceived).await,
                    Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        self.complete_command(ResponseStatus::TimedOut).await
                    }
                    Err(e) => return Err(e.into()),
                }

                State::Ready
            }
            State::EvaluateSwap(kind) => {
                let decision = self.device_policy_manager.evaluate_swap(kind).await;

                match decision {
                    Decision::Reject => {
                        self.protocol_layer
                            .transmit_control_message(SopTarget::Sop, ControlMessageType::Reject)
                            .await?;
                        State::Ready
                    }
                    Decision::Wait => {
                        self.protocol_layer
                            .transmit_control_message(SopTarget::Sop, ControlMessageType::Wait)
                            .await?;
                        State::Ready
                    }
                    Decision::Accept => {
                        self.protocol_layer
                            .transmit_control_message(SopTarget::Sop, ControlMessageType::Accept)
                            .await?;

                        match self.perform_swap(kind).await? {
                            Some(exit) => return Ok(Some(exit)),
                            None => State::Ready,
                        }
                    }
                }
            }
            State::SendSwap(kind) => {
                let message_type = match kind {
                    SwapKind::PowerRole => ControlMessageType::PrSwap,
                    SwapKind::DataRole => ControlMessageType::DrSwap,
                    SwapKind::Vconn => ControlMessageType::VconnSwap,
                    SwapKind::FastRole => ControlMessageType::FrSwap,
                };
                self.protocol_layer
                    .transmit_control_message(SopTarget::Sop, message_type)
                    .await?;

                let result = self
                    .protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[
                            MessageType::Control(ControlMessageType::Accept),
                            MessageType::Control(ControlMessageType::Reject),
                            MessageType::Control(ControlMessageType::Wait),
                            MessageType::Control(ControlMessageType::NotSupported),
                        ],
                        TimerType::SenderResponse,
                    )
                    .await;

                let message = match result {
                    Ok(message) => message,
                    Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        self.complete_command(ResponseStatus::TimedOut).await;
                        self.state = State::Ready;
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                };

                match message.header.message_type() {
                    MessageType::Control(ControlMessageType::Accept) => match self.perform_swap(kind).await? {
                        Some(exit) => return Ok(Some(exit)),
                        None => State::Ready,
                    },
                    _ => {
                        self.complete_command(ResponseStatus::Failed).await;
                        State::Ready
                    }
                }
            }
            State::DataResetReceived => {
                self.protocol_layer
                    .transmit_control_message(SopTarget::Sop, ControlMessageType::Accept)
                    .await?;

                self.run_data_reset(DataResetState::Accepted).await?;
                State::Ready
            }
            State::SendDataReset => {
                self.protocol_layer
                    .transmit_control_message(SopTarget::Sop, ControlMessageType::DataReset)
                    .await?;

                trace!("Data reset sub-state {:?}", DataResetState::WaitAccept);
                let result = self
                    .protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[
                            MessageType::Control(ControlMessageType::Accept),
                            MessageType::Control(ControlMessageType::NotSupported),
                        ],
                        TimerType::SenderResponse,
                    )
                    .await;

                match result {
                    Ok(message)
                        if matches!(
                            message.header.message_type(),
                            MessageType::Control(ControlMessageType::Accept)
                        ) =>
                    {
                        self.run_data_reset(DataResetState::Accepted).await?;
                        self.complete_command(ResponseStatus::ResponseReceived).await;
                    }
                    Ok(_) => self.complete_command(ResponseStatus::Failed).await,
                    Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        self.complete_command(ResponseStatus::TimedOut).await
                    }
                    Err(e) => return Err(e.into()),
                }

                State::Ready
            }
            State::EvaluateVdm(header, objects) => {
                let response_fut = self.device_policy_manager.evaluate_vdm(&header, &objects);
                let timeout_fut = TimerType::get_timer::<TIMER>(TimerType::VDMResponse);

                match select(response_fut, timeout_fut).await {
                    Either::First(Some((response_header, response_objects))) => {
                        self.protocol_layer
                            .transmit_vdm(SopTarget::Sop, response_header, response_objects)
                            .await?;
                        State::Ready
                    }
                    Either::First(None) | Either::Second(_) => match self.protocol_layer.spec_revision() {
                        SpecificationRevision::R3_X => State::SendNotSupported,
                        _ => State::Ready,
                    },
                }
            }
            State::SendVdm(buffer) => {
                self.protocol_layer
                    .transmit_vdm(buffer.sop, buffer.header, buffer.objects)
                    .await?;

                self.complete_command(ResponseStatus::Sent).await;
                State::Ready
            }
            State::BistCarrierMode => {
                TimerType::get_timer::<TIMER>(TimerType::BISTContMode).await;
                State::Ready
            }
            State::BistTestData => {
                // Discard all traffic until a reset ends test-data mode.
                loop {
                    let _ = self.protocol_layer.receive_message().await?;
                }
            }
            State::EprEvaluateEntry(sink_pdp) => {
                trace!("Sink requests EPR entry with operational PDP {} W", sink_pdp);

                let failure = if !self.config.epr_supported || self.config.epr_source_pdo_mask == 0 {
                    Some(epr_mode::DataEnterFailed::SourceUnableToEnterEprMode)
                } else if !self.vconn_source {
                    Some(epr_mode::DataEnterFailed::SourceFailedToBecomeVconnSource)
                } else if !self
                    .cable
                    .is_some_and(|cable| cable.epr_capable || cable.max_voltage >= CableMaxVoltage::V50)
                {
                    Some(epr_mode::DataEnterFailed::CableNotEprCapable)
                } else {
                    None
                };

                match failure {
                    Some(reason) => {
                        self.protocol_layer
                            .transmit_epr_mode(Action::EnterFailed, reason.into())
                            .await?;
                        self.device_policy_manager
                            .notify(&dpm::Event::EprEntryFailed(reason))
                            .await;
                        State::Ready
                    }
                    None => {
                        self.protocol_layer
                            .transmit_epr_mode(Action::EnterAcknowledged, 0)
                            .await?;

                        // Cable capability was verified at discovery time;
                        // entry succeeds immediately.
                        self.protocol_layer.transmit_epr_mode(Action::EnterSucceeded, 0).await?;

                        self.mode = Mode::Epr;
                        self.device_policy_manager.notify(&dpm::Event::EprEntered).await;

                        State::EprSendCapabilities
                    }
                }
            }
            State::EprSendCapabilities => {
                self.advertised = self.config.epr_source_capabilities();
                self.protocol_layer.set_pdo_state(Some(self.advertised.clone()));
                self.protocol_layer
                    .transmit_epr_source_capabilities(self.advertised.clone())
                    .await?;

                let message = self
                    .protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[MessageType::Data(DataMessageType::EprRequest)],
                        TimerType::SenderResponse,
                    )
                    .await?;

                let Some(Payload::Data(Data::Request(request))) = message.payload else {
                    return Err(ProtocolError::UnexpectedMessage.into());
                };

                State::NegotiateCapability(request)
            }
        };

        self.state = new_state;

        Ok(None)
    }

    /// Carry out an accepted swap. Returns an exit when the engine role ends.
    async fn perform_swap(&mut self, kind: SwapKind) -> Result<Option<Exit>, Error> {
        match kind {
            SwapKind::DataRole => {
                let new_role = match self.protocol_layer.header().port_data_role() {
                    DataRole::Ufp => DataRole::Dfp,
                    DataRole::Dfp => DataRole::Ufp,
                };
                self.protocol_layer.set_data_role(new_role);
                self.protocol_layer.reset_endpoint(SopTarget::Sop);

                self.device_policy_manager
                    .notify(&dpm::Event::DataRoleSwapped(new_role))
                    .await;
                self.complete_command(ResponseStatus::ResponseReceived).await;
                Ok(None)
            }
            SwapKind::PowerRole | SwapKind::FastRole => {
                // Remove power, report PS_RDY, then wait for the new source.
                self.device_policy_manager.set_vbus(false).await;
                self.protocol_layer
                    .transmit_control_message(SopTarget::Sop, ControlMessageType::PsRdy)
                    .await?;

                self.protocol_layer.set_power_role(PowerRole::Sink);

                self.protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[MessageType::Control(ControlMessageType::PsRdy)],
                        TimerType::PSSourceOnSpr,
                    )
                    .await?;

                self.protocol_layer.reset();

                self.device_policy_manager
                    .notify(&dpm::Event::PowerRoleSwapped(PowerRole::Sink))
                    .await;
                self.complete_command(ResponseStatus::ResponseReceived).await;
                Ok(Some(Exit::PowerRoleSwap))
            }
            SwapKind::Vconn => {
                if self.vconn_source {
                    self.protocol_layer
                        .receive_message_type(
                            SopTarget::Sop,
                            &[MessageType::Control(ControlMessageType::PsRdy)],
                            TimerType::VCONNOn,
                        )
                        .await?;
                    self.device_policy_manager.set_vconn(false).await;
                    self.vconn_source = false;
                } else {
                    self.device_policy_manager.set_vconn(true).await;
                    TimerType::get_timer::<TIMER>(TimerType::VCONNOn).await;
                    self.protocol_layer
                        .transmit_control_message(SopTarget::Sop, ControlMessageType::PsRdy)
                        .await?;
                    self.vconn_source = true;
                }

                self.device_policy_manager.notify(&dpm::Event::VconnSwapComplete).await;
                self.complete_command(ResponseStatus::ResponseReceived).await;
                Ok(None)
            }
        }
    }

    /// Walk the remaining Data_Reset handshake from the given sub-state.
    async fn run_data_reset(&mut self, entry: DataResetState) -> Result<(), Error> {
        let mut sub_state = entry;

        loop {
            trace!("Data reset sub-state {:?}", sub_state);

            sub_state = match (self.protocol_layer.header().port_data_role(), sub_state) {
                (DataRole::Dfp, DataResetState::Accepted) => DataResetState::WaitVconnOff,
                (DataRole::Dfp, DataResetState::WaitVconnOff) => {
                    self.device_policy_manager.set_vconn(false).await;
                    TimerType::get_timer::<TIMER>(TimerType::VCONNDischarge).await;
                    DataResetState::SendingPsRdy
                }
                (DataRole::Dfp, DataResetState::SendingPsRdy) => {
                    self.protocol_layer
                        .transmit_control_message(SopTarget::Sop, ControlMessageType::PsRdy)
                        .await?;
                    DataResetState::WaitVconnOn
                }
                (DataRole::Dfp, DataResetState::WaitVconnOn) => {
                    self.device_policy_manager.set_vconn(true).await;
                    TimerType::get_timer::<TIMER>(TimerType::VCONNOn).await;
                    DataResetState::CompleteDelay
                }
                (DataRole::Dfp, DataResetState::CompleteDelay) => {
                    self.protocol_layer
                        .transmit_control_message(SopTarget::Sop, ControlMessageType::DataResetComplete)
                        .await?;
                    DataResetState::Idle
                }
                (DataRole::Ufp, DataResetState::Accepted) => DataResetState::WaitVconnOff,
                (DataRole::Ufp, DataResetState::WaitVconnOff) => {
                    self.protocol_layer
                        .receive_message_type(
                            SopTarget::Sop,
                            &[MessageType::Control(ControlMessageType::PsRdy)],
                            TimerType::DataResetFail,
                        )
                        .await?;
                    DataResetState::WaitCompletion
                }
                (DataRole::Ufp, DataResetState::WaitCompletion) => {
                    self.protocol_layer
                        .receive_message_type(
                            SopTarget::Sop,
                            &[MessageType::Control(ControlMessageType::DataResetComplete)],
                            TimerType::DataResetFailUFP,
                        )
                        .await?;
                    DataResetState::Idle
                }
                (_, DataResetState::Idle) => {
                    self.device_policy_manager.notify(&dpm::Event::DataResetComplete).await;
                    return Ok(());
                }
                (_, other) => {
                    error!("Unhandled data reset sub-state {:?}", other);
                    return Ok(());
                }
            };
        }
    }
}
