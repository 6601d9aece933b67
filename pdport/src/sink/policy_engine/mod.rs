//! Policy engine for the implementation of a sink.
//!
//! Drives capability evaluation, contract formation, swaps, resets, vendor
//! message relay and EPR mode against an attached source.
use core::marker::PhantomData;

use embassy_futures::select::{Either, Either3, select, select3};
use heapless::Vec;
use pdport_traits::{Driver, SopTarget};
use uom::si::power::watt;

use super::device_policy_manager::{DevicePolicyManager, Event};
use crate::config::PortConfig;
use crate::counters::{Counter, CounterType};
use crate::data_reset::DataResetState;
use crate::dpm::{self, Command, Contract, Decision, Response, ResponseStatus, SwapKind, VdmBuffer};
use crate::protocol_layer::message::data::epr_mode::{self, Action};
use crate::protocol_layer::message::data::request::PowerSource;
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::data::vendor_defined::VdmHeader;
use crate::protocol_layer::message::data::{Data, bist};
use crate::protocol_layer::message::extended::extended_control::ExtendedControlMessageType;
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload, extended};
use crate::protocol_layer::{ProtocolError, ProtocolLayer, RxError, TxError};
use crate::timers::{Timer, TimerType};
use crate::units::Power;
use crate::{DataRole, PowerRole};

#[cfg(test)]
mod tests;

/// Power range the contract operates in.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    /// The classic mode of operation with explicit SPR contracts.
    Spr,
    /// Extended power range operation, up to 48 V.
    Epr,
}

/// Progression of the negotiated contract.
#[derive(Debug, Clone, Copy, Default)]
enum ContractPhase {
    #[default]
    Safe5V,
    TransitionToExplicit,
    Explicit,
}

/// Sink policy engine states.
#[derive(Debug, Clone)]
enum State {
    /// Default state at startup.
    Startup,
    Discovery,
    WaitForCapabilities,
    EvaluateCapabilities(SourceCapabilities),
    SelectCapability(PowerSource),
    TransitionSink(PowerSource),
    /// Ready state. The bool indicates entry due to a Wait response, which
    /// arms the SinkRequestTimer before allowing a re-request.
    Ready(PowerSource, bool),
    SendNotSupported(PowerSource),
    SendSoftReset,
    SoftReset,
    HardReset,
    TransitionToDefault,
    /// Answer Get_Sink_Cap (SPR) or EPR_Get_Sink_Cap (EPR).
    GiveSinkCap(bool, PowerSource),
    GetSourceCap(bool, PowerSource),
    /// Ask the partner for its sink capabilities.
    GetPartnerSinkCap(PowerSource),
    GiveManufacturerInfo(PowerSource),

    /// A swap offer was received.
    EvaluateSwap(SwapKind, PowerSource),
    /// The application asked to initiate a swap.
    SendSwap(SwapKind, PowerSource),

    /// The partner initiated a Data_Reset.
    DataResetReceived(PowerSource),
    /// The application asked to initiate a Data_Reset.
    SendDataReset(PowerSource),

    /// A vendor defined message was received and is relayed for evaluation.
    EvaluateVdm(VdmHeader, Vec<u32, 7>, PowerSource),
    /// The application asked to send a vendor defined message.
    SendVdm(VdmBuffer, PowerSource),

    /// BIST carrier mode for tBISTContMode.
    BistCarrierMode(PowerSource),
    /// BIST test data: discard all traffic until reset.
    BistTestData(PowerSource),

    // EPR states
    EprModeEntry(PowerSource, Power),
    EprEntryWaitForResponse(PowerSource),
    EprWaitForCapabilities(PowerSource),
    EprSendExit,
    EprExitReceived(PowerSource),
    EprKeepAlive(PowerSource),
}

/// Reasons for the engine to hand control back to the port.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Exit {
    /// The power role was swapped; the port shall run the source engine.
    PowerRoleSwap,
    /// A Type-C level command must be applied by the port.
    TypeCCommand(Command),
}

/// Errors that can occur in the sink policy engine state machine.
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

/// Implementation of the sink policy engine.
#[derive(Debug)]
pub struct Sink<DRIVER: Driver, TIMER: Timer, DPM: DevicePolicyManager> {
    device_policy_manager: DPM,
    pub(crate) protocol_layer: ProtocolLayer<DRIVER, TIMER>,
    config: PortConfig,
    contract: ContractPhase,
    hard_reset_counter: Counter,
    source_capabilities: Option<SourceCapabilities>,
    mode: Mode,
    pub(crate) state: State,
    /// Tracks whether a Get_Source_Cap request is pending. In EPR mode, an
    /// unrequested Source_Capabilities message forces a hard reset.
    get_source_cap_pending: bool,
    /// Consecutive unacknowledged EPR keep-alives.
    epr_keep_alive_misses: u8,
    /// Whether this port currently sources VCONN.
    vconn_source: bool,
    /// The command currently being executed, for completion reporting.
    pending_command: Option<Command>,

    _timer: PhantomData<TIMER>,
}

impl<DRIVER: Driver, TIMER: Timer, DPM: DevicePolicyManager> Sink<DRIVER, TIMER, DPM> {
    /// Create a fresh protocol layer with initial state.
    fn new_protocol_layer(driver: DRIVER) -> ProtocolLayer<DRIVER, TIMER> {
        let header = Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X);
        ProtocolLayer::new(driver, header)
    }

    /// Create a new sink policy engine with a given `driver`.
    pub fn new(driver: DRIVER, device_policy_manager: DPM, config: PortConfig) -> Self {
        Self {
            device_policy_manager,
            protocol_layer: Self::new_protocol_layer(driver),
            config,
            state: State::Discovery,
            contract: Default::default(),
            hard_reset_counter: Counter::new(CounterType::HardReset),
            source_capabilities: None,
            mode: Mode::Spr,
            get_source_cap_pending: false,
            epr_keep_alive_misses: 0,
            vconn_source: false,
            pending_command: None,
            _timer: PhantomData,
        }
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
                error!("Unrecoverable error {:?} in sink state transition", other);
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

            // SinkWaitCapTimer timeout triggers a hard reset.
            (State::WaitForCapabilities, ProtocolError::RxError(RxError::ReceiveTimeout)) => Some(State::HardReset),

            // SenderResponseTimer timeout during capability selection triggers a hard reset.
            (State::SelectCapability(_), ProtocolError::RxError(RxError::ReceiveTimeout)) => Some(State::HardReset),

            // Any protocol error during the power transition triggers a hard
            // reset, not a soft reset.
            (State::TransitionSink(_), _) => Some(State::HardReset),

            // Unexpected messages inside an AMS demand a soft reset.
            (_, ProtocolError::UnexpectedMessage) => Some(State::SendSoftReset),

            // Unsupported or malformed messages in Ready are answered
            // without a reset.
            (
                State::Ready(power_source, _),
                ProtocolError::RxError(RxError::UnsupportedMessage) | ProtocolError::Parse(_),
            ) => Some(State::SendNotSupported(*power_source)),

            // Transmission failure (no GoodCRC after retries) triggers a soft reset.
            (_, ProtocolError::TransmitRetriesExceeded(_)) => Some(State::SendSoftReset),

            // Remaining protocol errors: log and stay.
            (_, error) => {
                error!("Protocol error {:?} in sink state transition", error);
                None
            }
        };

        if let Some(state) = new_state {
            self.state = state
        }

        Ok(None)
    }

    /// Run the sink's state machine continuously.
    ///
    /// Returns when the port must take over (e.g. after a power role swap),
    /// or with an unrecoverable error, for example if the port partner is
    /// unresponsive.
    pub async fn run(&mut self) -> Result<Exit, Error> {
        loop {
            if let Some(exit) = self.run_step().await? {
                return Ok(exit);
            }
        }
    }

    /// Wait for source capabilities (Source_Capabilities or, in EPR mode,
    /// EPR_Source_Capabilities).
    async fn wait_for_source_capabilities(
        protocol_layer: &mut ProtocolLayer<DRIVER, TIMER>,
    ) -> Result<SourceCapabilities, Error> {
        let message = protocol_layer.wait_for_source_capabilities().await?;
        trace!("Source capabilities: {:?}", message);

        let capabilities = match message.payload {
            Some(Payload::Data(Data::SourceCapabilities(caps))) => caps,
            Some(Payload::Extended(extended::Extended::EprSourceCapabilities(pdos))) => SourceCapabilities(pdos),
            _ => unreachable!(),
        };

        Ok(capabilities)
    }

    /// Dispatch a message received in the Ready state.
    fn dispatch_ready_message(&mut self, message: Message, power_source: PowerSource) -> State {
        match message.header.message_type() {
            MessageType::Data(DataMessageType::SourceCapabilities) => {
                // In EPR mode, a Source_Capabilities message that was not
                // requested with Get_Source_Cap forces a hard reset.
                if self.mode == Mode::Epr && !self.get_source_cap_pending {
                    State::HardReset
                } else {
                    let Some(Payload::Data(Data::SourceCapabilities(capabilities))) = message.payload else {
                        unreachable!()
                    };
                    self.get_source_cap_pending = false;
                    State::EvaluateCapabilities(capabilities)
                }
            }
            MessageType::Extended(ExtendedMessageType::EprSourceCapabilities) => {
                if let Some(Payload::Extended(extended::Extended::EprSourceCapabilities(pdos))) = message.payload {
                    self.get_source_cap_pending = false;
                    let caps = SourceCapabilities(pdos);

                    // EPR (A)PDOs are only allowed in positions 8 and above.
                    if self.mode == Mode::Epr && caps.has_epr_pdo_in_spr_positions() {
                        State::HardReset
                    } else {
                        State::EvaluateCapabilities(caps)
                    }
                } else {
                    unreachable!()
                }
            }
            MessageType::Data(DataMessageType::EprMode) => State::EprExitReceived(power_source),
            MessageType::Control(ControlMessageType::GetSinkCap) => State::GiveSinkCap(false, power_source),
            MessageType::Control(ControlMessageType::Ping) => State::Ready(power_source, false),
            MessageType::Control(ControlMessageType::DrSwap) => State::EvaluateSwap(SwapKind::DataRole, power_source),
            MessageType::Control(ControlMessageType::PrSwap) => State::EvaluateSwap(SwapKind::PowerRole, power_source),
            MessageType::Control(ControlMessageType::VconnSwap) => State::EvaluateSwap(SwapKind::Vconn, power_source),
            MessageType::Control(ControlMessageType::DataReset) => State::DataResetReceived(power_source),
            MessageType::Data(DataMessageType::VendorDefined) => {
                if let Some(Payload::Data(Data::VendorDefined((header, objects)))) = message.payload {
                    State::EvaluateVdm(header, objects, power_source)
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Data(DataMessageType::Bist) => {
                if let Some(Payload::Data(Data::Bist(object))) = message.payload {
                    match object.mode() {
                        bist::BistMode::CarrierMode2 => State::BistCarrierMode(power_source),
                        bist::BistMode::TestData => State::BistTestData(power_source),
                        bist::BistMode::Other(_) => State::Ready(power_source, false),
                    }
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            MessageType::Extended(ExtendedMessageType::GetManufacturerInfo) => {
                State::GiveManufacturerInfo(power_source)
            }
            MessageType::Extended(ExtendedMessageType::ExtendedControl) => {
                if let Some(Payload::Extended(extended::Extended::ExtendedControl(ctrl))) = &message.payload {
                    if ctrl.message_type() == Ok(ExtendedControlMessageType::EprGetSinkCap) {
                        State::GiveSinkCap(true, power_source)
                    } else {
                        State::SendNotSupported(power_source)
                    }
                } else {
                    State::SendNotSupported(power_source)
                }
            }
            _ => State::SendNotSupported(power_source),
        }
    }

    /// Map a device policy event to the next state.
    fn dispatch_command(&mut self, command: Command, power_source: PowerSource) -> Result<State, Option<Exit>> {
        self.pending_command = Some(command.clone());

        Ok(match command {
            Command::HardReset => State::HardReset,
            Command::SoftReset(_) => State::SendSoftReset,
            Command::DataReset => State::SendDataReset(power_source),
            Command::PowerRoleSwap => State::SendSwap(SwapKind::PowerRole, power_source),
            Command::DataRoleSwap => State::SendSwap(SwapKind::DataRole, power_source),
            Command::VconnSwap => State::SendSwap(SwapKind::Vconn, power_source),
            Command::FastRoleSwap => State::SendSwap(SwapKind::FastRole, power_source),
            Command::GetSourceCapabilities => State::GetSourceCap(self.mode == Mode::Epr, power_source),
            Command::GetSinkCapabilities => State::GetPartnerSinkCap(power_source),
            Command::EnterEprMode => State::EprModeEntry(
                power_source,
                Power::new::<watt>(self.config.epr_operational_pdp_w.into()),
            ),
            Command::ExitEprMode => State::EprSendExit,
            Command::RequestPower(request) => State::SelectCapability(request),
            Command::SendVdm(buffer) => State::SendVdm(buffer, power_source),
            Command::SetRp(_) | Command::PortDisable | Command::ErrorRecovery => {
                // Type-C level commands are applied by the port.
                let command = self.pending_command.take().unwrap();
                return Err(Some(Exit::TypeCCommand(command)));
            }
        })
    }

    async fn update_state(&mut self) -> Result<Option<Exit>, Error> {
        let state = self.state.clone();

        let new_state = match state {
            State::Startup => {
                self.contract = Default::default();
                self.protocol_layer.reset();
                self.mode = Mode::Spr;
                self.epr_keep_alive_misses = 0;
                self.complete_command(ResponseStatus::Aborted).await;

                State::Discovery
            }
            State::Discovery => {
                self.protocol_layer.wait_for_vbus().await;
                self.source_capabilities = None;

                State::WaitForCapabilities
            }
            State::WaitForCapabilities => {
                State::EvaluateCapabilities(Self::wait_for_source_capabilities(&mut self.protocol_layer).await?)
            }
            State::EvaluateCapabilities(capabilities) => {
                // Sink now knows that it is attached.
                self.source_capabilities = Some(capabilities.clone());

                self.hard_reset_counter.reset();

                let request = self
                    .device_policy_manager
                    .request(self.source_capabilities.as_ref().unwrap())
                    .await;

                State::SelectCapability(request)
            }
            State::SelectCapability(power_source) => {
                self.protocol_layer.sink_tx_delay().await;
                self.protocol_layer.request_power(power_source).await?;

                let message_type = self
                    .protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[
                            MessageType::Control(ControlMessageType::Accept),
                            MessageType::Control(ControlMessageType::Wait),
                            MessageType::Control(ControlMessageType::Reject),
                        ],
                        TimerType::SenderResponse,
                    )
                    .await?
                    .header
                    .message_type();

                let MessageType::Control(control_message_type) = message_type else {
                    unreachable!()
                };

                match (self.contract, control_message_type) {
                    (_, ControlMessageType::Accept) => State::TransitionSink(power_source),
                    (ContractPhase::Safe5V, ControlMessageType::Wait | ControlMessageType::Reject) => {
                        State::WaitForCapabilities
                    }
                    (_, ControlMessageType::Reject) => {
                        self.device_policy_manager.notify(&dpm::Event::ContractRejected).await;
                        self.complete_command(ResponseStatus::Failed).await;
                        State::Ready(power_source, false)
                    }
                    // After a Wait response, re-entry into Ready arms the
                    // SinkRequestTimer before a re-request is allowed.
                    (_, ControlMessageType::Wait) => {
                        self.complete_command(ResponseStatus::Failed).await;
                        State::Ready(power_source, true)
                    }
                    _ => unreachable!(),
                }
            }
            State::TransitionSink(power_source) => {
                self.protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[MessageType::Control(ControlMessageType::PsRdy)],
                        match self.mode {
                            Mode::Epr => TimerType::PSTransitionEpr,
                            Mode::Spr => TimerType::PSTransitionSpr,
                        },
                    )
                    .await?;

                self.contract = ContractPhase::TransitionToExplicit;
                self.device_policy_manager.transition_power(&power_source).await;

                if let Some(contract) =
                    Contract::from_request(&power_source, self.source_capabilities.as_ref().unwrap())
                {
                    self.device_policy_manager
                        .notify(&dpm::Event::ContractNegotiated(contract))
                        .await;
                }
                self.complete_command(ResponseStatus::ResponseReceived).await;

                State::Ready(power_source, false)
            }
            State::Ready(power_source, after_wait) => {
                self.contract = ContractPhase::Explicit;

                // The select borrows disjoint parts of the engine; its
                // outcome is handled after those borrows end.
                let outcome = {
                    let mode = self.mode;
                    let receive_fut = self.protocol_layer.receive_message();
                    let event_fut = self
                        .device_policy_manager
                        .get_event(self.source_capabilities.as_ref().unwrap());
                    let pps_periodic_fut = async {
                        match power_source {
                            PowerSource::Pps(_) => TimerType::get_timer::<TIMER>(TimerType::SinkPPSPeriodic).await,
                            _ => core::future::pending().await,
                        }
                    };
                    let epr_keep_alive_fut = async {
                        match mode {
                            Mode::Epr => TimerType::get_timer::<TIMER>(TimerType::SinkEPRKeepAlive).await,
                            Mode::Spr => core::future::pending().await,
                        }
                    };
                    // After a Wait response, the SinkRequestTimer enforces the
                    // minimum delay before the request is repeated.
                    let sink_request_fut = async {
                        if after_wait {
                            TimerType::get_timer::<TIMER>(TimerType::SinkRequest).await
                        } else {
                            core::future::pending().await
                        }
                    };
                    let timers_fut = async { select3(pps_periodic_fut, epr_keep_alive_fut, sink_request_fut).await };

                    match select3(receive_fut, event_fut, timers_fut).await {
                        Either3::First(message) => Either3::First(message),
                        Either3::Second(event) => Either3::Second(event),
                        // Timer expiry resolves to a state directly.
                        Either3::Third(timeout_source) => Either3::Third(match timeout_source {
                            // PPS periodic timeout: re-request as keep-alive.
                            Either3::First(_) => State::SelectCapability(power_source),
                            // EPR keep-alive cadence.
                            Either3::Second(_) => State::EprKeepAlive(power_source),
                            // SinkRequest timeout: re-request power after Wait.
                            Either3::Third(_) => State::SelectCapability(power_source),
                        }),
                    }
                };

                match outcome {
                    // A message was received.
                    Either3::First(message) => {
                        let (sop, message) = message?;
                        if sop != SopTarget::Sop {
                            State::Ready(power_source, after_wait)
                        } else {
                            self.dispatch_ready_message(message, power_source)
                        }
                    }
                    // Event from the device policy manager.
                    Either3::Second(event) => match event {
                        Event::Command(command) => match self.dispatch_command(command, power_source) {
                            Ok(state) => state,
                            Err(exit) => return Ok(exit),
                        },
                        Event::None => State::Ready(power_source, false),
                    },
                    Either3::Third(state) => state,
                }
            }
            State::SendNotSupported(power_source) => {
                self.transmit_not_supported().await?;

                State::Ready(power_source, false)
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
                self.complete_command(ResponseStatus::Sent).await;

                State::WaitForCapabilities
            }
            State::SoftReset => {
                self.protocol_layer
                    .transmit_control_message(SopTarget::Sop, ControlMessageType::Accept)
                    .await?;

                self.protocol_layer.reset();

                State::WaitForCapabilities
            }
            State::HardReset => {
                // The hard-reset counter increments exactly once per cycle.
                // Beyond its bound, the source is assumed non-responsive.
                if self.hard_reset_counter.increment().is_err() {
                    return Err(Error::PortPartnerUnresponsive);
                }

                self.protocol_layer.hard_reset().await?;
                self.device_policy_manager.notify(&dpm::Event::HardResetSent).await;
                self.complete_command(ResponseStatus::Sent).await;

                State::TransitionToDefault
            }
            State::TransitionToDefault => {
                // Notify the device, which transitions to default power levels.
                self.device_policy_manager.hard_reset().await;

                // Hard reset exits EPR mode and voids the explicit contract.
                self.protocol_layer.reset();
                self.mode = Mode::Spr;
                self.contract = ContractPhase::Safe5V;
                self.source_capabilities = None;
                self.vconn_source = false;
                self.protocol_layer.set_data_role(DataRole::Ufp);

                State::Startup
            }
            State::GiveSinkCap(epr, power_source) => {
                let sink_caps = self.device_policy_manager.sink_capabilities();
                if epr {
                    self.protocol_layer.transmit_epr_sink_capabilities(sink_caps).await?;
                } else {
                    self.protocol_layer.transmit_sink_capabilities(sink_caps).await?;
                }

                State::Ready(power_source, false)
            }
            State::GetSourceCap(epr, power_source) => {
                // Remember that these capabilities were requested; in EPR
                // mode, unrequested ones force a hard reset.
                self.get_source_cap_pending = true;

                if epr {
                    self.protocol_layer
                        .transmit_extended_control_message(ExtendedControlMessageType::EprGetSourceCap)
                        .await?;
                } else {
                    self.protocol_layer
                        .transmit_control_message(SopTarget::Sop, ControlMessageType::GetSourceCap)
                        .await?;
                }

                let result = self
                    .protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[
                            MessageType::Data(DataMessageType::SourceCapabilities),
                            MessageType::Extended(ExtendedMessageType::EprSourceCapabilities),
                        ],
                        TimerType::SenderResponse,
                    )
                    .await;

                self.get_source_cap_pending = false;

                let message = match result {
                    Ok(message) => message,
                    Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        warn!("Get_Source_Cap timeout, returning to Ready");
                        self.complete_command(ResponseStatus::TimedOut).await;
                        self.state = State::Ready(power_source, false);
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                };

                let received_epr = matches!(
                    message.header.message_type(),
                    MessageType::Extended(ExtendedMessageType::EprSourceCapabilities)
                );

                let capabilities = match message.payload {
                    Some(Payload::Data(Data::SourceCapabilities(caps))) => caps,
                    Some(Payload::Extended(extended::Extended::EprSourceCapabilities(pdos))) => {
                        SourceCapabilities(pdos)
                    }
                    _ => unreachable!(),
                };

                self.device_policy_manager.inform(&capabilities).await;
                self.complete_command(ResponseStatus::ResponseReceived).await;

                // A capability set from the wrong mode is informational only.
                if epr == received_epr && (self.mode == Mode::Epr) == epr {
                    State::EvaluateCapabilities(capabilities)
                } else {
                    State::Ready(power_source, false)
                }
            }
            State::GetPartnerSinkCap(power_source) => {
                self.protocol_layer
                    .transmit_control_message(SopTarget::Sop, ControlMessageType::GetSinkCap)
                    .await?;

                let result = self
                    .protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[MessageType::Data(DataMessageType::SinkCapabilities)],
                        TimerType::SenderResponse,
                    )
                    .await;

                match result {
                    Ok(_) => self.complete_command(ResponseStatus::ResponseReceived).await,
                    Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        self.complete_command(ResponseStatus::TimedOut).await
                    }
                    Err(e) => return Err(e.into()),
                }

                State::Ready(power_source, false)
            }
            State::GiveManufacturerInfo(power_source) => {
                let info = self.config.manufacturer.info();
                self.protocol_layer.transmit_manufacturer_info(info).await?;

                State::Ready(power_source, false)
            }
            State::EvaluateSwap(kind, power_source) => {
                // Fast role swap is signalled towards a sink, never received.
                let decision = if kind == SwapKind::FastRole {
                    Decision::Reject
                } else {
                    self.device_policy_manager.evaluate_swap(kind).await
                };

                match decision {
                    Decision::Reject => {
                        self.protocol_layer
                            .transmit_control_message(SopTarget::Sop, ControlMessageType::Reject)
                            .await?;
                        State::Ready(power_source, false)
                    }
                    Decision::Wait => {
                        self.protocol_layer
                            .transmit_control_message(SopTarget::Sop, ControlMessageType::Wait)
                            .await?;
                        State::Ready(power_source, false)
                    }
                    Decision::Accept => {
                        self.protocol_layer
                            .transmit_control_message(SopTarget::Sop, ControlMessageType::Accept)
                            .await?;

                        match self.perform_swap(kind, power_source).await? {
                            Some(exit) => return Ok(Some(exit)),
                            None => State::Ready(power_source, false),
                        }
                    }
                }
            }
            State::SendSwap(kind, power_source) => {
                self.protocol_layer.sink_tx_delay().await;

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
                        self.state = State::Ready(power_source, false);
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                };

                match message.header.message_type() {
                    MessageType::Control(ControlMessageType::Accept) => {
                        match self.perform_swap(kind, power_source).await? {
                            Some(exit) => return Ok(Some(exit)),
                            None => State::Ready(power_source, false),
                        }
                    }
                    _ => {
                        self.complete_command(ResponseStatus::Failed).await;
                        State::Ready(power_source, false)
                    }
                }
            }
            State::DataResetReceived(power_source) => {
                self.protocol_layer
                    .transmit_control_message(SopTarget::Sop, ControlMessageType::Accept)
                    .await?;

                self.run_data_reset(DataResetState::Accepted).await?;
                State::Ready(power_source, false)
            }
            State::SendDataReset(power_source) => {
                self.protocol_layer.sink_tx_delay().await;
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

                State::Ready(power_source, false)
            }
            State::EvaluateVdm(header, objects, power_source) => {
                let response_fut = self.device_policy_manager.evaluate_vdm(&header, &objects);
                let timeout_fut = TimerType::get_timer::<TIMER>(TimerType::VDMResponse);

                match select(response_fut, timeout_fut).await {
                    Either::First(Some((response_header, response_objects))) => {
                        self.protocol_layer
                            .transmit_vdm(SopTarget::Sop, response_header, response_objects)
                            .await?;
                        State::Ready(power_source, false)
                    }
                    Either::First(None) | Either::Second(_) => match self.protocol_layer.spec_revision() {
                        // Unhandled VDMs are ignored under PD 2.0.
                        SpecificationRevision::R3_X => State::SendNotSupported(power_source),
                        _ => State::Ready(power_source, false),
                    },
                }
            }
            State::SendVdm(buffer, power_source) => {
                self.protocol_layer.sink_tx_delay().await;
                self.protocol_layer
                    .transmit_vdm(buffer.sop, buffer.header, buffer.objects)
                    .await?;

                self.complete_command(ResponseStatus::Sent).await;
                State::Ready(power_source, false)
            }
            State::BistCarrierMode(power_source) => {
                // The PHY transmits the carrier; hold off all messaging.
                TimerType::get_timer::<TIMER>(TimerType::BISTContMode).await;
                State::Ready(power_source, false)
            }
            State::BistTestData(_) => {
                // Discard all traffic until a reset ends test-data mode.
                loop {
                    let _ = self.protocol_layer.receive_message().await?;
                }
            }
            State::EprModeEntry(power_source, operational_pdp) => {
                // Request entry into EPR mode; the data field carries the
                // EPR sink operational PDP in watts.
                let pdp_watts: u8 = operational_pdp.get::<watt>() as u8;
                self.protocol_layer.transmit_epr_mode(Action::Enter, pdp_watts).await?;

                let message = self
                    .protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[MessageType::Data(DataMessageType::EprMode)],
                        TimerType::SenderResponse,
                    )
                    .await?;

                let Some(Payload::Data(Data::EprMode(epr_mode))) = message.payload else {
                    unreachable!()
                };

                match epr_mode.action() {
                    Ok(Action::EnterAcknowledged) => State::EprEntryWaitForResponse(power_source),
                    Ok(Action::EnterSucceeded) => {
                        // Source skipped the acknowledgment.
                        self.mode = Mode::Epr;
                        self.device_policy_manager.notify(&dpm::Event::EprEntered).await;
                        self.complete_command(ResponseStatus::ResponseReceived).await;
                        State::EprWaitForCapabilities(power_source)
                    }
                    Ok(Action::Exit) => State::EprExitReceived(power_source),
                    Ok(Action::EnterFailed) => {
                        let reason = epr_mode::DataEnterFailed::from(epr_mode.data());
                        self.device_policy_manager.epr_mode_entry_failed(reason).await;
                        self.device_policy_manager
                            .notify(&dpm::Event::EprEntryFailed(reason))
                            .await;
                        self.complete_command(ResponseStatus::Failed).await;
                        State::SendSoftReset
                    }
                    // Any other EPR mode message demands a soft reset.
                    _ => State::SendSoftReset,
                }
            }
            State::EprEntryWaitForResponse(power_source) => {
                // The overall entry timeout covers the source's cable
                // discovery before it reports success.
                let message = self
                    .protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[MessageType::Data(DataMessageType::EprMode)],
                        TimerType::SinkEPREnter,
                    )
                    .await?;

                let Some(Payload::Data(Data::EprMode(epr_mode))) = message.payload else {
                    unreachable!()
                };

                match epr_mode.action() {
                    Ok(Action::EnterSucceeded) => {
                        self.mode = Mode::Epr;
                        self.device_policy_manager.notify(&dpm::Event::EprEntered).await;
                        self.complete_command(ResponseStatus::ResponseReceived).await;
                        State::EprWaitForCapabilities(power_source)
                    }
                    Ok(Action::Exit) => State::EprExitReceived(power_source),
                    Ok(Action::EnterFailed) => {
                        let reason = epr_mode::DataEnterFailed::from(epr_mode.data());
                        self.device_policy_manager.epr_mode_entry_failed(reason).await;
                        self.device_policy_manager
                            .notify(&dpm::Event::EprEntryFailed(reason))
                            .await;
                        self.complete_command(ResponseStatus::Failed).await;
                        State::SendSoftReset
                    }
                    _ => State::SendSoftReset,
                }
            }
            State::EprWaitForCapabilities(_power_source) => {
                // After successful entry, the source sends its (chunked)
                // EPR capabilities on its own.
                let message = self.protocol_layer.wait_for_source_capabilities().await?;

                match message.payload {
                    Some(Payload::Data(Data::SourceCapabilities(capabilities))) => {
                        State::EvaluateCapabilities(capabilities)
                    }
                    Some(Payload::Extended(extended::Extended::EprSourceCapabilities(pdos))) => {
                        State::EvaluateCapabilities(SourceCapabilities(pdos))
                    }
                    _ => {
                        error!("Expected source capabilities after EPR mode entry");
                        State::HardReset
                    }
                }
            }
            State::EprSendExit => {
                // Inform the partner that we are exiting EPR.
                self.protocol_layer.transmit_epr_mode(Action::Exit, 0).await?;
                self.mode = Mode::Spr;
                self.epr_keep_alive_misses = 0;
                self.device_policy_manager.notify(&dpm::Event::EprExited).await;
                self.complete_command(ResponseStatus::Sent).await;
                State::WaitForCapabilities
            }
            State::EprExitReceived(power_source) => {
                // Exiting EPR is only harmless while the active contract is
                // an SPR PDO (object positions 1..=7); otherwise hard reset.
                self.mode = Mode::Spr;
                self.epr_keep_alive_misses = 0;
                self.device_policy_manager.notify(&dpm::Event::EprExited).await;

                if power_source.object_position() >= 8 {
                    State::HardReset
                } else {
                    State::WaitForCapabilities
                }
            }
            State::EprKeepAlive(power_source) => {
                self.protocol_layer
                    .transmit_extended_control_message(ExtendedControlMessageType::EprKeepAlive)
                    .await?;

                match self
                    .protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[MessageType::Extended(ExtendedMessageType::ExtendedControl)],
                        TimerType::SenderResponse,
                    )
                    .await
                {
                    Ok(message) => {
                        if let Some(Payload::Extended(extended::Extended::ExtendedControl(control))) = message.payload
                        {
                            if control.message_type() == Ok(ExtendedControlMessageType::EprKeepAliveAck) {
                                self.epr_keep_alive_misses = 0;
                                State::Ready(power_source, false)
                            } else {
                                State::SendNotSupported(power_source)
                            }
                        } else {
                            State::SendNotSupported(power_source)
                        }
                    }
                    Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                        // Tolerate transient losses; three consecutive
                        // misses abandon EPR mode autonomously.
                        self.epr_keep_alive_misses += 1;

                        if self.epr_keep_alive_misses >= 3 {
                            self.device_policy_manager
                                .notify(&dpm::Event::EprKeepAliveTimeout)
                                .await;
                            State::EprSendExit
                        } else {
                            State::Ready(power_source, false)
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        self.state = new_state;

        Ok(None)
    }

    /// Carry out an accepted swap. Returns an exit when the engine role ends.
    async fn perform_swap(&mut self, kind: SwapKind, _power_source: PowerSource) -> Result<Option<Exit>, Error> {
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
                // Wait for the source to remove power and report PS_RDY.
                self.protocol_layer
                    .receive_message_type(
                        SopTarget::Sop,
                        &[MessageType::Control(ControlMessageType::PsRdy)],
                        TimerType::PSSourceOffSpr,
                    )
                    .await?;

                self.protocol_layer.set_power_role(PowerRole::Source);
                self.protocol_layer.reset();

                self.device_policy_manager
                    .notify(&dpm::Event::PowerRoleSwapped(PowerRole::Source))
                    .await;
                self.complete_command(ResponseStatus::ResponseReceived).await;
                Ok(Some(Exit::PowerRoleSwap))
            }
            SwapKind::Vconn => {
                if self.vconn_source {
                    // The partner takes over; wait for its PS_RDY, then stop.
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
                    // We take over: supply VCONN, then report PS_RDY.
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
    ///
    /// As UFP, the port waits for the DFP to cycle VCONN and conclude with
    /// Data_Reset_Complete. As DFP (after a data role swap), the port drives
    /// the VCONN cycle itself.
    async fn run_data_reset(&mut self, entry: DataResetState) -> Result<(), Error> {
        let mut sub_state = entry;

        loop {
            trace!("Data reset sub-state {:?}", sub_state);

            sub_state = match (self.protocol_layer.header().port_data_role(), sub_state) {
                (DataRole::Ufp, DataResetState::Accepted) => DataResetState::WaitVconnOff,
                (DataRole::Ufp, DataResetState::WaitVconnOff) => {
                    // The DFP reports VCONN off with PS_RDY.
                    self.protocol_layer
                        .receive_message_type(
                            SopTarget::Sop,
                            &[MessageType::Control(ControlMessageType::PsRdy)],
                            TimerType::DataResetFailUFP,
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
