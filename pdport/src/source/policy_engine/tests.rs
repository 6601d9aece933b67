//! Tests for the source policy engine.
use heapless::Vec as HVec;
use pdport_traits::SopTarget;

use super::{Mode, Source, State};
use crate::config::PortConfig;
use crate::counters::{Counter, CounterType};
use crate::dpm;
use crate::dummy::{DummyDriver, DummySourceDevice, MAX_DATA_MESSAGE_SIZE, NeverTimer, RangeTimer};
use crate::protocol_layer::message::data::epr_mode::{Action, EprModeDataObject};
use crate::protocol_layer::message::data::request::{EprRequest, FixedVariableSupply, PowerSource, RawDataObject};
use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, PowerDataObject};
use crate::protocol_layer::message::data::vendor_defined::{
    CableCurrent, CableMaxVoltage, CableVdo, VdmCommand, VdmCommandType, VdmHeader, VdmHeaderStructured,
    VdmIdentityHeader,
};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::extended::chunked::ChunkedMessageAssembler;
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload};
use crate::source::cable::CableIdentity;
use crate::timers::Timer;
use crate::units::ElectricPotential;
use crate::{DataRole, PowerRole};
use uom::si::electric_potential::volt;

/// Fires only the source supply transition delay.
type NegotiationTimer = RangeTimer<28, 28>;

fn epr_source_pdo() -> PowerDataObject {
    PowerDataObject::FixedSupply(FixedSupply::new().with_raw_voltage(560).with_raw_max_current(500))
}

fn source_config(cable_discovery: bool) -> PortConfig {
    let mut pdos: HVec<PowerDataObject, 7> = HVec::new();
    pdos.push(PowerDataObject::FixedSupply(
        FixedSupply::new()
            .with_raw_voltage(100)
            .with_raw_max_current(300)
            .with_epr_mode_capable(true),
    ))
    .unwrap();
    pdos.push(PowerDataObject::FixedSupply(
        FixedSupply::new().with_raw_voltage(180).with_raw_max_current(300),
    ))
    .unwrap();

    let mut config = PortConfig::source_default(pdos);
    config.cable_discovery = cable_discovery;
    config.epr_supported = true;
    config.epr_source_pdos.push(epr_source_pdo()).unwrap();
    config.epr_source_pdo_mask = 0b1;
    config
}

fn get_policy_engine<TIMER: Timer>(
    cable_discovery: bool,
) -> Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummySourceDevice> {
    Source::new(DummyDriver::new(), DummySourceDevice::new(), source_config(cable_discovery))
}

/// Header template for simulated sink messages (Sink/Ufp roles).
fn get_sink_header_template() -> Header {
    Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X)
}

/// Header template for simulated cable plug messages on SOP'.
fn get_cable_header_template() -> Header {
    Header(0)
        .with_spec_revision(SpecificationRevision::R3_X)
        .with_cable_plug(true)
}

fn simulate_sink_control_message<TIMER: Timer>(
    policy_engine: &mut Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummySourceDevice>,
    control_message_type: ControlMessageType,
    message_id: u8,
) {
    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];

    let len = Message::new(Header::new_control(
        get_sink_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        control_message_type,
    ))
    .to_bytes(&mut buf);
    policy_engine.protocol_layer.driver().inject_received_data(&buf[..len]);
}

fn simulate_sink_data_message<TIMER: Timer>(
    policy_engine: &mut Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummySourceDevice>,
    message_type: DataMessageType,
    data: Data,
    message_id: u8,
) {
    let header = Header::new_data(
        get_sink_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        message_type,
        data.num_objects(),
    );

    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let len = Message::new_with_data(header, data).to_bytes(&mut buf);
    policy_engine.protocol_layer.driver().inject_received_data(&buf[..len]);
}

fn probe_message<TIMER: Timer>(
    policy_engine: &mut Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummySourceDevice>,
) -> Message {
    Message::from_bytes(&policy_engine.protocol_layer.driver().probe_transmitted_data()).unwrap()
}

fn assert_good_crc<TIMER: Timer>(
    policy_engine: &mut Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummySourceDevice>,
) {
    let message = probe_message(policy_engine);
    assert!(matches!(
        message.header.message_type(),
        MessageType::Control(ControlMessageType::GoodCRC)
    ));
}

#[tokio::test]
async fn test_source_negotiation() {
    let mut policy_engine = get_policy_engine::<NegotiationTimer>(false);

    // `Startup` -> `SendCapabilities` (cable discovery disabled).
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::SendCapabilities));

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_sink_data_message(
        &mut policy_engine,
        DataMessageType::Request,
        Data::Request(PowerSource::FixedVariableSupply(
            FixedVariableSupply(0)
                .with_object_position(2)
                .with_raw_operating_current(300)
                .with_raw_max_operating_current(300),
        )),
        0,
    );

    // `SendCapabilities` -> `NegotiateCapability`
    policy_engine.run_step().await.unwrap();

    let capabilities = probe_message(&mut policy_engine);
    assert!(matches!(
        capabilities.header.message_type(),
        MessageType::Data(DataMessageType::SourceCapabilities)
    ));
    assert_eq!(capabilities.header.message_id(), 0);
    assert_eq!(capabilities.header.num_objects(), 2);
    assert_good_crc(&mut policy_engine);

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    // `NegotiateCapability` -> `TransitionSupply`
    policy_engine.run_step().await.unwrap();

    let accept = probe_message(&mut policy_engine);
    assert!(matches!(
        accept.header.message_type(),
        MessageType::Control(ControlMessageType::Accept)
    ));
    assert_eq!(accept.header.message_id(), 1);

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 2);

    // `TransitionSupply` -> `Ready`
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready));

    let ps_rdy = probe_message(&mut policy_engine);
    assert!(matches!(
        ps_rdy.header.message_type(),
        MessageType::Control(ControlMessageType::PsRdy)
    ));
    assert_eq!(ps_rdy.header.message_id(), 2);

    assert!(policy_engine.granted.is_some());

    let log = policy_engine.device_policy_manager.log.clone();
    let contract = log
        .borrow()
        .events
        .iter()
        .find_map(|event| match event {
            dpm::Event::ContractNegotiated(contract) => Some(*contract),
            _ => None,
        })
        .expect("contract event missing");
    assert_eq!(contract.max_voltage, ElectricPotential::new::<volt>(9));
}

#[tokio::test]
async fn test_request_with_object_position_zero_answered_not_supported() {
    let mut policy_engine = get_policy_engine::<NegotiationTimer>(false);

    policy_engine.run_step().await.unwrap();

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    // A request towards object position zero is malformed.
    simulate_sink_data_message(
        &mut policy_engine,
        DataMessageType::Request,
        Data::Request(PowerSource::Unknown(RawDataObject(0))),
        0,
    );

    // `SendCapabilities` -> `NegotiateCapability`
    policy_engine.run_step().await.unwrap();
    let _capabilities = probe_message(&mut policy_engine);
    assert_good_crc(&mut policy_engine);

    // `NegotiateCapability` -> `SendNotSupported`, without any reset.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::SendNotSupported));

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    policy_engine.run_step().await.unwrap();

    let response = probe_message(&mut policy_engine);
    assert!(matches!(
        response.header.message_type(),
        MessageType::Control(ControlMessageType::NotSupported)
    ));
    assert_eq!(policy_engine.protocol_layer.driver().hard_reset_count(), 0);
}

#[tokio::test]
async fn test_epr_request_pdo_mismatch_forces_hard_reset() {
    // Fires the hard reset completion delay.
    let mut policy_engine = get_policy_engine::<RangeTimer<30, 30>>(false);

    policy_engine.mode = Mode::Epr;
    policy_engine.advertised = policy_engine.config.epr_source_capabilities();
    policy_engine.granted = Some(PowerSource::FixedVariableSupply(
        FixedVariableSupply(0).with_object_position(1),
    ));

    // The copied PDO claims 20 V, the advertisement at position 8 says 28 V.
    let mismatched = EprRequest::new_fixed(7, &FixedSupply::new().with_raw_voltage(400).with_raw_max_current(500));
    policy_engine.state = State::NegotiateCapability(PowerSource::EprRequest(mismatched));

    // The mismatch is a protocol violation.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::HardReset));

    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::TransitionToDefault));
    assert_eq!(policy_engine.protocol_layer.driver().hard_reset_count(), 1);
}

#[tokio::test]
async fn test_cable_discovery_identifies_marked_cable() {
    // Fires the VCONN settling delay of discovery entry.
    let mut policy_engine = get_policy_engine::<RangeTimer<50, 50>>(true);

    // `Startup` -> `CableDiscovery`
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::CableDiscovery));

    // Cable soft reset: GoodCrc for our Soft_Reset, then the marker's Accept.
    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let len = Message::new(Header::new_control(
        get_cable_header_template(),
        Counter::new_from_value(CounterType::MessageId, 0),
        ControlMessageType::GoodCRC,
    ))
    .to_bytes(&mut buf);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data_on(SopTarget::SopPrime, &buf[..len]);

    let len = Message::new(Header::new_control(
        get_cable_header_template(),
        Counter::new_from_value(CounterType::MessageId, 0),
        ControlMessageType::Accept,
    ))
    .to_bytes(&mut buf);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data_on(SopTarget::SopPrime, &buf[..len]);

    // GoodCrc for Discover Identity, then the marker's ACK.
    let len = Message::new(Header::new_control(
        get_cable_header_template(),
        Counter::new_from_value(CounterType::MessageId, 1),
        ControlMessageType::GoodCRC,
    ))
    .to_bytes(&mut buf);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data_on(SopTarget::SopPrime, &buf[..len]);

    let mut objects: HVec<u32, 7> = HVec::new();
    objects
        .push(VdmIdentityHeader(0).with_product_type_ufp(0b011).with_vid(0x04b4).0)
        .unwrap();
    objects.push(0).unwrap(); // Cert Stat
    objects.push(0).unwrap(); // Product
    objects
        .push(
            CableVdo(0)
                .with_max_voltage(CableMaxVoltage::V50)
                .with_max_current(CableCurrent::Current5A)
                .with_epr_mode_capable(true)
                .0,
        )
        .unwrap();

    let ack_header = VdmHeaderStructured::discover_identity_request()
        .with_command_type(VdmCommandType::ResponderAck);
    let data = Data::VendorDefined((VdmHeader::Structured(ack_header), objects));
    let header = Header::new_data(
        get_cable_header_template(),
        Counter::new_from_value(CounterType::MessageId, 1),
        DataMessageType::VendorDefined,
        data.num_objects(),
    );
    let len = Message::new_with_data(header, data).to_bytes(&mut buf);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data_on(SopTarget::SopPrime, &buf[..len]);

    // `CableDiscovery` -> `SendCapabilities`, with the cable identified.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::SendCapabilities));

    let identity = policy_engine.cable.expect("cable identity missing");
    assert_eq!(identity.max_voltage, CableMaxVoltage::V50);
    assert_eq!(identity.max_current, CableCurrent::Current5A);
    assert!(identity.epr_capable);
    assert!(!identity.active);

    // Soft_Reset and Discover Identity both went to the cable plug.
    let (sop, soft_reset) = policy_engine.protocol_layer.driver().probe_transmitted();
    assert_eq!(sop, SopTarget::SopPrime);
    let soft_reset = Message::from_bytes(&soft_reset).unwrap();
    assert!(matches!(
        soft_reset.header.message_type(),
        MessageType::Control(ControlMessageType::SoftReset)
    ));

    let (sop, _good_crc) = policy_engine.protocol_layer.driver().probe_transmitted();
    assert_eq!(sop, SopTarget::SopPrime);

    let (sop, discover) = policy_engine.protocol_layer.driver().probe_transmitted();
    assert_eq!(sop, SopTarget::SopPrime);
    let discover = Message::from_bytes(&discover).unwrap();
    let Some(Payload::Data(Data::VendorDefined((VdmHeader::Structured(vdm), _)))) = discover.payload else {
        panic!("Expected a structured VDM");
    };
    assert_eq!(vdm.command(), VdmCommand::DiscoverIdentity);
    assert_eq!(vdm.command_type(), VdmCommandType::InitiatorReq);

    let log = policy_engine.device_policy_manager.log.clone();
    assert!(
        log.borrow()
            .events
            .iter()
            .any(|e| matches!(e, dpm::Event::CableIdentified))
    );
}

#[tokio::test]
async fn test_epr_entry_and_chunked_capability_advertisement() {
    let mut policy_engine = get_policy_engine::<NegotiationTimer>(false);

    // Put the engine into Ready with an SPR contract and a 50 V cable.
    policy_engine.granted = Some(PowerSource::FixedVariableSupply(
        FixedVariableSupply(0).with_object_position(1),
    ));
    policy_engine.cable = Some(CableIdentity {
        max_voltage: CableMaxVoltage::V50,
        max_current: CableCurrent::Current5A,
        epr_capable: true,
        active: false,
    });
    policy_engine.state = State::Ready;

    // The sink asks to enter EPR mode with a 140 W operational PDP.
    simulate_sink_data_message(
        &mut policy_engine,
        DataMessageType::EprMode,
        Data::EprMode(EprModeDataObject::default().with_action(Action::Enter).with_data(140)),
        0,
    );

    // `Ready` -> `EprEvaluateEntry`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(&mut policy_engine);
    assert!(matches!(policy_engine.state, State::EprEvaluateEntry(140)));

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    // `EprEvaluateEntry` -> `EprSendCapabilities`
    policy_engine.run_step().await.unwrap();
    assert_eq!(policy_engine.mode, Mode::Epr);

    let enter_ack = probe_message(&mut policy_engine);
    let Some(Payload::Data(Data::EprMode(mode))) = enter_ack.payload else {
        panic!("Expected EPR mode payload");
    };
    assert_eq!(mode.action().unwrap(), Action::EnterAcknowledged);

    let enter_succeeded = probe_message(&mut policy_engine);
    let Some(Payload::Data(Data::EprMode(mode))) = enter_succeeded.payload else {
        panic!("Expected EPR mode payload");
    };
    assert_eq!(mode.action().unwrap(), Action::EnterSucceeded);

    // The EPR capability set spans two chunks; the sink requests chunk 1 and
    // finally issues an EPR request for position 8.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 2);

    let chunk_request_header = Header::new_extended(
        get_sink_header_template(),
        Counter::new_from_value(CounterType::MessageId, 1),
        ExtendedMessageType::EprSourceCapabilities,
        1,
    );
    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let mut len = chunk_request_header.to_bytes(&mut buf);
    len += ChunkedMessageAssembler::build_chunk_request_header(1).to_bytes(&mut buf[len..]);
    len += 2; // Padding to a full data object.
    policy_engine.protocol_layer.driver().inject_received_data(&buf[..len]);

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 3);

    let matching = EprRequest::new_fixed(7, &FixedSupply::new().with_raw_voltage(560).with_raw_max_current(500));
    simulate_sink_data_message(
        &mut policy_engine,
        DataMessageType::EprRequest,
        Data::Request(PowerSource::EprRequest(matching)),
        2,
    );

    // `EprSendCapabilities` -> `NegotiateCapability`
    policy_engine.run_step().await.unwrap();
    assert!(matches!(
        policy_engine.state,
        State::NegotiateCapability(PowerSource::EprRequest(_))
    ));

    // Chunk 0 of the advertisement.
    let chunk0_bytes = policy_engine.protocol_layer.driver().probe_transmitted_data();
    let (chunk0_header, chunk0_ext, chunk0_data) = Message::parse_extended_chunk(&chunk0_bytes).unwrap();
    assert!(chunk0_header.extended());
    assert_eq!(chunk0_ext.chunk_number(), 0);
    assert_eq!(chunk0_ext.data_size(), 32);
    assert_eq!(chunk0_data.len(), 26);

    assert_good_crc(&mut policy_engine); // For the chunk request.

    let chunk1_bytes = policy_engine.protocol_layer.driver().probe_transmitted_data();
    let (_, chunk1_ext, chunk1_data) = Message::parse_extended_chunk(&chunk1_bytes).unwrap();
    assert_eq!(chunk1_ext.chunk_number(), 1);
    assert_eq!(chunk1_data.len(), 6);

    assert_good_crc(&mut policy_engine); // For the EPR request.

    let log = policy_engine.device_policy_manager.log.clone();
    assert!(log.borrow().events.iter().any(|e| matches!(e, dpm::Event::EprEntered)));
}

#[tokio::test]
async fn test_keepalive_is_acknowledged() {
    let mut policy_engine = get_policy_engine::<NeverTimer>(false);

    policy_engine.mode = Mode::Epr;
    policy_engine.granted = Some(PowerSource::FixedVariableSupply(
        FixedVariableSupply(0).with_object_position(1),
    ));
    policy_engine.state = State::Ready;

    // The sink's keep-alive arrives as a single-chunk extended control message.
    let keep_alive = crate::protocol_layer::message::extended::Extended::ExtendedControl(
        crate::protocol_layer::message::extended::extended_control::ExtendedControl::default().with_message_type(
            crate::protocol_layer::message::extended::extended_control::ExtendedControlMessageType::EprKeepAlive,
        ),
    );
    let header = Header::new_extended(
        get_sink_header_template(),
        Counter::new_from_value(CounterType::MessageId, 0),
        ExtendedMessageType::ExtendedControl,
        1,
    );
    let mut message = Message::new(header);
    message.payload = Some(Payload::Extended(keep_alive));
    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let len = message.to_bytes(&mut buf);
    policy_engine.protocol_layer.driver().inject_received_data(&buf[..len]);

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);

    // The keep-alive is acknowledged and the engine stays Ready.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready));

    assert_good_crc(&mut policy_engine);
    let ack = probe_message(&mut policy_engine);
    let Some(Payload::Extended(crate::protocol_layer::message::extended::Extended::ExtendedControl(control))) =
        ack.payload
    else {
        panic!("Expected an extended control message");
    };
    assert_eq!(
        control.message_type().unwrap(),
        crate::protocol_layer::message::extended::extended_control::ExtendedControlMessageType::EprKeepAliveAck
    );
}

#[tokio::test]
async fn test_keepalive_watchdog_forces_hard_reset() {
    // Fires only the source keep-alive watchdog.
    let mut policy_engine = get_policy_engine::<RangeTimer<875, 875>>(false);

    policy_engine.mode = Mode::Epr;
    policy_engine.granted = Some(PowerSource::FixedVariableSupply(
        FixedVariableSupply(0).with_object_position(1),
    ));
    policy_engine.state = State::Ready;

    // No keep-alive ever arrives; the watchdog escalates to hard reset.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::HardReset));
}
