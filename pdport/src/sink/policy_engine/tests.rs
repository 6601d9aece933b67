//! Tests for the sink policy engine.
use heapless::Vec as HVec;

use super::{Exit, Mode, Sink, State};
use crate::config::PortConfig;
use crate::counters::{Counter, CounterType};
use crate::dpm::{self, Command, Decision};
use crate::dummy::{DummyDriver, DummySinkDevice, MAX_DATA_MESSAGE_SIZE, NeverTimer, RangeTimer};
use crate::protocol_layer::message::data::epr_mode::{Action, EprModeDataObject};
use crate::protocol_layer::message::data::request::PowerSource;
use crate::protocol_layer::message::data::source_capabilities::{
    FixedSupply, MAX_EPR_PDOS, PowerDataObject, SourceCapabilities,
};
use crate::protocol_layer::message::data::vendor_defined::{VdmHeader, VdmHeaderStructured};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::extended::ExtendedHeader;
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload, extended};
use crate::timers::Timer;
use crate::units::ElectricPotential;
use crate::{DataRole, PowerRole};
use uom::si::electric_current::centiampere;
use uom::si::electric_potential::volt;

/// Fires only the SinkTx collision-avoidance delay.
type NegotiationTimer = RangeTimer<18, 18>;

fn sink_config() -> PortConfig {
    let mut config = PortConfig::sink_default();
    config.manufacturer.vid = 0x1234;
    config.manufacturer.pid = 0x5678;
    config.manufacturer.string.extend_from_slice(b"pdport").unwrap();
    config.epr_supported = true;
    config.epr_operational_pdp_w = 140;
    config
}

fn get_policy_engine<TIMER: Timer>(
    device: DummySinkDevice,
) -> Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummySinkDevice> {
    Sink::new(DummyDriver::new(), device, sink_config())
}

/// Header template for simulated source messages (Source/Dfp roles).
fn get_source_header_template() -> Header {
    Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X)
}

fn simulate_source_control_message<TIMER: Timer>(
    policy_engine: &mut Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummySinkDevice>,
    control_message_type: ControlMessageType,
    message_id: u8,
) {
    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];

    let len = Message::new(Header::new_control(
        get_source_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        control_message_type,
    ))
    .to_bytes(&mut buf);
    policy_engine.protocol_layer.driver().inject_received_data(&buf[..len]);
}

fn simulate_source_data_message<TIMER: Timer>(
    policy_engine: &mut Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummySinkDevice>,
    message_type: DataMessageType,
    data: Data,
    message_id: u8,
) {
    let header = Header::new_data(
        get_source_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        message_type,
        data.num_objects(),
    );

    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let len = Message::new_with_data(header, data).to_bytes(&mut buf);
    policy_engine.protocol_layer.driver().inject_received_data(&buf[..len]);
}

/// Source capabilities: 5 V / 3 A and 9 V / 3 A.
fn spr_capabilities() -> SourceCapabilities {
    let mut pdos: HVec<PowerDataObject, MAX_EPR_PDOS> = HVec::new();
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
    SourceCapabilities(pdos)
}

fn probe_message<TIMER: Timer>(
    policy_engine: &mut Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummySinkDevice>,
) -> Message {
    Message::from_bytes(&policy_engine.protocol_layer.driver().probe_transmitted_data()).unwrap()
}

fn assert_good_crc<TIMER: Timer>(
    policy_engine: &mut Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummySinkDevice>,
) {
    let message = probe_message(policy_engine);
    assert!(matches!(
        message.header.message_type(),
        MessageType::Control(ControlMessageType::GoodCRC)
    ));
}

/// Drive the engine from Discovery to Ready with an explicit 9 V contract.
///
/// Consumes source message IDs 0..=2 and sink message ID 0 (the request).
async fn negotiate_to_ready<TIMER: Timer>(
    policy_engine: &mut Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummySinkDevice>,
) -> Message {
    simulate_source_data_message(
        policy_engine,
        DataMessageType::SourceCapabilities,
        Data::SourceCapabilities(spr_capabilities()),
        0,
    );

    // `Discovery` -> `WaitForCapabilities`
    policy_engine.run_step().await.unwrap();

    // `WaitForCapabilities` -> `EvaluateCapabilities`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(policy_engine);

    // `EvaluateCapabilities` -> `SelectCapability`
    policy_engine.run_step().await.unwrap();

    // Acknowledge the request, then accept it.
    simulate_source_control_message(policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_source_control_message(policy_engine, ControlMessageType::Accept, 1);

    // `SelectCapability` -> `TransitionSink`
    policy_engine.run_step().await.unwrap();

    let request = probe_message(policy_engine);
    assert!(matches!(
        request.header.message_type(),
        MessageType::Data(DataMessageType::Request)
    ));
    assert_good_crc(policy_engine);

    simulate_source_control_message(policy_engine, ControlMessageType::PsRdy, 2);

    // `TransitionSink` -> `Ready`
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));
    assert_good_crc(policy_engine);

    request
}

#[tokio::test]
async fn test_negotiation() {
    let mut policy_engine = get_policy_engine::<NegotiationTimer>(DummySinkDevice::default());

    let request = negotiate_to_ready(&mut policy_engine).await;

    // The highest-voltage algorithm picks the 9 V supply in position 2.
    let Some(Payload::Data(Data::Request(PowerSource::FixedVariableSupply(rdo)))) = request.payload else {
        panic!("Expected a fixed supply request");
    };
    assert_eq!(rdo.object_position(), 2);
    assert_eq!(rdo.raw_operating_current(), 300);

    // The contract reported to the device is 9 V at 3 A, explicit, SPR.
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
    assert_eq!(contract.operating_current.unwrap().get::<centiampere>(), 300);
    assert!(contract.explicit);
    assert!(!contract.epr);
}

#[tokio::test]
async fn test_duplicate_messages_are_filtered() {
    let mut policy_engine = get_policy_engine::<NegotiationTimer>(DummySinkDevice::default());
    negotiate_to_ready(&mut policy_engine).await;

    // Answer Get_Sink_Cap once.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GetSinkCap, 3);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    // `Ready` -> `GiveSinkCap`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(&mut policy_engine);

    // `GiveSinkCap` -> `Ready`
    policy_engine.run_step().await.unwrap();

    let sink_caps = probe_message(&mut policy_engine);
    assert!(matches!(
        sink_caps.header.message_type(),
        MessageType::Data(DataMessageType::SinkCapabilities)
    ));
    // Message IDs increment without gaps: request was 0, sink caps are 1.
    assert_eq!(sink_caps.header.message_id(), 1);

    // A retransmission of the same Get_Sink_Cap is acknowledged, but not
    // delivered again; the following Ping is handled instead.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GetSinkCap, 3);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Ping, 4);

    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    assert_good_crc(&mut policy_engine);
    assert_good_crc(&mut policy_engine);
    // No second Sink_Capabilities message was produced for the duplicate.
    assert!(!policy_engine.protocol_layer.driver().has_transmitted_data());
}

#[tokio::test]
async fn test_unsupported_message_answered_without_reset() {
    let mut policy_engine = get_policy_engine::<NegotiationTimer>(DummySinkDevice::default());
    negotiate_to_ready(&mut policy_engine).await;

    // A reserved data message type must be answered with Not_Supported.
    let header = get_source_header_template()
        .with_message_type_raw(0b1_1101)
        .with_num_objects(1)
        .with_message_id(3);
    let mut buf = [0u8; 6];
    header.to_bytes(&mut buf);
    policy_engine.protocol_layer.driver().inject_received_data(&buf);

    // `Ready` -> `SendNotSupported`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(&mut policy_engine);

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    // `SendNotSupported` -> `Ready`, no reset.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    let response = probe_message(&mut policy_engine);
    assert!(matches!(
        response.header.message_type(),
        MessageType::Control(ControlMessageType::NotSupported)
    ));
    assert_eq!(policy_engine.protocol_layer.driver().hard_reset_count(), 0);
}

#[tokio::test]
async fn test_hard_reset_counter_is_capped() {
    let mut policy_engine = get_policy_engine::<NeverTimer>(DummySinkDevice::default());

    // Three hard reset cycles are allowed.
    for cycle in 1..=3 {
        policy_engine.state = State::HardReset;
        policy_engine.run_step().await.unwrap();
        assert!(matches!(policy_engine.state, State::TransitionToDefault));
        assert_eq!(policy_engine.protocol_layer.driver().hard_reset_count(), cycle);
    }

    // The fourth attempt concludes that the partner is unresponsive.
    policy_engine.state = State::HardReset;
    assert!(policy_engine.run_step().await.is_err());
    assert_eq!(policy_engine.protocol_layer.driver().hard_reset_count(), 3);
}

/// Inject one chunk of an EPR_Source_Capabilities transfer.
fn simulate_epr_caps_chunk<TIMER: Timer>(
    policy_engine: &mut Sink<DummyDriver<MAX_DATA_MESSAGE_SIZE>, TIMER, DummySinkDevice>,
    payload: &[u8],
    total_size: u16,
    chunk_number: u8,
    message_id: u8,
) {
    let num_objects = (2 + payload.len()).div_ceil(4) as u8;
    let header = Header::new_extended(
        get_source_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        ExtendedMessageType::EprSourceCapabilities,
        num_objects,
    );

    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let mut len = header.to_bytes(&mut buf);
    len += ExtendedHeader::new(total_size)
        .with_chunked(true)
        .with_chunk_number(chunk_number)
        .to_bytes(&mut buf[len..]);
    buf[len..len + payload.len()].copy_from_slice(payload);
    len += payload.len();

    policy_engine.protocol_layer.driver().inject_received_data(&buf[..len]);
}

/// EPR capability set: 5 V / 3 A in position 1, 28 V / 5 A in position 8.
fn epr_capabilities() -> SourceCapabilities {
    let mut pdos: HVec<PowerDataObject, MAX_EPR_PDOS> = HVec::new();
    pdos.push(PowerDataObject::FixedSupply(
        FixedSupply::new()
            .with_raw_voltage(100)
            .with_raw_max_current(300)
            .with_epr_mode_capable(true),
    ))
    .unwrap();
    for _ in 0..6 {
        pdos.push(PowerDataObject::FixedSupply(FixedSupply(0))).unwrap();
    }
    pdos.push(PowerDataObject::FixedSupply(
        FixedSupply::new().with_raw_voltage(560).with_raw_max_current(500),
    ))
    .unwrap();
    SourceCapabilities(pdos)
}

#[tokio::test]
async fn test_epr_negotiation() {
    let mut policy_engine = get_policy_engine::<NegotiationTimer>(DummySinkDevice::default());
    negotiate_to_ready(&mut policy_engine).await;

    // The application asks to enter EPR mode.
    policy_engine.device_policy_manager.submit(Command::EnterEprMode);

    // `Ready` -> `EprModeEntry`
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::EprModeEntry(..)));

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    simulate_source_data_message(
        &mut policy_engine,
        DataMessageType::EprMode,
        Data::EprMode(EprModeDataObject::default().with_action(Action::EnterAcknowledged)),
        3,
    );

    // `EprModeEntry` -> `EprEntryWaitForResponse`
    policy_engine.run_step().await.unwrap();

    let epr_enter = probe_message(&mut policy_engine);
    assert!(matches!(
        epr_enter.header.message_type(),
        MessageType::Data(DataMessageType::EprMode)
    ));
    let Some(Payload::Data(Data::EprMode(mode))) = epr_enter.payload else {
        panic!("Expected EPR mode payload");
    };
    assert_eq!(mode.action().unwrap(), Action::Enter);
    // The entry request carries the EPR sink operational PDP.
    assert_eq!(mode.data(), 140);
    assert_good_crc(&mut policy_engine);

    simulate_source_data_message(
        &mut policy_engine,
        DataMessageType::EprMode,
        Data::EprMode(EprModeDataObject::default().with_action(Action::EnterSucceeded)),
        4,
    );

    // `EprEntryWaitForResponse` -> `EprWaitForCapabilities`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(&mut policy_engine);
    assert!(matches!(policy_engine.state, State::EprWaitForCapabilities(..)));
    assert_eq!(policy_engine.mode, Mode::Epr);

    // The source now sends its EPR capabilities in two chunks.
    let mut caps_bytes = [0u8; 32];
    let caps_size = epr_capabilities().to_bytes(&mut caps_bytes) as u16;
    assert_eq!(caps_size, 32);

    simulate_epr_caps_chunk(&mut policy_engine, &caps_bytes[..26], caps_size, 0, 5);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 2);
    simulate_epr_caps_chunk(&mut policy_engine, &caps_bytes[26..], caps_size, 1, 6);

    // `EprWaitForCapabilities` -> `EvaluateCapabilities`
    policy_engine.run_step().await.unwrap();

    assert_good_crc(&mut policy_engine);
    // The chunk request asks for chunk 1.
    let chunk_request_data = policy_engine.protocol_layer.driver().probe_transmitted_data();
    let (chunk_header, chunk_ext_header, _) = Message::parse_extended_chunk(&chunk_request_data).unwrap();
    assert!(chunk_header.extended());
    assert!(chunk_ext_header.request_chunk());
    assert_eq!(chunk_ext_header.chunk_number(), 1);
    assert_good_crc(&mut policy_engine);

    // `EvaluateCapabilities` -> `SelectCapability`
    policy_engine.run_step().await.unwrap();

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 3);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Accept, 7);

    // `SelectCapability` -> `TransitionSink`
    policy_engine.run_step().await.unwrap();

    let epr_request = probe_message(&mut policy_engine);
    assert!(matches!(
        epr_request.header.message_type(),
        MessageType::Data(DataMessageType::EprRequest)
    ));
    let Some(Payload::Data(Data::Request(PowerSource::EprRequest(epr)))) = epr_request.payload else {
        panic!("Expected an EPR request");
    };
    assert_eq!(epr.object_position(), 8);
    let PowerDataObject::FixedSupply(copied) = epr.pdo else {
        panic!("Expected a fixed supply copy");
    };
    assert_eq!(copied.raw_voltage(), 560);
    assert_eq!(copied.raw_max_current(), 500);
    assert_good_crc(&mut policy_engine);

    simulate_source_control_message(&mut policy_engine, ControlMessageType::PsRdy, 8);

    // `TransitionSink` -> `Ready`
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));
    assert_good_crc(&mut policy_engine);

    // The reported contract is 28 V in EPR mode.
    let log = policy_engine.device_policy_manager.log.clone();
    let contract = log
        .borrow()
        .events
        .iter()
        .rev()
        .find_map(|event| match event {
            dpm::Event::ContractNegotiated(contract) => Some(*contract),
            _ => None,
        })
        .unwrap();
    assert_eq!(contract.max_voltage, ElectricPotential::new::<volt>(28));
    assert!(contract.epr);
}

#[tokio::test]
async fn test_epr_keepalive_timeout_exits_to_spr() {
    // Fires the keep-alive cadence (375 ms) and the response window (30 ms),
    // while the GoodCrc window stays open.
    let mut policy_engine = get_policy_engine::<RangeTimer<30, 375>>(DummySinkDevice::default());

    let power_source = PowerSource::EprRequest(
        crate::protocol_layer::message::data::request::EprRequest::new_fixed(
            7,
            &FixedSupply::new().with_raw_voltage(560).with_raw_max_current(500),
        ),
    );
    policy_engine.mode = Mode::Epr;
    policy_engine.source_capabilities = Some(epr_capabilities());
    policy_engine.state = State::Ready(power_source, false);

    for cycle in 0..3u8 {
        // `Ready` -> `EprKeepAlive` via the keep-alive timer.
        policy_engine.run_step().await.unwrap();
        assert!(matches!(policy_engine.state, State::EprKeepAlive(..)));

        simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, cycle);

        // Keep-alive is sent, but no acknowledgment ever arrives.
        policy_engine.run_step().await.unwrap();

        let keep_alive = probe_message(&mut policy_engine);
        assert!(matches!(
            keep_alive.header.message_type(),
            MessageType::Extended(ExtendedMessageType::ExtendedControl)
        ));
    }

    // After three missed keep-alives, the engine exits EPR autonomously.
    assert!(matches!(policy_engine.state, State::EprSendExit));

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 3);
    policy_engine.run_step().await.unwrap();

    let exit = probe_message(&mut policy_engine);
    let Some(Payload::Data(Data::EprMode(mode))) = exit.payload else {
        panic!("Expected EPR mode exit");
    };
    assert_eq!(mode.action().unwrap(), Action::Exit);

    assert!(matches!(policy_engine.state, State::WaitForCapabilities));
    assert_eq!(policy_engine.mode, Mode::Spr);

    let log = policy_engine.device_policy_manager.log.clone();
    let events = &log.borrow().events;
    assert!(events.iter().any(|e| matches!(e, dpm::Event::EprKeepAliveTimeout)));
    assert!(events.iter().any(|e| matches!(e, dpm::Event::EprExited)));
}

#[tokio::test]
async fn test_data_role_swap_accepted() {
    let mut device = DummySinkDevice::default();
    device.swap_decision = Decision::Accept;
    let mut policy_engine = get_policy_engine::<NegotiationTimer>(device);
    negotiate_to_ready(&mut policy_engine).await;

    simulate_source_control_message(&mut policy_engine, ControlMessageType::DrSwap, 3);

    // `Ready` -> `EvaluateSwap`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(&mut policy_engine);

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    // `EvaluateSwap` -> `Ready`, with flipped data role.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    let accept = probe_message(&mut policy_engine);
    assert!(matches!(
        accept.header.message_type(),
        MessageType::Control(ControlMessageType::Accept)
    ));

    assert_eq!(policy_engine.protocol_layer.header().port_data_role(), DataRole::Dfp);

    let log = policy_engine.device_policy_manager.log.clone();
    assert!(
        log.borrow()
            .events
            .iter()
            .any(|e| matches!(e, dpm::Event::DataRoleSwapped(DataRole::Dfp)))
    );
}

#[tokio::test]
async fn test_power_role_swap_hands_over_to_source_engine() {
    let mut device = DummySinkDevice::default();
    device.swap_decision = Decision::Accept;
    let mut policy_engine = get_policy_engine::<NegotiationTimer>(device);
    negotiate_to_ready(&mut policy_engine).await;

    simulate_source_control_message(&mut policy_engine, ControlMessageType::PrSwap, 3);

    // `Ready` -> `EvaluateSwap`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(&mut policy_engine);

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::PsRdy, 4);

    // The accepted swap completes with the partner's PS_RDY and hands the
    // port over to the source engine.
    let exit = policy_engine.run_step().await.unwrap();
    assert!(matches!(exit, Some(Exit::PowerRoleSwap)));

    let log = policy_engine.device_policy_manager.log.clone();
    assert!(
        log.borrow()
            .events
            .iter()
            .any(|e| matches!(e, dpm::Event::PowerRoleSwapped(PowerRole::Source)))
    );
}

#[tokio::test]
async fn test_unanswered_vdm_reported_not_supported() {
    let mut policy_engine = get_policy_engine::<NegotiationTimer>(DummySinkDevice::default());
    negotiate_to_ready(&mut policy_engine).await;

    let mut objects = HVec::new();
    objects.push(0xdead_beef).unwrap();
    simulate_source_data_message(
        &mut policy_engine,
        DataMessageType::VendorDefined,
        Data::VendorDefined((VdmHeader::Structured(VdmHeaderStructured::default()), objects)),
        3,
    );

    // `Ready` -> `EvaluateVdm`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(&mut policy_engine);
    assert!(matches!(policy_engine.state, State::EvaluateVdm(..)));

    // The device does not answer the VDM; under PD 3.x, the partner gets
    // Not_Supported.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::SendNotSupported(..)));

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    policy_engine.run_step().await.unwrap();

    let response = probe_message(&mut policy_engine);
    assert!(matches!(
        response.header.message_type(),
        MessageType::Control(ControlMessageType::NotSupported)
    ));
}

#[tokio::test]
async fn test_manufacturer_info_answered_from_config() {
    let mut policy_engine = get_policy_engine::<NegotiationTimer>(DummySinkDevice::default());
    negotiate_to_ready(&mut policy_engine).await;

    // Get_Manufacturer_Info for the port.
    let header = Header::new_extended(
        get_source_header_template(),
        Counter::new_from_value(CounterType::MessageId, 3),
        ExtendedMessageType::GetManufacturerInfo,
        1,
    );
    let mut buf = [0u8; 8];
    let mut len = header.to_bytes(&mut buf);
    len += ExtendedHeader::new(2).to_bytes(&mut buf[len..]);
    buf[len] = 0; // Target: port.
    buf[len + 1] = 0;
    len += 2;
    policy_engine.protocol_layer.driver().inject_received_data(&buf[..len]);

    // `Ready` -> `GiveManufacturerInfo`
    policy_engine.run_step().await.unwrap();
    assert_good_crc(&mut policy_engine);

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    // `GiveManufacturerInfo` -> `Ready`
    policy_engine.run_step().await.unwrap();

    let response = Message::from_bytes(&policy_engine.protocol_layer.driver().probe_transmitted_data()).unwrap();
    let Some(Payload::Extended(extended::Extended::ManufacturerInfo(info))) = response.payload else {
        panic!("Expected manufacturer info");
    };
    assert_eq!(info.vid, 0x1234);
    assert_eq!(info.pid, 0x5678);
    assert_eq!(&info.string[..], b"pdport");
}
