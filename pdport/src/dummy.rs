//! Dummy drivers, PHYs, timers and device policy managers for testing.
use core::cell::RefCell;
use std::rc::Rc;
use std::vec::Vec;

use pdport_traits::{
    CcPull, CcStatus, Driver, DriverRxError, DriverTxError, Fault, PowerControl, SopTarget, TypeCPhy,
};

use crate::dpm::{self, Command, CommandSlot, Decision, DevicePolicy, Response, SwapKind};
use crate::protocol_layer::message::data::request::{PowerSource, SelectionAlgorithm};
use crate::protocol_layer::message::data::source_capabilities::{PowerDataObject, SourceCapabilities};
use crate::sink::device_policy_manager::{DevicePolicyManager as SinkDevicePolicyManager, Event as SinkEvent};
use crate::source::device_policy_manager::{DevicePolicyManager as SourceDevicePolicyManager, Event as SourceEvent};
use crate::timers::Timer;

/// Maximum frame size used by the dummy driver.
pub const MAX_DATA_MESSAGE_SIZE: usize = 30;

/// A timer that never expires.
pub struct NeverTimer {}

impl Timer for NeverTimer {
    async fn after_millis(_milliseconds: u64) {
        core::future::pending().await
    }
}

/// A timer that expires immediately for periods within `MIN..=MAX`
/// milliseconds, and never otherwise.
///
/// Lets a test fire one specific timeout while all other timers stay
/// pending.
pub struct RangeTimer<const MIN: u64, const MAX: u64> {}

impl<const MIN: u64, const MAX: u64> Timer for RangeTimer<MIN, MAX> {
    async fn after_millis(milliseconds: u64) {
        if (MIN..=MAX).contains(&milliseconds) {
            return;
        }
        core::future::pending().await
    }
}

/// A dummy driver that records transmissions and replays injected frames.
pub struct DummyDriver<const N: usize> {
    rx_vec: Vec<(SopTarget, heapless::Vec<u8, N>)>,
    tx_vec: Vec<(SopTarget, heapless::Vec<u8, N>)>,
    hard_resets: usize,
}

impl<const N: usize> Default for DummyDriver<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DummyDriver<N> {
    /// Create a new dummy driver.
    pub fn new() -> Self {
        Self {
            rx_vec: Vec::new(),
            tx_vec: Vec::new(),
            hard_resets: 0,
        }
    }

    /// The number of hard reset signals transmitted by the stack.
    pub fn hard_reset_count(&self) -> usize {
        self.hard_resets
    }

    /// Inject received SOP data that is replayed on the next receive call.
    pub fn inject_received_data(&mut self, data: &[u8]) {
        self.inject_received_data_on(SopTarget::Sop, data);
    }

    /// Inject received data on a specific endpoint.
    pub fn inject_received_data_on(&mut self, sop: SopTarget, data: &[u8]) {
        let mut vec = heapless::Vec::new();
        vec.extend_from_slice(data).unwrap();

        self.rx_vec.push((sop, vec));
    }

    /// Probe data that was transmitted by the stack on SOP.
    pub fn probe_transmitted_data(&mut self) -> heapless::Vec<u8, N> {
        self.probe_transmitted().1
    }

    /// Probe transmitted data together with its endpoint.
    pub fn probe_transmitted(&mut self) -> (SopTarget, heapless::Vec<u8, N>) {
        self.tx_vec.remove(0)
    }

    /// Whether transmitted data is waiting to be probed.
    pub fn has_transmitted_data(&self) -> bool {
        !self.tx_vec.is_empty()
    }
}

impl<const N: usize> Driver for DummyDriver<N> {
    async fn receive(&mut self, buffer: &mut [u8]) -> Result<(SopTarget, usize), DriverRxError> {
        if self.rx_vec.is_empty() {
            // Step-driven tests inject data before polling; an empty queue
            // behaves like a silent line.
            core::future::pending::<()>().await;
        }

        let (sop, first) = self.rx_vec.remove(0);
        let len = first.len();
        buffer[..len].copy_from_slice(&first);

        Ok((sop, len))
    }

    async fn transmit(&mut self, sop: SopTarget, data: &[u8]) -> Result<(), DriverTxError> {
        let mut vec = heapless::Vec::new();
        vec.extend_from_slice(data).unwrap();
        self.tx_vec.push((sop, vec));

        Ok(())
    }

    async fn transmit_hard_reset(&mut self) -> Result<(), DriverTxError> {
        self.hard_resets += 1;
        Ok(())
    }

    async fn wait_for_vbus(&self) {}
}

/// Shared state of a dummy PHY.
#[derive(Debug)]
pub struct DummyPhyState {
    /// The sensed CC line status.
    pub cc_status: CcStatus,
    /// Whether VBUS is present.
    pub vbus: bool,
    /// The termination most recently applied by the stack.
    pub pull: Option<CcPull>,
    /// Faults to report.
    pub faults: Vec<Fault>,
}

/// A scripted Type-C PHY for connection manager tests.
#[derive(Clone)]
pub struct DummyPhy(pub Rc<RefCell<DummyPhyState>>);

impl Default for DummyPhy {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyPhy {
    /// Create a PHY with open CC lines and no VBUS.
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(DummyPhyState {
            cc_status: CcStatus::OPEN,
            vbus: false,
            pull: None,
            faults: Vec::new(),
        })))
    }

    /// Script the sensed CC status.
    pub fn set_cc_status(&self, status: CcStatus) {
        self.0.borrow_mut().cc_status = status;
    }

    /// Script VBUS presence.
    pub fn set_vbus(&self, present: bool) {
        self.0.borrow_mut().vbus = present;
    }

    /// The termination most recently applied by the stack.
    pub fn applied_pull(&self) -> Option<CcPull> {
        self.0.borrow().pull
    }
}

impl TypeCPhy for DummyPhy {
    fn set_cc_pull(&mut self, pull: CcPull) {
        self.0.borrow_mut().pull = Some(pull);
    }

    fn cc_status(&self) -> CcStatus {
        self.0.borrow().cc_status
    }

    async fn wait_for_cc_change(&self, previous: CcStatus) -> CcStatus {
        let current = self.0.borrow().cc_status;
        if current != previous {
            return current;
        }
        core::future::pending().await
    }

    fn vbus_present(&self) -> bool {
        self.0.borrow().vbus
    }

    async fn wait_for_vbus_change(&self, previous: bool) -> bool {
        let current = self.0.borrow().vbus;
        if current != previous {
            return current;
        }
        core::future::pending().await
    }

    async fn wait_for_fault(&self) -> Fault {
        let fault = self.0.borrow_mut().faults.pop();
        match fault {
            Some(fault) => fault,
            None => core::future::pending().await,
        }
    }
}

/// Rail operations recorded by the dummy power control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RailOperation {
    /// VBUS switched.
    Vbus(bool),
    /// VCONN switched on a line.
    Vconn(pdport_traits::CcPin, bool),
    /// VBUS discharged.
    Discharge,
}

/// A power control stub that records every rail operation.
#[derive(Clone, Default)]
pub struct DummyRails(pub Rc<RefCell<Vec<RailOperation>>>);

impl DummyRails {
    /// Create a new rail recorder.
    pub fn new() -> Self {
        Default::default()
    }

    /// The recorded rail operations.
    pub fn operations(&self) -> Vec<RailOperation> {
        self.0.borrow().clone()
    }
}

impl PowerControl for DummyRails {
    async fn set_vbus(&mut self, enabled: bool) {
        self.0.borrow_mut().push(RailOperation::Vbus(enabled));
    }

    async fn set_vconn(&mut self, pin: pdport_traits::CcPin, enabled: bool) {
        self.0.borrow_mut().push(RailOperation::Vconn(pin, enabled));
    }

    async fn discharge_vbus(&mut self) {
        self.0.borrow_mut().push(RailOperation::Discharge);
    }
}

/// Recorded observations of a dummy device policy manager.
#[derive(Default)]
pub struct DeviceLog {
    /// Notifications received from the stack.
    pub events: Vec<dpm::Event>,
    /// Command completions received from the stack.
    pub responses: Vec<Response>,
}

/// A dummy sink device.
///
/// Selects capabilities with the given algorithm, queues at most one
/// command, and records notifications for assertions.
pub struct DummySinkDevice {
    /// The PDO selection algorithm for requests.
    pub algorithm: SelectionAlgorithm,
    /// The answer given to swap offers.
    pub swap_decision: Decision,
    /// Single-slot command queue feeding `get_event`.
    pub commands: CommandSlot,
    /// Recorded observations.
    pub log: Rc<RefCell<DeviceLog>>,
}

impl Default for DummySinkDevice {
    fn default() -> Self {
        Self::new(SelectionAlgorithm::HighestVoltage)
    }
}

impl DummySinkDevice {
    /// Create a sink device selecting PDOs with the given algorithm.
    pub fn new(algorithm: SelectionAlgorithm) -> Self {
        Self {
            algorithm,
            swap_decision: Decision::Reject,
            commands: CommandSlot::new(),
            log: Default::default(),
        }
    }

    /// Submit a command for the next `get_event` poll.
    pub fn submit(&mut self, command: Command) {
        self.commands.submit(command).unwrap();
    }
}

impl DevicePolicy for DummySinkDevice {
    async fn notify(&mut self, event: &dpm::Event) {
        self.log.borrow_mut().events.push(event.clone());
    }

    async fn command_complete(&mut self, response: Response) {
        self.log.borrow_mut().responses.push(response);
    }
}

impl SinkDevicePolicyManager for DummySinkDevice {
    async fn request(&mut self, source_capabilities: &SourceCapabilities) -> PowerSource {
        // Once EPR capabilities are on offer, go for the highest EPR supply.
        if source_capabilities.pdos().iter().any(PowerDataObject::is_epr) {
            PowerSource::new_epr_highest_fixed_voltage(source_capabilities).unwrap()
        } else {
            PowerSource::new_with_algorithm(self.algorithm, source_capabilities).unwrap()
        }
    }

    async fn get_event(&mut self, _source_capabilities: &SourceCapabilities) -> SinkEvent {
        match self.commands.take() {
            Some(command) => SinkEvent::Command(command),
            None => core::future::pending().await,
        }
    }

    async fn evaluate_swap(&mut self, _kind: SwapKind) -> Decision {
        self.swap_decision
    }
}

/// A dummy source device that accepts every request and records
/// notifications for assertions.
#[derive(Default)]
pub struct DummySourceDevice {
    /// Single-slot command queue feeding `get_event`.
    pub commands: CommandSlot,
    /// Recorded observations.
    pub log: Rc<RefCell<DeviceLog>>,
}

impl DummySourceDevice {
    /// Create a new source device.
    pub fn new() -> Self {
        Default::default()
    }

    /// Submit a command for the next `get_event` poll.
    pub fn submit(&mut self, command: Command) {
        self.commands.submit(command).unwrap();
    }
}

impl DevicePolicy for DummySourceDevice {
    async fn notify(&mut self, event: &dpm::Event) {
        self.log.borrow_mut().events.push(event.clone());
    }

    async fn command_complete(&mut self, response: Response) {
        self.log.borrow_mut().responses.push(response);
    }
}

impl SourceDevicePolicyManager for DummySourceDevice {
    async fn get_event(&mut self) -> SourceEvent {
        match self.commands.take() {
            Some(command) => SourceEvent::Command(command),
            None => core::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use pdport_traits::Driver;

    use super::DummyDriver;

    #[tokio::test]
    async fn test_receive() {
        let mut driver: DummyDriver<30> = DummyDriver::new();

        let mut injected_data = [0u8; 30];
        injected_data[0] = 123;

        driver.inject_received_data(&injected_data);

        injected_data[1] = 255;
        driver.inject_received_data(&injected_data);

        let mut buf = [0u8; 30];
        driver.receive(&mut buf).await.unwrap();

        assert_eq!(buf[0], 123);
        assert_eq!(buf[1], 0);

        let mut buf = [0u8; 30];
        driver.receive(&mut buf).await.unwrap();

        assert_eq!(buf[0], 123);
        assert_eq!(buf[1], 255);
    }
}
