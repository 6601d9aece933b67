//! The device policy manager (DPM) allows a device to control the sink
//! policy engine, and be informed about status changes.
//!
//! Through the DPM, a device selects which capability to request, decides on
//! swap offers, answers relayed vendor defined messages, and submits
//! commands such as entering EPR mode or renegotiating the contract.
use core::future::Future;

use heapless::Vec;

use crate::dpm::{Command, Decision, DevicePolicy, SwapKind};
use crate::protocol_layer::message::data::epr_mode::DataEnterFailed;
use crate::protocol_layer::message::data::request::{self, PowerSource};
use crate::protocol_layer::message::data::sink_capabilities::SinkCapabilities;
use crate::protocol_layer::message::data::source_capabilities::SourceCapabilities;
use crate::protocol_layer::message::data::vendor_defined::VdmHeader;

/// Events that the device policy manager can send to the policy engine.
#[derive(Debug)]
pub enum Event {
    /// Empty event.
    None,
    /// Execute a command.
    Command(Command),
}

/// Trait for the sink device policy manager.
///
/// This entity commands the policy engine and enforces device policy.
/// All methods have defaults, so a minimal sink only needs an empty
/// implementation.
pub trait DevicePolicyManager: DevicePolicy {
    /// Request a power source.
    ///
    /// Defaults to 5 V at maximum current.
    fn request(&mut self, source_capabilities: &SourceCapabilities) -> impl Future<Output = PowerSource> {
        async {
            PowerSource::new_fixed(
                request::CurrentRequest::Highest,
                request::VoltageRequest::Safe5V,
                source_capabilities,
            )
            .unwrap()
        }
    }

    /// Notify the device that it shall transition to a new power level.
    ///
    /// The device is informed about the request that was accepted by the source.
    fn transition_power(&mut self, _accepted: &PowerSource) -> impl Future<Output = ()> {
        async {}
    }

    /// The policy engine gets and evaluates device policy events when ready.
    ///
    /// By default, this is a future that never resolves.
    fn get_event(&mut self, _source_capabilities: &SourceCapabilities) -> impl Future<Output = Event> {
        async { core::future::pending().await }
    }

    /// New source capabilities were received outside of negotiation.
    fn inform(&mut self, _source_capabilities: &SourceCapabilities) -> impl Future<Output = ()> {
        async {}
    }

    /// The sink capabilities to report on Get_Sink_Cap.
    fn sink_capabilities(&mut self) -> SinkCapabilities {
        SinkCapabilities::new_vsafe5v_only(300)
    }

    /// Evaluate a swap offer from the port partner.
    ///
    /// Defaults to rejecting every swap.
    fn evaluate_swap(&mut self, _kind: SwapKind) -> impl Future<Output = Decision> {
        async { Decision::Reject }
    }

    /// Evaluate a relayed vendor defined message; `None` answers are
    /// reported as unsupported to the partner.
    fn evaluate_vdm(
        &mut self,
        _header: &VdmHeader,
        _objects: &Vec<u32, 7>,
    ) -> impl Future<Output = Option<(VdmHeader, Vec<u32, 7>)>> {
        async { None }
    }

    /// Control the VCONN supply after a VCONN swap.
    fn set_vconn(&mut self, _enabled: bool) -> impl Future<Output = ()> {
        async {}
    }

    /// A hard reset was performed; transition to default power levels.
    fn hard_reset(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// Entering EPR mode failed with the given reason.
    fn epr_mode_entry_failed(&mut self, _reason: DataEnterFailed) -> impl Future<Output = ()> {
        async {}
    }
}
