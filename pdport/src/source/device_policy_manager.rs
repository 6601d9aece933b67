//! The device policy manager (DPM) allows a device to control the source
//! policy engine, and be informed about status changes.
//!
//! Through the DPM, a device judges received requests against its supply
//! capabilities, adjusts the supply during transitions, decides on swap
//! offers and answers relayed vendor defined messages.
use core::future::Future;

use heapless::Vec;

use crate::dpm::{Command, Decision, DevicePolicy, SwapKind};
use crate::protocol_layer::message::data::request::PowerSource;
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

/// Trait for the source device policy manager.
///
/// This entity commands the policy engine and enforces device policy.
/// All methods have defaults, so a minimal source only needs an empty
/// implementation.
pub trait DevicePolicyManager: DevicePolicy {
    /// Evaluate a request against the advertised capabilities.
    ///
    /// Defaults to accepting every request that the engine already found
    /// well-formed.
    fn evaluate_request(
        &mut self,
        _request: &PowerSource,
        _capabilities: &SourceCapabilities,
    ) -> impl Future<Output = Decision> {
        async { Decision::Accept }
    }

    /// Adjust the supply to the accepted request, before PS_RDY is sent.
    fn transition_supply(&mut self, _accepted: &PowerSource) -> impl Future<Output = ()> {
        async {}
    }

    /// Enable or disable VBUS, e.g. while recovering from a hard reset.
    fn set_vbus(&mut self, _enabled: bool) -> impl Future<Output = ()> {
        async {}
    }

    /// Control the VCONN supply.
    fn set_vconn(&mut self, _enabled: bool) -> impl Future<Output = ()> {
        async {}
    }

    /// The policy engine gets and evaluates device policy events when ready.
    ///
    /// By default, this is a future that never resolves.
    fn get_event(&mut self) -> impl Future<Output = Event> {
        async { core::future::pending().await }
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

    /// A hard reset was performed; return the supply to default levels.
    fn hard_reset(&mut self) -> impl Future<Output = ()> {
        async {}
    }
}
