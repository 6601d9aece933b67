//! Device policy manager command and event surface.
//!
//! The application submits at most one command per port through a
//! [`CommandSlot`]; the policy engine consumes it when it returns to its
//! ready state, and reports completion through a [`Response`]. Asynchronous
//! happenings are forwarded through [`Event`] notifications.
use heapless::Vec;
use pdport_traits::{Fault, SopTarget};
use uom::si::electric_current::centiampere;
use uom::si::power::watt;

use crate::protocol_layer::message::data::epr_mode::DataEnterFailed;
use crate::protocol_layer::message::data::request::PowerSource;
use crate::protocol_layer::message::data::source_capabilities::{Augmented, PowerDataObject, SourceCapabilities};
use crate::protocol_layer::message::data::vendor_defined::VdmHeader;
use crate::units::{ElectricCurrent, ElectricPotential, Power};
use crate::{DataRole, PowerRole};

/// A vendor defined message to relay, with its target endpoint.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VdmBuffer {
    /// The endpoint to address.
    pub sop: SopTarget,
    /// The VDM header.
    pub header: VdmHeader,
    /// Vendor data objects.
    pub objects: Vec<u32, 7>,
}

/// Commands the application can submit towards the policy engine.
///
/// At most one command is pending per port at any time.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Issue a hard reset.
    HardReset,
    /// Issue a soft reset on the given endpoint.
    SoftReset(SopTarget),
    /// Run the Data_Reset handshake.
    DataReset,
    /// Swap power roles.
    PowerRoleSwap,
    /// Swap data roles.
    DataRoleSwap,
    /// Swap the VCONN source.
    VconnSwap,
    /// Request a fast role swap.
    FastRoleSwap,
    /// Ask the partner for its source capabilities.
    GetSourceCapabilities,
    /// Ask the partner for its sink capabilities.
    GetSinkCapabilities,
    /// Enter EPR mode (sink role).
    EnterEprMode,
    /// Exit EPR mode (sink role).
    ExitEprMode,
    /// Request a new power level (sink role).
    RequestPower(PowerSource),
    /// Relay a vendor defined message.
    SendVdm(VdmBuffer),
    /// Change the advertised Rp level.
    SetRp(pdport_traits::RpLevel),
    /// Disable the port.
    PortDisable,
    /// Force Type-C error recovery.
    ErrorRecovery,
}

/// The swap flavors a port partner or the application can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapKind {
    /// Power role swap.
    PowerRole,
    /// Data role swap.
    DataRole,
    /// VCONN source swap.
    Vconn,
    /// Fast role swap.
    FastRole,
}

/// Application decision on a received request or swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Decision {
    /// Accept the request.
    Accept,
    /// Reject the request.
    Reject,
    /// Ask the requester to retry later.
    Wait,
}

/// Completion status of a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseStatus {
    /// The command was dropped, e.g. due to detach or reset.
    Aborted,
    /// The command was rejected or could not be carried out.
    Failed,
    /// The partner did not answer within the response window.
    TimedOut,
    /// The message was sent; no response is expected.
    Sent,
    /// The exchange completed and a response was received.
    ResponseReceived,
}

/// Completion report for a submitted command.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Response {
    /// The command this responds to.
    pub command: Command,
    /// How the command completed.
    pub status: ResponseStatus,
}

/// Errors when submitting a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// Another command is already pending.
    Busy,
}

/// Single-slot command queue: one pending command per port.
#[derive(Debug, Default)]
pub struct CommandSlot {
    pending: Option<Command>,
}

impl CommandSlot {
    /// Create an empty slot.
    pub const fn new() -> Self {
        Self { pending: None }
    }

    /// Submit a command; fails while another command is pending.
    pub fn submit(&mut self, command: Command) -> Result<(), CommandError> {
        if self.pending.is_some() {
            return Err(CommandError::Busy);
        }
        self.pending = Some(command);
        Ok(())
    }

    /// Take the pending command, leaving the slot free.
    pub fn take(&mut self) -> Option<Command> {
        self.pending.take()
    }

    /// Whether a command is waiting to be consumed.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Device policy surface shared by both port roles: event notification and
/// command completion reporting.
///
/// Notifications are fired synchronously from task context and must return
/// promptly.
pub trait DevicePolicy {
    /// An asynchronous status notification from the stack.
    fn notify(&mut self, _event: &Event) -> impl core::future::Future<Output = ()> {
        async {}
    }

    /// A previously submitted command completed.
    fn command_complete(&mut self, _response: Response) -> impl core::future::Future<Output = ()> {
        async {}
    }
}

/// An explicit or implicit power contract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contract {
    /// Minimum contract voltage.
    pub min_voltage: ElectricPotential,
    /// Maximum contract voltage. Equal to the minimum for fixed supplies.
    pub max_voltage: ElectricPotential,
    /// Operating current, for current-based supplies.
    pub operating_current: Option<ElectricCurrent>,
    /// Operating power, for power-based (battery) supplies.
    pub operating_power: Option<Power>,
    /// Whether this is an explicit contract.
    pub explicit: bool,
    /// Whether this contract was negotiated in EPR mode.
    pub epr: bool,
}

impl Contract {
    /// Derive the contract that a granted request establishes.
    ///
    /// Returns `None` when the request does not resolve against the
    /// capabilities it was made for.
    pub fn from_request(request: &PowerSource, capabilities: &SourceCapabilities) -> Option<Self> {
        let position = request.object_position();
        if position == 0 {
            return None;
        }
        let pdo = capabilities.pdos().get(usize::from(position) - 1)?;

        let contract = match (request, pdo) {
            (PowerSource::FixedVariableSupply(rdo), PowerDataObject::FixedSupply(supply)) => Contract {
                min_voltage: supply.voltage(),
                max_voltage: supply.voltage(),
                operating_current: Some(rdo.operating_current()),
                operating_power: None,
                explicit: true,
                epr: false,
            },
            (PowerSource::FixedVariableSupply(rdo), PowerDataObject::VariableSupply(supply)) => Contract {
                min_voltage: supply.min_voltage(),
                max_voltage: supply.max_voltage(),
                operating_current: Some(rdo.operating_current()),
                operating_power: None,
                explicit: true,
                epr: false,
            },
            (PowerSource::Battery(rdo), PowerDataObject::Battery(supply)) => Contract {
                min_voltage: supply.min_voltage(),
                max_voltage: supply.max_voltage(),
                operating_current: None,
                operating_power: Some(rdo.operating_power()),
                explicit: true,
                epr: false,
            },
            (PowerSource::Pps(rdo), PowerDataObject::Augmented(Augmented::Spr(_))) => Contract {
                min_voltage: rdo.output_voltage(),
                max_voltage: rdo.output_voltage(),
                operating_current: Some(rdo.operating_current()),
                operating_power: None,
                explicit: true,
                epr: false,
            },
            (PowerSource::Avs(rdo), PowerDataObject::Augmented(Augmented::Epr(_))) => Contract {
                min_voltage: rdo.output_voltage(),
                max_voltage: rdo.output_voltage(),
                operating_current: Some(rdo.operating_current()),
                operating_power: None,
                explicit: true,
                epr: true,
            },
            (PowerSource::EprRequest(epr), _) => {
                let PowerDataObject::FixedSupply(supply) = epr.pdo else {
                    return None;
                };
                Contract {
                    min_voltage: supply.voltage(),
                    max_voltage: supply.voltage(),
                    operating_current: Some(ElectricCurrent::new::<centiampere>(
                        crate::protocol_layer::message::data::request::FixedVariableSupply(epr.rdo)
                            .raw_operating_current()
                            .into(),
                    )),
                    operating_power: None,
                    explicit: true,
                    epr: true,
                }
            }
            _ => return None,
        };

        Some(contract)
    }

    /// The implicit vSafe5V contract present before negotiation.
    pub fn safe_5v() -> Self {
        Contract {
            min_voltage: ElectricPotential::new::<uom::si::electric_potential::volt>(5),
            max_voltage: ElectricPotential::new::<uom::si::electric_potential::volt>(5),
            operating_current: None,
            operating_power: None,
            explicit: false,
            epr: false,
        }
    }

    /// The contract power, where it can be derived.
    pub fn power(&self) -> Option<Power> {
        if let Some(power) = self.operating_power {
            return Some(power);
        }

        let current = self.operating_current?;
        Some(Power::new::<watt>(
            self.max_voltage.get::<uom::si::electric_potential::volt>() * current.get::<uom::si::electric_current::ampere>(),
        ))
    }
}

/// Events that are signalled to the application.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Event {
    /// The connection manager entered an attach-wait state.
    AttachWait,
    /// A partner was attached, with the resolved power role.
    Attached(PowerRole),
    /// The partner was detached.
    Detached,
    /// Type-C error recovery was entered.
    TypeCErrorRecovery,
    /// A physical fault was reported.
    Fault(Fault),
    /// A hard reset was sent.
    HardResetSent,
    /// A hard reset was received.
    HardResetReceived,
    /// A soft reset was sent.
    SoftResetSent,
    /// A contract negotiation completed.
    ContractNegotiated(Contract),
    /// A previously requested contract was rejected.
    ContractRejected,
    /// The power role was swapped.
    PowerRoleSwapped(PowerRole),
    /// The data role was swapped.
    DataRoleSwapped(DataRole),
    /// The VCONN swap handshake completed.
    VconnSwapComplete,
    /// The Data_Reset handshake completed.
    DataResetComplete,
    /// EPR mode was entered.
    EprEntered,
    /// EPR mode was exited, autonomously or on request.
    EprExited,
    /// Entering EPR mode failed.
    EprEntryFailed(DataEnterFailed),
    /// An electronically marked cable was identified.
    CableIdentified,
    /// Cable discovery gave up after exhausting its retries.
    CableDiscoveryFailed,
    /// The partner did not respond within the sender response window.
    SenderResponseTimeout,
    /// The partner stopped answering EPR keep-alives.
    EprKeepAliveTimeout,
    /// An audio adapter accessory was attached.
    AudioAccessoryAttached,
    /// A debug accessory was attached.
    DebugAccessoryAttached,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_layer::message::data::request::{CurrentRequest, VoltageRequest};
    use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, MAX_EPR_PDOS};
    use heapless::Vec as HVec;
    use uom::si::electric_potential::volt;

    #[test]
    fn command_slot_accepts_one_command() {
        let mut slot = CommandSlot::new();

        slot.submit(Command::GetSourceCapabilities).unwrap();
        assert_eq!(slot.submit(Command::HardReset), Err(CommandError::Busy));

        assert!(matches!(slot.take(), Some(Command::GetSourceCapabilities)));
        assert!(!slot.is_pending());
        slot.submit(Command::HardReset).unwrap();
    }

    #[test]
    fn contract_from_fixed_request() {
        let mut pdos: HVec<PowerDataObject, MAX_EPR_PDOS> = HVec::new();
        pdos.push(PowerDataObject::FixedSupply(
            FixedSupply::new().with_raw_voltage(100).with_raw_max_current(300),
        ))
        .unwrap();
        pdos.push(PowerDataObject::FixedSupply(
            FixedSupply::new().with_raw_voltage(180).with_raw_max_current(300),
        ))
        .unwrap();
        let caps = SourceCapabilities(pdos);

        let request = PowerSource::new_fixed(CurrentRequest::Highest, VoltageRequest::Highest, &caps).unwrap();
        let contract = Contract::from_request(&request, &caps).unwrap();

        assert_eq!(contract.max_voltage.get::<volt>(), 9);
        assert_eq!(contract.operating_current.unwrap().get::<centiampere>(), 300);
        assert!(contract.explicit);
        assert!(!contract.epr);
    }
}
