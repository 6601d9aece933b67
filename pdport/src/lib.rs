//! USB Type-C / USB-PD port controller core.
//!
//! Implements the three state machines of a PD port controller:
//! - the Type-C connection manager, which debounces CC line conditions into
//!   attach, detach and role events,
//! - the protocol layer, which sequences, retries and reassembles messages
//!   per logical endpoint (SOP, SOP', SOP''),
//! - the policy engines (sink and source), which drive capability exchange,
//!   contract formation, swaps, resets, cable discovery and EPR mode.
//!
//! Hardware access goes through the traits in `pdport-traits`; board policy
//! goes through the device policy manager traits of the `sink` and `source`
//! modules.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

mod fmt;

pub mod config;
pub mod counters;
pub mod data_reset;
pub mod dpm;
pub mod port;
pub mod protocol_layer;
pub mod sink;
pub mod source;
pub mod timers;
pub mod type_c;

#[cfg(test)]
pub mod dummy;

#[macro_use]
extern crate uom;

pub(crate) mod _50millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_50millivolts: 0.05; "50mV", "50-millivolt step", "50-millivolt steps";
    }
}

pub(crate) mod _20millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_20millivolts: 0.02; "20mV", "20-millivolt step", "20-millivolt steps";
    }
}

pub(crate) mod _50milliamperes_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_current;

        @_50milliamperes: 0.05; "50mA", "50-milliampere step", "50-milliampere steps";
    }
}

pub(crate) mod _250milliwatts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::power;

        @_250milliwatts: 0.25; "250mW", "250-milliwatt step", "250-milliwatt steps";
    }
}

/// Strongly typed electrical quantities used throughout the stack.
pub mod units {
    pub use uom::si::u32::{ElectricCurrent, ElectricPotential, Power};
}

/// The power role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerRole {
    /// Supplies power.
    Source,
    /// Consumes power.
    Sink,
}

impl PowerRole {
    /// The opposite power role.
    pub fn other(self) -> Self {
        match self {
            PowerRole::Source => PowerRole::Sink,
            PowerRole::Sink => PowerRole::Source,
        }
    }
}

impl From<bool> for PowerRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Sink,
            true => Self::Source,
        }
    }
}

impl From<PowerRole> for bool {
    fn from(role: PowerRole) -> bool {
        match role {
            PowerRole::Sink => false,
            PowerRole::Source => true,
        }
    }
}

/// The data role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataRole {
    /// Upstream-facing port.
    Ufp,
    /// Downstream-facing port.
    Dfp,
}

impl DataRole {
    /// The opposite data role.
    pub fn other(self) -> Self {
        match self {
            DataRole::Ufp => DataRole::Dfp,
            DataRole::Dfp => DataRole::Ufp,
        }
    }
}

impl From<bool> for DataRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Ufp,
            true => Self::Dfp,
        }
    }
}

impl From<DataRole> for bool {
    fn from(role: DataRole) -> bool {
        match role {
            DataRole::Ufp => false,
            DataRole::Dfp => true,
        }
    }
}

/// The roles a port is capable of taking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortRole {
    /// Sink only.
    Sink,
    /// Source only.
    Source,
    /// Dual-role port, toggling between source and sink when unattached.
    Dual,
}

impl PortRole {
    /// Whether this port can act as a sink.
    pub fn supports_sink(self) -> bool {
        matches!(self, PortRole::Sink | PortRole::Dual)
    }

    /// Whether this port can act as a source.
    pub fn supports_source(self) -> bool {
        matches!(self, PortRole::Source | PortRole::Dual)
    }
}
