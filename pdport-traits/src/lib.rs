//! Hardware boundary traits for the pdport USB-PD port controller.
//!
//! Provides the driver, PHY and power-rail traits through which the stack
//! talks to board-specific hardware.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
use core::future::Future;

/// Receive Error.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverRxError {
    /// Received message discarded, e.g. due to CRC errors.
    Discarded,

    /// Hard Reset received before or during reception.
    HardReset,
}

/// Transmit Error.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverTxError {
    /// Concurrent receive in progress or excessive noise on the line.
    Discarded,

    /// Hard Reset received before or during transmission.
    HardReset,
}

/// Start-of-packet sequence, addressing one logical endpoint on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SopTarget {
    /// The port partner.
    Sop,
    /// The cable plug nearest to this port.
    SopPrime,
    /// The cable plug at the far end of the cable.
    SopDoublePrime,
}

impl SopTarget {
    /// Index into per-endpoint state tables.
    pub const fn index(self) -> usize {
        match self {
            SopTarget::Sop => 0,
            SopTarget::SopPrime => 1,
            SopTarget::SopDoublePrime => 2,
        }
    }
}

/// Driver trait, through which the protocol layer talks to the PHY.
pub trait Driver {
    /// Wait for availability of VBus voltage.
    fn wait_for_vbus(&self) -> impl Future<Output = ()>;

    /// Receive a packet, reporting the endpoint it arrived on.
    fn receive(&mut self, buffer: &mut [u8]) -> impl Future<Output = Result<(SopTarget, usize), DriverRxError>>;

    /// Transmit a packet to the given endpoint.
    fn transmit(&mut self, sop: SopTarget, data: &[u8]) -> impl Future<Output = Result<(), DriverTxError>>;

    /// Transmit a hard reset signal.
    fn transmit_hard_reset(&mut self) -> impl Future<Output = Result<(), DriverTxError>>;
}

/// A CC line of the Type-C connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcPin {
    /// The CC1 line.
    Cc1,
    /// The CC2 line.
    Cc2,
}

impl CcPin {
    /// The other CC line.
    pub fn other(self) -> Self {
        match self {
            CcPin::Cc1 => CcPin::Cc2,
            CcPin::Cc2 => CcPin::Cc1,
        }
    }
}

/// Rp current advertisement levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RpLevel {
    /// Default USB current (500/900 mA).
    Default,
    /// 1.5 A.
    Level1A5,
    /// 3.0 A.
    Level3A0,
}

/// Termination applied by this port to its CC lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcPull {
    /// No termination, line floating.
    Open,
    /// Present Rd on both lines (sink).
    Rd,
    /// Present Rp at the given level on both lines (source).
    Rp(RpLevel),
}

/// Termination sensed on a single CC line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcTermination {
    /// Nothing detected.
    Open,
    /// Sink termination detected (we present Rp).
    Rd,
    /// Powered-cable/accessory termination detected (we present Rp).
    Ra,
    /// Source termination detected at the given current level (we present Rd).
    Rp(RpLevel),
}

/// Sensed state of both CC lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CcStatus {
    /// Termination sensed on CC1.
    pub cc1: CcTermination,
    /// Termination sensed on CC2.
    pub cc2: CcTermination,
}

impl CcStatus {
    /// Status with both lines open.
    pub const OPEN: CcStatus = CcStatus {
        cc1: CcTermination::Open,
        cc2: CcTermination::Open,
    };

    /// Termination sensed on the given line.
    pub fn line(&self, pin: CcPin) -> CcTermination {
        match pin {
            CcPin::Cc1 => self.cc1,
            CcPin::Cc2 => self.cc2,
        }
    }
}

/// Physical fault conditions reported by the PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fault {
    /// VBus over-voltage.
    OverVoltage,
    /// VBus under-voltage.
    UnderVoltage,
    /// VBus over-current.
    OverCurrent,
    /// VBus short circuit.
    ShortCircuit,
    /// VConn over-current.
    VconnOverCurrent,
    /// Over-temperature.
    OverTemperature,
}

/// Type-C PHY trait: CC line sensing and termination control.
///
/// Sensing methods take `&self` so that independent line monitors can be
/// polled concurrently.
pub trait TypeCPhy {
    /// Apply a termination to the CC lines.
    fn set_cc_pull(&mut self, pull: CcPull);

    /// Sample the current state of both CC lines.
    fn cc_status(&self) -> CcStatus;

    /// Wait until the CC line state differs from `previous`, returning the new state.
    fn wait_for_cc_change(&self, previous: CcStatus) -> impl Future<Output = CcStatus>;

    /// Whether VBus is currently present at a valid level.
    fn vbus_present(&self) -> bool;

    /// Wait until VBus presence differs from `previous`, returning the new state.
    fn wait_for_vbus_change(&self, previous: bool) -> impl Future<Output = bool>;

    /// Wait for a physical fault report.
    ///
    /// PHYs without fault detection return a future that never resolves.
    fn wait_for_fault(&self) -> impl Future<Output = Fault>;
}

/// Power-rail control trait.
///
/// Rail switching is a board decision; the stack only requests it.
pub trait PowerControl {
    /// Enable or disable VBus sourcing.
    fn set_vbus(&mut self, enabled: bool) -> impl Future<Output = ()>;

    /// Enable or disable VConn sourcing on the given CC line.
    fn set_vconn(&mut self, pin: CcPin, enabled: bool) -> impl Future<Output = ()>;

    /// Discharge VBus to vSafe0V.
    fn discharge_vbus(&mut self) -> impl Future<Output = ()>;
}
