//! Definitions of BIST data message content.
//!
//! See [6.4.3].
use proc_bitfield::bitfield;

/// BIST modes relevant to a port controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BistMode {
    /// Carrier mode: transmit a continuous BMC carrier for tBISTContMode.
    CarrierMode2,
    /// Test data mode: receive and discard frames until reset.
    TestData,
    /// Any other (reserved or analog-test) mode.
    Other(u8),
}

impl From<u8> for BistMode {
    fn from(value: u8) -> Self {
        match value {
            0b0101 => BistMode::CarrierMode2,
            0b1000 => BistMode::TestData,
            x => BistMode::Other(x),
        }
    }
}

impl From<BistMode> for u8 {
    fn from(value: BistMode) -> Self {
        match value {
            BistMode::CarrierMode2 => 0b0101,
            BistMode::TestData => 0b1000,
            BistMode::Other(x) => x,
        }
    }
}

bitfield! {
    /// The BIST data object, see [Table 6.27].
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct BistDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// The BIST mode to enter.
        pub mode: u8 [BistMode] @ 28..=31,
    }
}
