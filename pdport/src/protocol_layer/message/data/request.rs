//! Definitions of request message content.
//!
//! See [6.4.2].
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;
use uom::si::electric_current::centiampere;

use super::source_capabilities::{self, Augmented, PowerDataObject, SourceCapabilities};
use crate::_20millivolts_mod::_20millivolts;
use crate::_50milliamperes_mod::_50milliamperes;
use crate::_250milliwatts_mod::_250milliwatts;
use crate::units::{ElectricCurrent, ElectricPotential, Power};

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// A request data object before the targeted PDO kind is known.
    pub struct RawDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// Request towards a fixed or variable supply, see [Table 6.22].
    pub struct FixedVariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        /// Give-back support.
        pub giveback_flag: bool @ 27,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 22,
        /// Operating current in 10 mA units
        pub raw_operating_current: u16 @ 10..=19,
        /// Maximum operating current in 10 mA units
        pub raw_max_operating_current: u16 @ 0..=9,
    }
}

impl FixedVariableSupply {
    /// Serialize this data object, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_operating_current().into())
    }

    /// The requested maximum operating current.
    pub fn max_operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_operating_current().into())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// Request towards a battery supply, see [Table 6.24].
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Object position (0000b and 1110b…1111b are Reserved and Shall Not be used)
        pub object_position: u8 @ 28..=31,
        /// GiveBackFlag = 0
        pub giveback_flag: bool @ 27,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 22,
        /// Operating power in 250mW units
        pub raw_operating_power: u16 @ 10..=19,
        /// Maximum operating power in 250mW units
        pub raw_max_operating_power: u16 @ 0..=9,
    }
}

impl Battery {
    /// Serialize this data object, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested operating power.
    pub fn operating_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_operating_power().into())
    }

    /// The requested maximum operating power.
    pub fn max_operating_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_max_operating_power().into())
    }
}

bitfield!(
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// Request towards a programmable power supply, see [Table 6.25].
    pub struct Pps(pub u32): Debug, FromStorage, IntoStorage {
        /// Object position (0000b and 1110b…1111b are Reserved and Shall Not be used)
        pub object_position: u8 @ 28..=31,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 22,
        /// Output voltage in 20mV units
        pub raw_output_voltage: u16 @ 9..=20,
        /// Operating current in 50mA units
        pub raw_operating_current: u16 @ 0..=6,
    }
);

impl Pps {
    /// Serialize this data object, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested output voltage.
    pub fn output_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_20millivolts>(self.raw_output_voltage().into())
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_operating_current().into())
    }
}

bitfield!(
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// Request towards an adjustable voltage supply, see [Table 6.26].
    pub struct Avs(pub u32): Debug, FromStorage, IntoStorage {
        /// Object position (0000b and 1110b…1111b are Reserved and Shall Not be used)
        pub object_position: u8 @ 28..=31,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 22,
        /// Output voltage in 20mV units
        pub raw_output_voltage: u16 @ 9..=20,
        /// Operating current in 50mA units
        pub raw_operating_current: u16 @ 0..=6,
    }
);

impl Avs {
    /// Serialize this data object, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.0);
        4
    }

    /// The requested output voltage.
    pub fn output_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_20millivolts>(self.raw_output_voltage().into())
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_operating_current().into())
    }
}

/// An EPR mode request: the request data object, followed by a copy of the
/// PDO it selects.
///
/// See [6.4.11]. A mismatch between the copied PDO and the advertised PDO at
/// that object position is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EprRequest {
    /// The raw request data object.
    pub rdo: u32,
    /// The PDO copied from the advertised EPR source capabilities.
    pub pdo: PowerDataObject,
}

impl EprRequest {
    /// Create an EPR request towards a fixed supply at `index` (0-based).
    pub fn new_fixed(index: usize, supply: &source_capabilities::FixedSupply) -> Self {
        let rdo = FixedVariableSupply(0)
            .with_object_position((index + 1) as u8)
            .with_raw_operating_current(supply.raw_max_current())
            .with_raw_max_operating_current(supply.raw_max_current())
            .with_epr_mode_capable(true)
            .with_no_usb_suspend(true)
            .with_usb_communications_capable(true);

        Self {
            rdo: rdo.0,
            pdo: PowerDataObject::FixedSupply(*supply),
        }
    }

    /// The (1-indexed) object position this request selects.
    pub fn object_position(&self) -> u8 {
        RawDataObject(self.rdo).object_position()
    }

    /// Serialize the request, returning the number of written bytes.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.rdo);
        LittleEndian::write_u32(&mut buf[4..], self.pdo.to_raw());
        8
    }

    /// Parse an EPR request from its two data objects.
    pub fn from_bytes(payload: &[u8]) -> Self {
        Self {
            rdo: LittleEndian::read_u32(payload),
            pdo: PowerDataObject::from_raw(LittleEndian::read_u32(&payload[4..])),
        }
    }
}

/// Power requests towards the source.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerSource {
    /// Request towards a fixed or variable supply.
    FixedVariableSupply(FixedVariableSupply),
    /// Request towards a battery supply.
    Battery(Battery),
    /// Request towards a programmable power supply.
    Pps(Pps),
    /// Request towards an adjustable voltage supply.
    Avs(Avs),
    /// An EPR mode request (RDO plus copied PDO).
    EprRequest(EprRequest),
    /// Request towards an unrecognized object position.
    Unknown(RawDataObject),
}

/// Errors that can occur during sink requests towards the source.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A requested (specific) voltage does not exist in the PDOs.
    VoltageMismatch,
}

/// Requestable voltage levels.
#[derive(Debug)]
pub enum VoltageRequest {
    /// The safe 5 V supply.
    Safe5V,
    /// The highest voltage that the source can supply.
    Highest,
    /// A specific voltage.
    Specific(ElectricPotential),
}

/// Requestable currents.
#[derive(Debug)]
pub enum CurrentRequest {
    /// The highest current that the source can supply.
    Highest,
    /// A specific current.
    Specific(ElectricCurrent),
}

/// Contract selection algorithms, operating over fixed SPR source PDOs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SelectionAlgorithm {
    /// Select the contract with the highest power.
    HighestPower,
    /// Select the contract with the highest current.
    HighestCurrent,
    /// Select the contract with the highest voltage.
    HighestVoltage,
}

/// Iterate the fixed SPR supplies (object positions 1..=7, at most 20 V).
fn fixed_spr_supplies(
    source_capabilities: &SourceCapabilities,
) -> impl Iterator<Item = (usize, &source_capabilities::FixedSupply)> {
    source_capabilities
        .pdos()
        .iter()
        .take(7)
        .enumerate()
        .filter_map(|(index, cap)| {
            if let PowerDataObject::FixedSupply(fixed_supply) = cap {
                (fixed_supply.raw_voltage() <= 400).then_some((index, fixed_supply))
            } else {
                None
            }
        })
}

impl PowerSource {
    /// The (1-indexed) object position this request selects.
    pub fn object_position(&self) -> u8 {
        match self {
            PowerSource::FixedVariableSupply(p) => p.object_position(),
            PowerSource::Battery(p) => p.object_position(),
            PowerSource::Pps(p) => p.object_position(),
            PowerSource::Avs(p) => p.object_position(),
            PowerSource::EprRequest(p) => p.object_position(),
            PowerSource::Unknown(p) => p.object_position(),
        }
    }

    /// Find the highest fixed voltage that can be found in the source capabilities.
    fn find_highest_fixed_voltage(source_capabilities: &SourceCapabilities) -> Option<(usize, &source_capabilities::FixedSupply)> {
        fixed_spr_supplies(source_capabilities).max_by_key(|(_, supply)| supply.raw_voltage())
    }

    /// Find the fixed supply with the highest current capability.
    fn find_highest_fixed_current(source_capabilities: &SourceCapabilities) -> Option<(usize, &source_capabilities::FixedSupply)> {
        fixed_spr_supplies(source_capabilities)
            .max_by_key(|(_, supply)| (supply.raw_max_current(), supply.raw_voltage()))
    }

    /// Find the fixed supply with the highest power capability.
    fn find_highest_fixed_power(source_capabilities: &SourceCapabilities) -> Option<(usize, &source_capabilities::FixedSupply)> {
        fixed_spr_supplies(source_capabilities)
            .max_by_key(|(_, supply)| u32::from(supply.raw_voltage()) * u32::from(supply.raw_max_current()))
    }

    /// Find a specific fixed voltage within the source capabilities.
    fn find_specific_fixed_voltage(
        source_capabilities: &SourceCapabilities,
        voltage: ElectricPotential,
    ) -> Option<(usize, &source_capabilities::FixedSupply)> {
        fixed_spr_supplies(source_capabilities).find(|(_, supply)| supply.voltage() == voltage)
    }

    /// Find a suitable PDO for a Programmable Power Supply (PPS) by evaluating the provided voltage
    /// request against the source capabilities.
    fn find_pps_voltage(
        source_capabilities: &SourceCapabilities,
        voltage: ElectricPotential,
    ) -> Option<(usize, &Augmented)> {
        for (index, cap) in source_capabilities.pdos().iter().enumerate() {
            let PowerDataObject::Augmented(augmented) = cap else {
                trace!("Skip non-augmented PDO {:?}", cap);
                continue;
            };

            match augmented {
                Augmented::Spr(spr) => {
                    if spr.min_voltage() <= voltage && spr.max_voltage() >= voltage {
                        return Some((index, augmented));
                    } else {
                        trace!("Skip PDO, voltage out of range. {:?}", augmented);
                    }
                }
                _ => trace!("Skip PDO, only SPR is supported. {:?}", augmented),
            };
        }

        trace!("Could not find suitable PPS voltage");
        None
    }

    fn fixed_request_for(index: usize, current: ElectricCurrent, mismatch: bool) -> Self {
        let mut raw_current = current.get::<centiampere>() as u16;

        if raw_current > 0x3ff {
            error!("Clamping invalid current: {} mA", 10 * raw_current);
            raw_current = 0x3ff;
        }

        let object_position = index + 1;
        debug_assert!(object_position > 0b0000 && object_position <= 0b1110);

        Self::FixedVariableSupply(
            FixedVariableSupply(0)
                .with_raw_operating_current(raw_current)
                .with_raw_max_operating_current(raw_current)
                .with_object_position(object_position as u8)
                .with_capability_mismatch(mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        )
    }

    /// Create a new power source request for a fixed supply.
    ///
    /// Finds a suitable PDO by evaluating the provided current and voltage requests against the source capabilities.
    pub fn new_fixed(
        current_request: CurrentRequest,
        voltage_request: VoltageRequest,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let selected = match voltage_request {
            VoltageRequest::Safe5V => source_capabilities.vsafe_5v().map(|supply| (0, supply)),
            VoltageRequest::Highest => Self::find_highest_fixed_voltage(source_capabilities),
            VoltageRequest::Specific(x) => Self::find_specific_fixed_voltage(source_capabilities, x),
        };

        let Some((index, supply)) = selected else {
            return Err(Error::VoltageMismatch);
        };

        let (current, mismatch) = match current_request {
            CurrentRequest::Highest => (supply.max_current(), false),
            CurrentRequest::Specific(x) => (x, x > supply.max_current()),
        };

        Ok(Self::fixed_request_for(index, current, mismatch))
    }

    /// Create a power source request by running a selection algorithm over
    /// the fixed SPR supplies of the source capabilities.
    ///
    /// Falls back to vSafe5V when the capabilities contain no fixed SPR PDO
    /// beyond the mandatory first position.
    pub fn new_with_algorithm(
        algorithm: SelectionAlgorithm,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let selected = match algorithm {
            SelectionAlgorithm::HighestPower => Self::find_highest_fixed_power(source_capabilities),
            SelectionAlgorithm::HighestCurrent => Self::find_highest_fixed_current(source_capabilities),
            SelectionAlgorithm::HighestVoltage => Self::find_highest_fixed_voltage(source_capabilities),
        };

        let Some((index, supply)) = selected else {
            return Err(Error::VoltageMismatch);
        };

        Ok(Self::fixed_request_for(index, supply.max_current(), false))
    }

    /// Create a new power source request for a programmable power supply (PPS).
    ///
    /// Finds a suitable PDO by evaluating the provided current and voltage requests against the source capabilities.
    /// If no PDO is found that matches the request, an error is returned.
    pub fn new_pps(
        current_request: CurrentRequest,
        voltage: ElectricPotential,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let Some((index, supply)) = Self::find_pps_voltage(source_capabilities, voltage) else {
            return Err(Error::VoltageMismatch);
        };

        let max_current = match supply {
            Augmented::Spr(spr) => spr.max_current(),
            _ => unreachable!(),
        };

        let (current, mismatch) = match current_request {
            CurrentRequest::Highest => (max_current, false),
            CurrentRequest::Specific(x) => (x, x > max_current),
        };

        let mut raw_current = current.get::<_50milliamperes>() as u16;

        if raw_current > 0x7f {
            error!("Clamping invalid current: {} mA", 50 * raw_current);
            raw_current = 0x7f;
        }

        let raw_voltage = voltage.get::<_20millivolts>() as u16;

        let object_position = index + 1;
        debug_assert!(object_position > 0b0000 && object_position <= 0b1110);

        Ok(Self::Pps(
            Pps(0)
                .with_raw_output_voltage(raw_voltage)
                .with_raw_operating_current(raw_current)
                .with_object_position(object_position as u8)
                .with_capability_mismatch(mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        ))
    }

    /// Create an EPR request for the highest-voltage fixed supply, EPR
    /// positions included.
    pub fn new_epr_highest_fixed_voltage(source_capabilities: &SourceCapabilities) -> Result<Self, Error> {
        let selected = source_capabilities
            .pdos()
            .iter()
            .enumerate()
            .filter_map(|(index, cap)| {
                if let PowerDataObject::FixedSupply(fixed_supply) = cap {
                    Some((index, fixed_supply))
                } else {
                    None
                }
            })
            .max_by_key(|(_, supply)| supply.raw_voltage());

        let Some((index, supply)) = selected else {
            return Err(Error::VoltageMismatch);
        };

        Ok(Self::EprRequest(EprRequest::new_fixed(index, supply)))
    }
}

#[cfg(test)]
mod tests {
    use heapless::Vec;

    use super::*;
    use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, MAX_EPR_PDOS};

    fn caps_5v_9v() -> SourceCapabilities {
        let mut pdos: Vec<PowerDataObject, MAX_EPR_PDOS> = Vec::new();
        pdos.push(PowerDataObject::FixedSupply(
            FixedSupply::new().with_raw_voltage(100).with_raw_max_current(300),
        ))
        .unwrap();
        pdos.push(PowerDataObject::FixedSupply(
            FixedSupply::new().with_raw_voltage(180).with_raw_max_current(300),
        ))
        .unwrap();
        SourceCapabilities(pdos)
    }

    #[test]
    fn highest_voltage_selects_second_position() {
        let request = PowerSource::new_with_algorithm(SelectionAlgorithm::HighestVoltage, &caps_5v_9v()).unwrap();

        assert_eq!(request.object_position(), 2);
        let PowerSource::FixedVariableSupply(rdo) = request else {
            panic!("Expected a fixed supply request");
        };
        assert_eq!(rdo.raw_operating_current(), 300);
    }

    #[test]
    fn highest_power_ignores_epr_positions() {
        let mut pdos: Vec<PowerDataObject, MAX_EPR_PDOS> = Vec::new();
        pdos.push(PowerDataObject::FixedSupply(
            FixedSupply::new().with_raw_voltage(100).with_raw_max_current(300),
        ))
        .unwrap();
        // 28 V, 5 A: EPR PDO, excluded from SPR selection.
        pdos.push(PowerDataObject::FixedSupply(
            FixedSupply::new().with_raw_voltage(560).with_raw_max_current(500),
        ))
        .unwrap();

        let request =
            PowerSource::new_with_algorithm(SelectionAlgorithm::HighestPower, &SourceCapabilities(pdos)).unwrap();
        assert_eq!(request.object_position(), 1);
    }

    #[test]
    fn epr_request_copies_selected_pdo() {
        let supply = FixedSupply::new().with_raw_voltage(560).with_raw_max_current(500);
        let request = EprRequest::new_fixed(7, &supply);

        assert_eq!(request.object_position(), 8);

        let mut buf = [0u8; 8];
        assert_eq!(request.to_bytes(&mut buf), 8);
        let parsed = EprRequest::from_bytes(&buf);
        assert_eq!(parsed, request);
    }
}
