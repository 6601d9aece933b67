//! Definitions of source capability data message content.
//!
//! See [6.4.1].
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use proc_bitfield::bitfield;
use uom::si::electric_current::centiampere;
use uom::si::electric_potential::decivolt;
use uom::si::power::watt;

use crate::_50milliamperes_mod::_50milliamperes;
use crate::_50millivolts_mod::_50millivolts;
use crate::_250milliwatts_mod::_250milliwatts;
use crate::units::{ElectricCurrent, ElectricPotential, Power};

/// Maximum number of PDOs in an EPR capabilities message.
pub const MAX_EPR_PDOS: usize = 11;

/// The supply kind a PDO describes.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Kind {
    /// Fixed supply.
    FixedSupply,
    /// Battery supply.
    Battery,
    /// Variable supply.
    VariableSupply,
    /// SPR programmable power supply.
    Pps,
    /// EPR adjustable voltage supply.
    Avs,
}

/// A power data object, advertised by a source.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerDataObject {
    /// Fixed voltage supply.
    FixedSupply(FixedSupply),
    /// Battery supply.
    Battery(Battery),
    /// Variable voltage supply.
    VariableSupply(VariableSupply),
    /// Augmented (programmable or adjustable) supply.
    Augmented(Augmented),
    /// Unrecognized PDO, carried raw.
    Unknown(RawPowerDataObject),
}

impl PowerDataObject {
    /// Decode a single raw data object.
    pub fn from_raw(raw: u32) -> Self {
        let pdo = RawPowerDataObject(raw);
        match pdo.kind() {
            0b00 => PowerDataObject::FixedSupply(FixedSupply(pdo.0)),
            0b01 => PowerDataObject::Battery(Battery(pdo.0)),
            0b10 => PowerDataObject::VariableSupply(VariableSupply(pdo.0)),
            0b11 => PowerDataObject::Augmented(match AugmentedRaw(pdo.0).supply() {
                0b00 => Augmented::Spr(SprProgrammablePowerSupply(pdo.0)),
                0b01 => Augmented::Epr(EprAdjustableVoltageSupply(pdo.0)),
                x => {
                    warn!("Unknown augmented power data object supply {}", x);
                    Augmented::Unknown(pdo.0)
                }
            }),
            _ => {
                warn!("Unknown power data object kind");
                PowerDataObject::Unknown(pdo)
            }
        }
    }

    /// The raw wire representation of this PDO.
    pub fn to_raw(&self) -> u32 {
        match self {
            PowerDataObject::FixedSupply(p) => p.0,
            PowerDataObject::Battery(p) => p.0,
            PowerDataObject::VariableSupply(p) => p.0,
            PowerDataObject::Augmented(Augmented::Spr(p)) => p.0,
            PowerDataObject::Augmented(Augmented::Epr(p)) => p.0,
            PowerDataObject::Augmented(Augmented::Unknown(p)) => *p,
            PowerDataObject::Unknown(p) => p.0,
        }
    }

    /// Whether this PDO belongs to the extended power range.
    ///
    /// EPR PDOs are fixed supplies above 20 V, or adjustable voltage supplies.
    pub fn is_epr(&self) -> bool {
        match self {
            PowerDataObject::FixedSupply(supply) => supply.raw_voltage() > 400,
            PowerDataObject::Augmented(Augmented::Epr(_)) => true,
            _ => false,
        }
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// A power data object before its kind is known.
    pub struct RawPowerDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// The supply kind.
        pub kind: u8 @ 30..=31,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// A fixed supply PDO, see [Table 6.9].
    pub struct FixedSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Fixed supply
        pub kind: u8 @ 30..=31,
        /// Dual-role power
        pub dual_role_power: bool @ 29,
        /// USB suspend supported
        pub usb_suspend_supported: bool @ 28,
        /// Unconstrained power
        pub unconstrained_power: bool @ 27,
        /// USB communications capable
        pub usb_communications_capable: bool @ 26,
        /// Dual-role data
        pub dual_role_data: bool @ 25,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 24,
        /// EPR mode capable
        pub epr_mode_capable: bool @ 23,
        /// Peak current
        pub peak_current: u8 @ 20..=21,
        /// Voltage in 50 mV units
        pub raw_voltage: u16 @ 10..=19,
        /// Maximum current in 10 mA units
        pub raw_max_current: u16 @ 0..=9,
    }
}

impl Default for FixedSupply {
    fn default() -> Self {
        Self::new()
    }
}

impl FixedSupply {
    /// An empty fixed supply PDO.
    pub fn new() -> Self {
        Self(0)
    }

    /// The supply voltage.
    pub fn voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_voltage().into())
    }

    /// The maximum supply current.
    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_current().into())
    }

    /// The maximum power this supply can deliver.
    pub fn max_power(&self) -> Power {
        Power::new::<watt>(
            u32::from(self.raw_voltage()) * 50 * u32::from(self.raw_max_current()) * 10 / 1_000_000,
        )
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// A battery supply PDO, see [Table 6.12].
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Battery
        pub kind: u8 @ 30..=31,
        /// Maximum Voltage in 50 mV units
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum Voltage in 50 mV units
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum Allowable Power in 250 mW units
        pub raw_max_power: u16 @ 0..=9,
    }
}

impl Battery {
    /// The maximum supply voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_max_voltage().into())
    }

    /// The minimum supply voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_min_voltage().into())
    }

    /// The maximum allowable power.
    pub fn max_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_max_power().into())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// A variable supply PDO, see [Table 6.11].
    pub struct VariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Variable supply (non-battery)
        pub kind: u8 @ 30..=31,
        /// Maximum Voltage in 50mV units
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum Voltage in 50mV units
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum current in 10mA units
        pub raw_max_current: u16 @ 0..=9,
    }
}

impl VariableSupply {
    /// The maximum supply voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_max_voltage().into())
    }

    /// The minimum supply voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_min_voltage().into())
    }

    /// The maximum supply current.
    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_current().into())
    }
}

/// An augmented power data object.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Augmented {
    /// SPR programmable power supply.
    Spr(SprProgrammablePowerSupply),
    /// EPR adjustable voltage supply.
    Epr(EprAdjustableVoltageSupply),
    /// Unrecognized augmented PDO, carried raw.
    Unknown(u32),
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// An augmented PDO before its supply type is known.
    pub struct AugmentedRaw(pub u32): Debug, FromStorage, IntoStorage {
        /// Augmented power data object
        pub kind: u8 @ 30..=31,
        /// The augmented supply type.
        pub supply: u8 @ 28..=29,
        /// Type-specific capability bits.
        pub power_capabilities: u32 @ 0..=27,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// An SPR programmable power supply PDO, see [Table 6.13].
    pub struct SprProgrammablePowerSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Augmented power data object
        pub kind: u8 @ 30..=31,
        /// SPR programmable power supply
        pub supply: u8 @ 28..=29,
        /// Power limited flag.
        pub pps_power_limited: bool @ 27,
        /// Maximum voltage in 100mV increments
        pub raw_max_voltage: u8 @ 17..=24,
        /// Minimum Voltage in 100mV increments
        pub raw_min_voltage: u8 @ 8..=15,
        /// Maximum Current in 50mA increments
        pub raw_max_current: u8 @ 0..=6,
    }
}

impl Default for SprProgrammablePowerSupply {
    fn default() -> Self {
        Self::new()
    }
}

impl SprProgrammablePowerSupply {
    /// An empty PPS PDO with kind and supply bits set.
    pub fn new() -> Self {
        Self(0).with_kind(0b11).with_supply(0b00)
    }

    /// The maximum supply voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<decivolt>(self.raw_max_voltage().into())
    }

    /// The minimum supply voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<decivolt>(self.raw_min_voltage().into())
    }

    /// The maximum supply current.
    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_max_current().into())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// An EPR adjustable voltage supply PDO, see [Table 6.14].
    pub struct EprAdjustableVoltageSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Augmented power data object
        pub kind: u8 @ 30..=31,
        /// EPR adjustable voltage supply
        pub supply: u8 @ 28..=29,
        /// Peak current capability.
        pub peak_current: u8 @ 26..=27,
        /// Maximum voltage in 100mV increments
        pub raw_max_voltage: u16 @ 17..=25,
        /// Minimum Voltage in 100mV increments
        pub raw_min_voltage: u8 @ 8..=15,
        /// PDP in 1W increments
        pub raw_pd_power: u8 @ 0..=7,
    }
}

impl EprAdjustableVoltageSupply {
    /// The maximum supply voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<decivolt>(self.raw_max_voltage().into())
    }

    /// The minimum supply voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<decivolt>(self.raw_min_voltage().into())
    }

    /// The PD power rating.
    pub fn pd_power(&self) -> Power {
        Power::new::<watt>(self.raw_pd_power().into())
    }
}

/// Capabilities advertised by a source, SPR or EPR.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceCapabilities(pub Vec<PowerDataObject, MAX_EPR_PDOS>);

impl SourceCapabilities {
    /// Decode a capabilities list from a sequence of raw data objects.
    ///
    /// Objects beyond the EPR maximum are dropped.
    pub fn from_bytes(payload: &[u8], num_objects: usize) -> Self {
        Self(
            payload
                .chunks_exact(4)
                .take(num_objects.min(MAX_EPR_PDOS))
                .map(|buf| PowerDataObject::from_raw(LittleEndian::read_u32(buf)))
                .collect(),
        )
    }

    /// Serialize the capabilities list, returning the number of written bytes.
    pub fn to_bytes(&self, buffer: &mut [u8]) -> usize {
        let mut written = 0;
        for pdo in &self.0 {
            LittleEndian::write_u32(&mut buffer[written..written + 4], pdo.to_raw());
            written += 4;
        }
        written
    }

    /// The mandatory vSafe5V supply, if advertised correctly in the first position.
    pub fn vsafe_5v(&self) -> Option<&FixedSupply> {
        self.0.first().and_then(|supply| {
            if let PowerDataObject::FixedSupply(supply) = supply {
                Some(supply)
            } else {
                None
            }
        })
    }

    /// Determine, whether the source has dual-role power capability.
    pub fn dual_role_power(&self) -> bool {
        self.vsafe_5v().map(FixedSupply::dual_role_power).unwrap_or_default()
    }

    /// Determine, whether the source supports USB suspend.
    pub fn usb_suspend_supported(&self) -> bool {
        self.vsafe_5v()
            .map(FixedSupply::usb_suspend_supported)
            .unwrap_or_default()
    }

    /// Determine, whether the source has unconstrained power.
    pub fn unconstrained_power(&self) -> bool {
        self.vsafe_5v()
            .map(FixedSupply::unconstrained_power)
            .unwrap_or_default()
    }

    /// Determine, whether dual-role data is supported by the source.
    pub fn dual_role_data(&self) -> bool {
        self.vsafe_5v().map(FixedSupply::dual_role_data).unwrap_or_default()
    }

    /// Determine, whether unchunked extended messages are supported by the source.
    pub fn unchunked_extended_messages_supported(&self) -> bool {
        self.vsafe_5v()
            .map(FixedSupply::unchunked_extended_messages_supported)
            .unwrap_or_default()
    }

    /// Determine, whether the source is EPR mode capable.
    pub fn epr_mode_capable(&self) -> bool {
        self.vsafe_5v().map(FixedSupply::epr_mode_capable).unwrap_or_default()
    }

    /// Whether any of the first seven object positions carries an EPR PDO.
    ///
    /// EPR (A)PDOs are only allowed in positions 8 and above.
    pub fn has_epr_pdo_in_spr_positions(&self) -> bool {
        self.0.iter().take(7).any(PowerDataObject::is_epr)
    }

    /// Get power data objects (PDOs) from the source.
    pub fn pdos(&self) -> &[PowerDataObject] {
        &self.0
    }
}

/// Lookup of the PDO kind at a given (1-indexed) object position.
pub trait PdoState {
    /// The supply kind at the given object position, if any.
    fn pdo_at_object_position(&self, position: u8) -> Option<Kind>;
}

impl PdoState for () {
    fn pdo_at_object_position(&self, _position: u8) -> Option<Kind> {
        None
    }
}

impl PdoState for SourceCapabilities {
    fn pdo_at_object_position(&self, position: u8) -> Option<Kind> {
        // Object positions are 1-indexed; position zero is reserved.
        if position == 0 {
            return None;
        }

        self.pdos()
            .get(usize::from(position) - 1)
            .and_then(|pdo| match pdo {
                PowerDataObject::FixedSupply(_) => Some(Kind::FixedSupply),
                PowerDataObject::Battery(_) => Some(Kind::Battery),
                PowerDataObject::VariableSupply(_) => Some(Kind::VariableSupply),
                PowerDataObject::Augmented(augmented) => match augmented {
                    Augmented::Spr(_) => Some(Kind::Pps),
                    Augmented::Epr(_) => Some(Kind::Avs),
                    Augmented::Unknown(_) => None,
                },
                PowerDataObject::Unknown(_) => None,
            })
    }
}

impl PdoState for Option<SourceCapabilities> {
    fn pdo_at_object_position(&self, position: u8) -> Option<Kind> {
        self.as_ref().pdo_at_object_position(position)
    }
}

impl PdoState for Option<&SourceCapabilities> {
    fn pdo_at_object_position(&self, position: u8) -> Option<Kind> {
        self.and_then(|s| s.pdo_at_object_position(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_supply_round_trip() {
        // 9 V, 3 A: the documented 50 mV / 10 mA multipliers must survive
        // encoding and decoding unchanged.
        let pdo = FixedSupply::new()
            .with_raw_voltage(180)
            .with_raw_max_current(300)
            .with_dual_role_power(true)
            .with_epr_mode_capable(true);

        let decoded = PowerDataObject::from_raw(pdo.0);
        let PowerDataObject::FixedSupply(decoded) = decoded else {
            panic!("Expected a fixed supply");
        };

        assert_eq!(decoded.raw_voltage(), 180);
        assert_eq!(decoded.raw_max_current(), 300);
        assert!(decoded.dual_role_power());
        assert!(decoded.epr_mode_capable());
        assert_eq!(decoded.voltage().get::<_50millivolts>(), 180);
        assert_eq!(decoded.max_current().get::<centiampere>(), 300);
    }

    #[test]
    fn epr_detection_in_spr_positions() {
        let mut pdos: Vec<PowerDataObject, MAX_EPR_PDOS> = Vec::new();
        pdos.push(PowerDataObject::FixedSupply(
            FixedSupply::new().with_raw_voltage(100).with_raw_max_current(300),
        ))
        .unwrap();
        // 28 V fixed supply is an EPR PDO.
        pdos.push(PowerDataObject::FixedSupply(
            FixedSupply::new().with_raw_voltage(560).with_raw_max_current(500),
        ))
        .unwrap();

        let caps = SourceCapabilities(pdos);
        assert!(caps.has_epr_pdo_in_spr_positions());
    }

    #[test]
    fn unknown_augmented_supply_is_carried_raw() {
        let raw = AugmentedRaw(0).with_kind(0b11).with_supply(0b10).0;
        assert_eq!(
            PowerDataObject::from_raw(raw),
            PowerDataObject::Augmented(Augmented::Unknown(raw))
        );
    }
}
