//! Immutable per-port configuration.
//!
//! The configuration table is loaded by the embedding application and passed
//! to the port at initialization. It never changes at runtime; feature
//! toggles are checked at the relevant branch points instead of being
//! compiled out.
use heapless::Vec;
use pdport_traits::RpLevel;

use crate::PortRole;
use crate::protocol_layer::message::data::request::SelectionAlgorithm;
use crate::protocol_layer::message::data::sink_capabilities::{SinkCapabilities, SinkPowerDataObject};
use crate::protocol_layer::message::data::source_capabilities::{
    MAX_EPR_PDOS, PowerDataObject, SourceCapabilities,
};
use crate::protocol_layer::message::extended::manufacturer_info::{MAX_MANUFACTURER_STRING, ManufacturerInfo};

/// Maximum number of EPR source PDOs (object positions 8..=11).
pub const MAX_EPR_SOURCE_PDOS: usize = 4;

/// Try.SRC / Try.SNK role preference of a dual-role port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TryRole {
    /// No role preference.
    #[default]
    None,
    /// Prefer sourcing: run Try.SRC after attach-wait.
    TrySrc,
    /// Prefer sinking: run Try.SNK after attach-wait.
    TrySnk,
}

/// Manufacturer identification, answered to Get_Manufacturer_Info.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ManufacturerConfig {
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
    /// Manufacturer string, at most 22 bytes.
    pub string: Vec<u8, MAX_MANUFACTURER_STRING>,
}

impl ManufacturerConfig {
    /// The manufacturer info message payload for this configuration.
    pub fn info(&self) -> ManufacturerInfo {
        ManufacturerInfo {
            vid: self.vid,
            pid: self.pid,
            string: self.string.clone(),
        }
    }
}

impl Default for ManufacturerConfig {
    fn default() -> Self {
        Self {
            vid: 0,
            pid: 0,
            string: Vec::new(),
        }
    }
}

/// Immutable configuration of one port.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortConfig {
    /// The roles this port supports.
    pub port_role: PortRole,
    /// Role preference of a dual-role port.
    pub try_role: TryRole,
    /// The Rp level advertised while sourcing.
    pub default_rp: RpLevel,

    /// SPR source PDOs (object positions 1..=7).
    pub spr_source_pdos: Vec<PowerDataObject, 7>,
    /// Enable mask for the SPR source PDOs, bit 0 = position 1.
    pub spr_source_pdo_mask: u8,
    /// EPR source PDOs (object positions 8..=11).
    pub epr_source_pdos: Vec<PowerDataObject, MAX_EPR_SOURCE_PDOS>,
    /// Enable mask for the EPR source PDOs, bit 0 = position 8.
    pub epr_source_pdo_mask: u8,
    /// Sink PDOs.
    pub sink_pdos: Vec<SinkPowerDataObject, 7>,
    /// Enable mask for the sink PDOs, bit 0 = position 1.
    pub sink_pdo_mask: u8,
    /// The algorithm used by the default sink policy to select a PDO.
    pub pdo_selection: SelectionAlgorithm,

    /// Whether this port may enter EPR mode.
    pub epr_supported: bool,
    /// EPR sink operational PDP in watts, sent in the EPR entry request.
    pub epr_operational_pdp_w: u8,

    /// Whether the source runs cable discovery before sending capabilities.
    pub cable_discovery: bool,
    /// Whether audio accessory detection is enabled.
    pub audio_accessory: bool,
    /// Whether debug accessory detection is enabled.
    pub debug_accessory: bool,
    /// Whether CC faults force Type-C error recovery (otherwise the port
    /// merely detaches).
    pub error_recovery: bool,
    /// Whether the port starts up in dead-battery mode (Rd presented by
    /// hardware until VBUS is available).
    pub dead_battery: bool,
    /// Whether fast role swap is supported.
    pub frs_supported: bool,

    /// Manufacturer identification.
    pub manufacturer: ManufacturerConfig,
}

impl PortConfig {
    /// A minimal sink-only configuration.
    pub fn sink_default() -> Self {
        Self {
            port_role: PortRole::Sink,
            try_role: TryRole::None,
            default_rp: RpLevel::Default,
            spr_source_pdos: Vec::new(),
            spr_source_pdo_mask: 0,
            epr_source_pdos: Vec::new(),
            epr_source_pdo_mask: 0,
            sink_pdos: SinkCapabilities::new_vsafe5v_only(300).0,
            sink_pdo_mask: 0x01,
            pdo_selection: SelectionAlgorithm::HighestVoltage,
            epr_supported: false,
            epr_operational_pdp_w: 0,
            cable_discovery: false,
            audio_accessory: false,
            debug_accessory: false,
            error_recovery: true,
            dead_battery: false,
            frs_supported: false,
            manufacturer: Default::default(),
        }
    }

    /// A minimal source-only configuration with the given SPR PDOs.
    pub fn source_default(spr_source_pdos: Vec<PowerDataObject, 7>) -> Self {
        let mask = (1u8 << spr_source_pdos.len()) - 1;
        Self {
            port_role: PortRole::Source,
            spr_source_pdos,
            spr_source_pdo_mask: mask,
            cable_discovery: true,
            ..Self::sink_default()
        }
    }

    /// The enabled SPR source capabilities.
    pub fn spr_source_capabilities(&self) -> SourceCapabilities {
        SourceCapabilities(
            self.spr_source_pdos
                .iter()
                .enumerate()
                .filter(|(index, _)| self.spr_source_pdo_mask & (1 << index) != 0)
                .map(|(_, pdo)| *pdo)
                .collect(),
        )
    }

    /// The enabled EPR source capabilities: all SPR positions, padded to
    /// seven objects, followed by the enabled EPR PDOs.
    pub fn epr_source_capabilities(&self) -> SourceCapabilities {
        let mut pdos: Vec<PowerDataObject, MAX_EPR_PDOS> = Vec::new();

        for (index, pdo) in self.spr_source_pdos.iter().enumerate() {
            if self.spr_source_pdo_mask & (1 << index) != 0 {
                pdos.push(*pdo).ok();
            }
        }
        // EPR PDOs start at object position 8.
        while pdos.len() < 7 {
            pdos.push(PowerDataObject::Unknown(
                crate::protocol_layer::message::data::source_capabilities::RawPowerDataObject(0),
            ))
            .ok();
        }
        for (index, pdo) in self.epr_source_pdos.iter().enumerate() {
            if self.epr_source_pdo_mask & (1 << index) != 0 {
                pdos.push(*pdo).ok();
            }
        }

        SourceCapabilities(pdos)
    }

    /// The enabled sink capabilities.
    pub fn sink_capabilities(&self) -> SinkCapabilities {
        SinkCapabilities(
            self.sink_pdos
                .iter()
                .enumerate()
                .filter(|(index, _)| self.sink_pdo_mask & (1 << index) != 0)
                .map(|(_, pdo)| *pdo)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_layer::message::data::source_capabilities::FixedSupply;

    fn fixed(voltage_50mv: u16, current_10ma: u16) -> PowerDataObject {
        PowerDataObject::FixedSupply(
            FixedSupply::new()
                .with_raw_voltage(voltage_50mv)
                .with_raw_max_current(current_10ma),
        )
    }

    #[test]
    fn pdo_mask_filters_source_capabilities() {
        let mut pdos: Vec<PowerDataObject, 7> = Vec::new();
        pdos.push(fixed(100, 300)).unwrap();
        pdos.push(fixed(180, 300)).unwrap();
        pdos.push(fixed(400, 225)).unwrap();

        let mut config = PortConfig::source_default(pdos);
        config.spr_source_pdo_mask = 0b101;

        let caps = config.spr_source_capabilities();
        assert_eq!(caps.pdos().len(), 2);
    }

    #[test]
    fn epr_capabilities_place_epr_pdos_at_position_eight() {
        let mut pdos: Vec<PowerDataObject, 7> = Vec::new();
        pdos.push(fixed(100, 300)).unwrap();

        let mut config = PortConfig::source_default(pdos);
        config.epr_source_pdos.push(fixed(560, 500)).unwrap();
        config.epr_source_pdo_mask = 0b1;
        config.epr_supported = true;

        let caps = config.epr_source_capabilities();
        assert_eq!(caps.pdos().len(), 8);
        assert!(caps.pdos()[7].is_epr());
    }
}
