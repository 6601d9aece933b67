//! Definitions of vendor defined message content.
//!
//! VDM payloads are relayed opaquely to the application; the stack itself
//! only interprets structured Discover Identity exchanges with cable plugs.
//!
//! See [6.4.4].
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;

use crate::units::ElectricPotential;
use uom::si::electric_potential::volt;

/// The standard ID used for structured VDMs defined by the PD specification.
pub const PD_SID: u16 = 0xFF00;

/// The VDM command type field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmCommandType {
    /// Initiator request.
    InitiatorReq,
    /// Responder acknowledge.
    ResponderAck,
    /// Responder negative acknowledge.
    ResponderNak,
    /// Responder busy.
    ResponderBsy,
}

impl From<VdmCommandType> for u8 {
    fn from(value: VdmCommandType) -> Self {
        match value {
            VdmCommandType::InitiatorReq => 0,
            VdmCommandType::ResponderAck => 1,
            VdmCommandType::ResponderNak => 2,
            VdmCommandType::ResponderBsy => 3,
        }
    }
}

impl From<u8> for VdmCommandType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0 => VdmCommandType::InitiatorReq,
            1 => VdmCommandType::ResponderAck,
            2 => VdmCommandType::ResponderNak,
            3 => VdmCommandType::ResponderBsy,
            _ => unreachable!(),
        }
    }
}

/// Structured VDM commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmCommand {
    /// Discover the identity of the port partner or a cable plug.
    DiscoverIdentity,
    /// Discover supported standard or vendor IDs.
    DiscoverSvids,
    /// Discover the modes of an SVID.
    DiscoverModes,
    /// Enter a mode.
    EnterMode,
    /// Exit a mode.
    ExitMode,
    /// Attention.
    Attention,
    /// Reserved or SVID-specific command, carried raw.
    Other(u8),
}

impl From<VdmCommand> for u8 {
    fn from(value: VdmCommand) -> Self {
        match value {
            VdmCommand::DiscoverIdentity => 0x1,
            VdmCommand::DiscoverSvids => 0x2,
            VdmCommand::DiscoverModes => 0x3,
            VdmCommand::EnterMode => 0x4,
            VdmCommand::ExitMode => 0x5,
            VdmCommand::Attention => 0x6,
            VdmCommand::Other(x) => x,
        }
    }
}

impl From<u8> for VdmCommand {
    fn from(value: u8) -> Self {
        match value {
            0x01 => VdmCommand::DiscoverIdentity,
            0x02 => VdmCommand::DiscoverSvids,
            0x03 => VdmCommand::DiscoverModes,
            0x04 => VdmCommand::EnterMode,
            0x05 => VdmCommand::ExitMode,
            0x06 => VdmCommand::Attention,
            x => VdmCommand::Other(x),
        }
    }
}

/// Whether a VDM is structured or unstructured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VdmType {
    /// Unstructured, vendor-specific VDM.
    Unstructured,
    /// Structured VDM.
    Structured,
}

impl From<VdmType> for bool {
    fn from(value: VdmType) -> Self {
        match value {
            VdmType::Unstructured => false,
            VdmType::Structured => true,
        }
    }
}

impl From<bool> for VdmType {
    fn from(value: bool) -> Self {
        match value {
            true => VdmType::Structured,
            false => VdmType::Unstructured,
        }
    }
}

/// The first data object of any VDM.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VdmHeader {
    /// A structured VDM header.
    Structured(VdmHeaderStructured),
    /// An unstructured VDM header.
    Unstructured(VdmHeaderUnstructured),
}

impl VdmHeader {
    /// Serialize the header into the buffer.
    pub fn to_bytes(self, buf: &mut [u8]) {
        match self {
            VdmHeader::Structured(header) => header.to_bytes(buf),
            VdmHeader::Unstructured(header) => header.to_bytes(buf),
        }
    }
}

impl From<VdmHeader> for u32 {
    fn from(value: VdmHeader) -> Self {
        match value {
            VdmHeader::Structured(header) => header.into(),
            VdmHeader::Unstructured(header) => header.into(),
        }
    }
}

impl From<u32> for VdmHeader {
    fn from(value: u32) -> Self {
        let header = VdmHeaderRaw(value);
        match header.vdm_type() {
            VdmType::Structured => VdmHeader::Structured(VdmHeaderStructured(value)),
            VdmType::Unstructured => VdmHeader::Unstructured(VdmHeaderUnstructured(value)),
        }
    }
}

bitfield! {
    /// A VDM header before its type is known.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct VdmHeaderRaw(pub u32): FromStorage, IntoStorage {
        /// VDM Standard or Vendor ID
        pub standard_or_vid: u16 @ 16..=31,
        /// VDM Type (Unstructured/Structured)
        pub vdm_type: bool [VdmType] @ 15,
    }
}

bitfield! {
    /// A structured VDM header, see [Table 6.30].
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VdmHeaderStructured(pub u32): FromStorage, IntoStorage {
        /// VDM Standard or Vendor ID
        pub standard_or_vid: u16 @ 16..=31,
        /// VDM Type (Unstructured/Structured)
        pub vdm_type: bool [VdmType] @ 15,
        /// Structured VDM version, major
        pub vdm_version_major: u8 @ 13..=14,
        /// Structured VDM version, minor
        pub vdm_version_minor: u8 @ 11..=12,
        /// Object Position
        pub object_position: u8 @ 8..=10,
        /// Command Type
        pub command_type: u8 [VdmCommandType] @ 6..=7,
        /// Command
        pub command: u8 [VdmCommand] @ 0..=4,
    }
}

impl VdmHeaderStructured {
    /// Serialize the header into the buffer.
    pub fn to_bytes(self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, self.0);
    }

    /// A Discover Identity request header, as sent to a cable plug.
    pub fn discover_identity_request() -> Self {
        Self::default()
            .with_standard_or_vid(PD_SID)
            .with_command_type(VdmCommandType::InitiatorReq)
            .with_command(VdmCommand::DiscoverIdentity)
    }
}

impl Default for VdmHeaderStructured {
    fn default() -> Self {
        VdmHeaderStructured(0).with_vdm_type(VdmType::Structured)
    }
}

bitfield! {
    /// An unstructured VDM header, see [Table 6.29].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VdmHeaderUnstructured(pub u32): FromStorage, IntoStorage {
        /// Vdm Standard or Vendor ID
        pub standard_or_vid: u16 @ 16..=31,
        /// Vdm Type (Unstructured/Structured)
        pub vdm_type: bool [VdmType] @ 15,
        /// Message defined
        pub data: u16 @ 0..=14
    }
}

impl VdmHeaderUnstructured {
    /// Serialize the header into the buffer.
    pub fn to_bytes(self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, self.0);
    }
}

bitfield! {
    /// The ID header VDO of a Discover Identity response, see [Table 6.34].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VdmIdentityHeader(pub u32): FromStorage, IntoStorage {
        /// Host data capable
        pub host_data: bool @ 31,
        /// Device data capable
        pub device_data: bool @ 30,
        /// Product type (UFP or cable plug)
        pub product_type_ufp: u8 @ 27..=29,
        /// Modal Operation Supported
        pub modal_supported: bool @ 26,
        /// Product type DFP
        pub product_type_dfp: u8 @ 23..=25,
        /// Connector type
        pub connector_type: u8 @ 21..=22,
        /// VID
        pub vid: u16 @ 0..=15,
    }
}

impl VdmIdentityHeader {
    /// Serialize the VDO into the buffer.
    pub fn to_bytes(self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, self.0);
    }

    /// Whether the responder identifies as a passive cable plug.
    pub fn is_passive_cable(&self) -> bool {
        self.product_type_ufp() == 0b011
    }

    /// Whether the responder identifies as an active cable plug.
    pub fn is_active_cable(&self) -> bool {
        self.product_type_ufp() == 0b100
    }
}

bitfield! {
    /// The certification status VDO, see [Table 6.36].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct CertStatVdo(pub u32): FromStorage, IntoStorage {
        /// XID
        pub xid: u32 @ 0..=31,
    }
}

bitfield! {
    /// The product VDO, see [Table 6.37].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct ProductVdo(pub u32): FromStorage, IntoStorage {
        /// USB Product ID
        pub pid: u16 @ 16..=31,
        /// Device release number.
        pub bcd_device: u16 @ 0..=15,
    }
}

/// Maximum VBus voltage a cable supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CableMaxVoltage {
    /// 20 V.
    V20,
    /// 30 V.
    V30,
    /// 40 V.
    V40,
    /// 50 V.
    V50,
}

impl CableMaxVoltage {
    /// The maximum voltage as an electrical quantity.
    pub fn voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<volt>(match self {
            CableMaxVoltage::V20 => 20,
            CableMaxVoltage::V30 => 30,
            CableMaxVoltage::V40 => 40,
            CableMaxVoltage::V50 => 50,
        })
    }
}

impl From<u8> for CableMaxVoltage {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b00 => CableMaxVoltage::V20,
            0b01 => CableMaxVoltage::V30,
            0b10 => CableMaxVoltage::V40,
            0b11 => CableMaxVoltage::V50,
            _ => unreachable!(),
        }
    }
}

impl From<CableMaxVoltage> for u8 {
    fn from(value: CableMaxVoltage) -> Self {
        match value {
            CableMaxVoltage::V20 => 0b00,
            CableMaxVoltage::V30 => 0b01,
            CableMaxVoltage::V40 => 0b10,
            CableMaxVoltage::V50 => 0b11,
        }
    }
}

/// Maximum VBus current a cable supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CableCurrent {
    /// Default USB current.
    UsbDefault,
    /// 3 A.
    Current3A,
    /// 5 A.
    Current5A,
}

impl From<u8> for CableCurrent {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => CableCurrent::Current3A,
            0b10 => CableCurrent::Current5A,
            _ => CableCurrent::UsbDefault,
        }
    }
}

impl From<CableCurrent> for u8 {
    fn from(value: CableCurrent) -> Self {
        match value {
            CableCurrent::UsbDefault => 0b00,
            CableCurrent::Current3A => 0b01,
            CableCurrent::Current5A => 0b10,
        }
    }
}

bitfield! {
    /// The passive/active cable VDO of a cable plug's Discover Identity
    /// response, see [Table 6.38].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct CableVdo(pub u32): FromStorage, IntoStorage {
        /// Hardware version.
        pub hw_version: u8 @ 28..=31,
        /// Firmware version.
        pub fw_version: u8 @ 24..=27,
        /// VDO version.
        pub vdo_version: u8 @ 21..=23,
        /// Plug type.
        pub plug_type: u8 @ 18..=19,
        /// EPR mode capable.
        pub epr_mode_capable: bool @ 17,
        /// Cable latency.
        pub cable_latency: u8 @ 13..=16,
        /// Cable termination type.
        pub cable_termination: u8 @ 11..=12,
        /// Maximum VBus voltage.
        pub max_voltage: u8 [CableMaxVoltage] @ 9..=10,
        /// SBU supported.
        pub sbu_supported: bool @ 8,
        /// VBus through cable.
        pub vbus_through_cable: bool @ 7,
        /// VBus current handling capability.
        pub max_current: u8 [CableCurrent] @ 5..=6,
        /// USB highest speed.
        pub usb_highest_speed: u8 @ 0..=2,
    }
}

impl CableVdo {
    /// Serialize the VDO into the buffer.
    pub fn to_bytes(self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_identity_request_header() {
        let header = VdmHeaderStructured::discover_identity_request();

        assert_eq!(header.standard_or_vid(), PD_SID);
        assert_eq!(header.vdm_type(), VdmType::Structured);
        assert_eq!(header.command_type(), VdmCommandType::InitiatorReq);
        assert_eq!(header.command(), VdmCommand::DiscoverIdentity);
    }

    #[test]
    fn cable_vdo_voltage_and_current() {
        let vdo = CableVdo(0)
            .with_max_voltage(CableMaxVoltage::V50)
            .with_max_current(CableCurrent::Current5A)
            .with_epr_mode_capable(true);

        assert_eq!(vdo.max_voltage(), CableMaxVoltage::V50);
        assert_eq!(vdo.max_current(), CableCurrent::Current5A);
        assert!(vdo.epr_mode_capable());
        assert!(vdo.max_voltage() >= CableMaxVoltage::V50);
    }

    #[test]
    fn svid_specific_commands_are_carried_raw() {
        assert_eq!(VdmCommand::from(0x10), VdmCommand::Other(0x10));
        assert_eq!(u8::from(VdmCommand::Other(0x10)), 0x10);
    }
}
