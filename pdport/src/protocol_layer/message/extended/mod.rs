//! Definitions and implementations of extended messages.
//!
//! See [6.5].

pub mod chunked;
pub mod extended_control;
pub mod manufacturer_info;

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use proc_bitfield::bitfield;

use crate::protocol_layer::message::ParseError;
use crate::protocol_layer::message::data::sink_capabilities::{
    SinkBattery, SinkFixedSupply, SinkPowerDataObject, SinkVariableSupply,
};
use crate::protocol_layer::message::data::source_capabilities::{MAX_EPR_PDOS, PowerDataObject, SourceCapabilities};
use crate::protocol_layer::message::header::ExtendedMessageType;

/// Payloads of extended messages.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Extended {
    /// Extended control message payload.
    ExtendedControl(extended_control::ExtendedControl),
    /// EPR source capabilities list.
    EprSourceCapabilities(Vec<PowerDataObject, MAX_EPR_PDOS>),
    /// EPR sink capabilities list.
    EprSinkCapabilities(Vec<SinkPowerDataObject, 7>),
    /// Request for manufacturer info.
    GetManufacturerInfo(manufacturer_info::GetManufacturerInfo),
    /// Manufacturer info response.
    ManufacturerInfo(manufacturer_info::ManufacturerInfo),
    /// Unknown extended message, type retained for Not_Supported handling.
    Unknown,
}

impl Extended {
    /// Parse a fully assembled extended payload.
    pub fn parse(message_type: ExtendedMessageType, data: &[u8]) -> Result<Self, ParseError> {
        Ok(match message_type {
            ExtendedMessageType::ExtendedControl => {
                Self::ExtendedControl(extended_control::ExtendedControl::from_bytes(data)?)
            }
            ExtendedMessageType::EprSourceCapabilities => {
                Self::EprSourceCapabilities(SourceCapabilities::from_bytes(data, data.len() / 4).0)
            }
            ExtendedMessageType::EprSinkCapabilities => Self::EprSinkCapabilities(
                data.chunks_exact(4)
                    .take(7)
                    .map(|buf| {
                        // Sink PDO kinds mirror the source encoding in bits 30..=31.
                        let raw = LittleEndian::read_u32(buf);
                        match raw >> 30 {
                            0b01 => SinkPowerDataObject::Battery(SinkBattery(raw)),
                            0b10 => SinkPowerDataObject::VariableSupply(SinkVariableSupply(raw)),
                            _ => SinkPowerDataObject::FixedSupply(SinkFixedSupply(raw)),
                        }
                    })
                    .collect(),
            ),
            ExtendedMessageType::GetManufacturerInfo => {
                Self::GetManufacturerInfo(manufacturer_info::GetManufacturerInfo::from_bytes(data)?)
            }
            ExtendedMessageType::ManufacturerInfo => {
                Self::ManufacturerInfo(manufacturer_info::ManufacturerInfo::from_bytes(data)?)
            }
            _ => Self::Unknown,
        })
    }

    /// Size of the extended payload in bytes.
    pub fn data_size(&self) -> u16 {
        match self {
            Self::ExtendedControl(_payload) => 2,
            Self::EprSourceCapabilities(pdos) => (pdos.len() * core::mem::size_of::<u32>()) as u16,
            Self::EprSinkCapabilities(pdos) => (pdos.len() * core::mem::size_of::<u32>()) as u16,
            Self::GetManufacturerInfo(_) => 2,
            Self::ManufacturerInfo(info) => 4 + info.string.len() as u16,
            Self::Unknown => 0,
        }
    }

    /// Serialize message data to a slice, returning the number of written bytes.
    pub fn to_bytes(&self, payload: &mut [u8]) -> usize {
        match self {
            Self::Unknown => 0,
            Self::ExtendedControl(control) => control.to_bytes(payload),
            Self::EprSourceCapabilities(pdos) => {
                let mut written = 0;
                for pdo in pdos {
                    LittleEndian::write_u32(&mut payload[written..written + 4], pdo.to_raw());
                    written += 4;
                }
                written
            }
            Self::EprSinkCapabilities(pdos) => {
                let mut written = 0;
                for pdo in pdos {
                    LittleEndian::write_u32(&mut payload[written..written + 4], pdo.to_raw());
                    written += 4;
                }
                written
            }
            Self::GetManufacturerInfo(request) => request.to_bytes(payload),
            Self::ManufacturerInfo(info) => info.to_bytes(payload),
        }
    }
}

bitfield! {
    /// Extended message header.
    ///
    /// See [6.2.1.2].
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ExtendedHeader(pub u16): Debug, FromStorage, IntoStorage {
        /// Payload size in bytes.
        pub data_size: u16 @ 0..=8,
        /// Request chunk flag.
        pub request_chunk: bool @ 10,
        /// Chunk number of this extended message.
        pub chunk_number: u8 @ 11..=14,
        /// Whether the message is chunked.
        pub chunked: bool @ 15,
    }
}

impl ExtendedHeader {
    /// Create a new, unchunked extended header for a given payload size.
    pub fn new(data_size: u16) -> Self {
        Self(0).with_data_size(data_size)
    }

    /// Serialize the extended header into the buffer, returning bytes written.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(buf, self.0);
        2
    }

    /// Parse an extended header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 2 {
            return Err(ParseError::InvalidLength {
                expected: 2,
                found: buf.len(),
            });
        }
        Ok(Self(LittleEndian::read_u16(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_header_round_trip() {
        let header = ExtendedHeader::new(44).with_chunked(true).with_chunk_number(1);

        let mut buf = [0u8; 2];
        header.to_bytes(&mut buf);
        let parsed = ExtendedHeader::from_bytes(&buf).unwrap();

        assert_eq!(parsed, header);
        assert_eq!(parsed.data_size(), 44);
        assert_eq!(parsed.chunk_number(), 1);
        assert!(parsed.chunked());
        assert!(!parsed.request_chunk());
    }

    #[test]
    fn epr_source_capabilities_parse() {
        use crate::protocol_layer::message::data::source_capabilities::FixedSupply;

        let mut buf = [0u8; 8];
        LittleEndian::write_u32(
            &mut buf,
            FixedSupply::new().with_raw_voltage(100).with_raw_max_current(300).0,
        );
        LittleEndian::write_u32(
            &mut buf[4..],
            FixedSupply::new().with_raw_voltage(560).with_raw_max_current(500).0,
        );

        let Extended::EprSourceCapabilities(pdos) =
            Extended::parse(ExtendedMessageType::EprSourceCapabilities, &buf).unwrap()
        else {
            panic!("Expected EPR source capabilities");
        };

        assert_eq!(pdos.len(), 2);
        assert!(pdos[1].is_epr());
    }
}
