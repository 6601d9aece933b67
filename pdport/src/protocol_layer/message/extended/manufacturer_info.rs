//! Definitions of manufacturer info extended message content.
//!
//! See [6.5.7].
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use crate::protocol_layer::message::ParseError;

/// Maximum length of the manufacturer string, in bytes.
pub const MAX_MANUFACTURER_STRING: usize = 22;

/// The target of a Get_Manufacturer_Info request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InfoTarget {
    /// The port itself.
    Port,
    /// A battery, identified by the reference field.
    Battery,
    /// Reserved target, carried raw.
    Other(u8),
}

impl From<u8> for InfoTarget {
    fn from(value: u8) -> Self {
        match value {
            0 => InfoTarget::Port,
            1 => InfoTarget::Battery,
            x => InfoTarget::Other(x),
        }
    }
}

impl From<InfoTarget> for u8 {
    fn from(value: InfoTarget) -> Self {
        match value {
            InfoTarget::Port => 0,
            InfoTarget::Battery => 1,
            InfoTarget::Other(x) => x,
        }
    }
}

/// A Get_Manufacturer_Info request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GetManufacturerInfo {
    /// What the request refers to.
    pub target: u8,
    /// Battery reference, when the target is a battery.
    pub reference: u8,
}

impl GetManufacturerInfo {
    /// Parse the request payload.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 2 {
            return Err(ParseError::InvalidLength {
                expected: 2,
                found: buf.len(),
            });
        }
        Ok(Self {
            target: buf[0],
            reference: buf[1],
        })
    }

    /// Serialize the request payload, returning the number of written bytes.
    pub fn to_bytes(self, buf: &mut [u8]) -> usize {
        buf[0] = self.target;
        buf[1] = self.reference;
        2
    }
}

/// A Manufacturer_Info response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManufacturerInfo {
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
    /// Manufacturer string, not null-terminated.
    pub string: Vec<u8, MAX_MANUFACTURER_STRING>,
}

impl ManufacturerInfo {
    /// Parse the response payload.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 4 {
            return Err(ParseError::InvalidLength {
                expected: 4,
                found: buf.len(),
            });
        }

        let mut string = Vec::new();
        for byte in buf[4..].iter().take(MAX_MANUFACTURER_STRING) {
            // The response may be padded with trailing zeros.
            if *byte == 0 {
                break;
            }
            string.push(*byte).ok();
        }

        Ok(Self {
            vid: LittleEndian::read_u16(&buf[..2]),
            pid: LittleEndian::read_u16(&buf[2..4]),
            string,
        })
    }

    /// Serialize the response payload, returning the number of written bytes.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(buf, self.vid);
        LittleEndian::write_u16(&mut buf[2..], self.pid);
        buf[4..4 + self.string.len()].copy_from_slice(&self.string);
        4 + self.string.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manufacturer_info_round_trip() {
        let mut string = Vec::new();
        string.extend_from_slice(b"pdport").unwrap();

        let info = ManufacturerInfo {
            vid: 0x1234,
            pid: 0x5678,
            string,
        };

        let mut buf = [0u8; 26];
        let written = info.to_bytes(&mut buf);
        assert_eq!(written, 10);

        let parsed = ManufacturerInfo::from_bytes(&buf[..written]).unwrap();
        assert_eq!(parsed, info);
    }
}
