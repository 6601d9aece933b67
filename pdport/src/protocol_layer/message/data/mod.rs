//! Definitions and implementations of data messages.
//!
//! See [6.4].
pub mod bist;
pub mod epr_mode;
pub mod request;
pub mod sink_capabilities;
pub mod source_capabilities;
pub mod vendor_defined;

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use crate::protocol_layer::message::Payload;
use crate::protocol_layer::message::header::DataMessageType;
use source_capabilities::PdoState;

/// Payloads of data messages.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Data {
    /// Source capabilities.
    SourceCapabilities(source_capabilities::SourceCapabilities),
    /// Sink capabilities.
    SinkCapabilities(sink_capabilities::SinkCapabilities),
    /// Request for a power level from the source.
    Request(request::PowerSource),
    /// Used to enter, acknowledge or exit EPR mode.
    EprMode(epr_mode::EprModeDataObject),
    /// Built-in self test control.
    Bist(bist::BistDataObject),
    /// Vendor defined message: header and vendor data objects.
    VendorDefined((vendor_defined::VdmHeader, Vec<u32, 7>)),
    /// Unknown data type.
    Unknown,
}

impl Data {
    /// Parse a data message.
    pub fn parse_message<P: PdoState>(
        mut message: super::Message,
        message_type: DataMessageType,
        payload: &[u8],
        state: &P,
    ) -> Result<super::Message, super::ParseError> {
        let len = payload.len();
        message.payload = Some(Payload::Data(match message_type {
            DataMessageType::SourceCapabilities => Data::SourceCapabilities(
                source_capabilities::SourceCapabilities::from_bytes(payload, message.header.num_objects()),
            ),
            DataMessageType::SinkCapabilities => Data::SinkCapabilities(sink_capabilities::SinkCapabilities(
                payload
                    .chunks_exact(4)
                    .take(message.header.num_objects().min(7))
                    .map(|buf| {
                        let raw = LittleEndian::read_u32(buf);
                        match raw >> 30 {
                            0b01 => sink_capabilities::SinkPowerDataObject::Battery(sink_capabilities::SinkBattery(raw)),
                            0b10 => sink_capabilities::SinkPowerDataObject::VariableSupply(
                                sink_capabilities::SinkVariableSupply(raw),
                            ),
                            _ => sink_capabilities::SinkPowerDataObject::FixedSupply(sink_capabilities::SinkFixedSupply(
                                raw,
                            )),
                        }
                    })
                    .collect(),
            )),
            DataMessageType::Request => {
                if len != 4 {
                    Data::Unknown
                } else {
                    let raw = request::RawDataObject(LittleEndian::read_u32(payload));
                    if let Some(t) = state.pdo_at_object_position(raw.object_position()) {
                        Data::Request(match t {
                            source_capabilities::Kind::FixedSupply | source_capabilities::Kind::VariableSupply => {
                                request::PowerSource::FixedVariableSupply(request::FixedVariableSupply(raw.0))
                            }
                            source_capabilities::Kind::Battery => {
                                request::PowerSource::Battery(request::Battery(raw.0))
                            }
                            source_capabilities::Kind::Pps => request::PowerSource::Pps(request::Pps(raw.0)),
                            source_capabilities::Kind::Avs => request::PowerSource::Avs(request::Avs(raw.0)),
                        })
                    } else {
                        Data::Request(request::PowerSource::Unknown(raw))
                    }
                }
            }
            DataMessageType::EprRequest => {
                if len != 8 {
                    Data::Unknown
                } else {
                    let epr = request::EprRequest::from_bytes(payload);
                    if state.pdo_at_object_position(epr.object_position()).is_some() || epr.object_position() >= 8 {
                        Data::Request(request::PowerSource::EprRequest(epr))
                    } else {
                        Data::Request(request::PowerSource::Unknown(request::RawDataObject(epr.rdo)))
                    }
                }
            }
            DataMessageType::EprMode => {
                if len != 4 {
                    Data::Unknown
                } else {
                    Data::EprMode(epr_mode::EprModeDataObject(LittleEndian::read_u32(payload)))
                }
            }
            DataMessageType::Bist => {
                if len < 4 {
                    Data::Unknown
                } else {
                    Data::Bist(bist::BistDataObject(LittleEndian::read_u32(payload)))
                }
            }
            DataMessageType::VendorDefined => {
                if len < 4 {
                    Data::Unknown
                } else {
                    let header = vendor_defined::VdmHeader::from(LittleEndian::read_u32(&payload[..4]));

                    let data = payload[4..]
                        .chunks_exact(4)
                        .take(7)
                        .map(LittleEndian::read_u32)
                        .collect::<Vec<u32, 7>>();

                    trace!("VDM RX: {:?} {:?}", header, data);
                    Data::VendorDefined((header, data))
                }
            }
            _ => {
                warn!("Unhandled data message type {:?}", message_type);
                Data::Unknown
            }
        }));

        Ok(message)
    }

    /// Serialize message data to a slice, returning the number of written bytes.
    pub fn to_bytes(&self, payload: &mut [u8]) -> usize {
        match self {
            Self::Unknown => 0,
            Self::SourceCapabilities(capabilities) => capabilities.to_bytes(payload),
            Self::SinkCapabilities(capabilities) => capabilities.to_bytes(payload),
            Self::Request(request::PowerSource::FixedVariableSupply(data_object)) => data_object.to_bytes(payload),
            Self::Request(request::PowerSource::Battery(data_object)) => data_object.to_bytes(payload),
            Self::Request(request::PowerSource::Pps(data_object)) => data_object.to_bytes(payload),
            Self::Request(request::PowerSource::Avs(data_object)) => data_object.to_bytes(payload),
            Self::Request(request::PowerSource::EprRequest(data_object)) => data_object.to_bytes(payload),
            Self::Request(request::PowerSource::Unknown(data_object)) => {
                LittleEndian::write_u32(payload, data_object.0);
                4
            }
            Self::EprMode(epr_mode::EprModeDataObject(data_object)) => {
                LittleEndian::write_u32(payload, *data_object);
                4
            }
            Self::Bist(data_object) => {
                LittleEndian::write_u32(payload, data_object.0);
                4
            }
            Self::VendorDefined((header, objects)) => {
                header.to_bytes(payload);
                let mut written = 4;
                for object in objects {
                    LittleEndian::write_u32(&mut payload[written..written + 4], *object);
                    written += 4;
                }
                written
            }
        }
    }

    /// The number of 32 bit data objects this payload serializes to.
    pub fn num_objects(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::SourceCapabilities(capabilities) => capabilities.pdos().len() as u8,
            Self::SinkCapabilities(capabilities) => capabilities.num_objects(),
            Self::Request(request::PowerSource::EprRequest(_)) => 2,
            Self::Request(_) => 1,
            Self::EprMode(_) => 1,
            Self::Bist(_) => 1,
            Self::VendorDefined((_, objects)) => 1 + objects.len() as u8,
        }
    }
}
