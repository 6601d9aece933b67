//! Definitions of message content.

pub mod data;
pub mod extended;
pub mod header;

use extended::ExtendedHeader;
use extended::chunked::MAX_EXTENDED_MSG_CHUNK_LEN;
use header::{Header, MessageType};

/// Errors that can occur during message/header parsing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The input buffer has an invalid length.
    #[error("invalid input buffer length (expected {expected:?}, found {found:?})")]
    InvalidLength {
        /// The expected length.
        expected: usize,
        /// The actual length found.
        found: usize,
    },
    /// The specification revision field is not supported.
    #[error("unsupported specification revision `{0}`")]
    UnsupportedSpecificationRevision(u8),
    /// The message is part of a chunked extended transfer and must go
    /// through the chunk assembler.
    #[error("chunked extended message requires assembly")]
    ChunkedExtendedMessage,
    /// A new chunked transfer was started while another was in progress.
    #[error("chunk assembler already in use")]
    ParserReuse,
    /// A chunk exceeded the maximum chunk size.
    #[error("chunk of {0} bytes exceeds the maximum of {1}")]
    ChunkOverflow(usize, usize),
    /// Other parsing error with a message.
    #[error("other parse error: {0}")]
    Other(&'static str),
}

/// Payload of a USB PD message, if any.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Payload {
    /// Payload for a data message.
    Data(data::Data),
    /// Payload for an extended message.
    Extended(extended::Extended),
}

/// A USB PD message.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    /// The message header.
    pub header: Header,
    /// Optional payload for data and extended messages.
    pub payload: Option<Payload>,
}

impl Message {
    /// Create a new message from a message header.
    pub fn new(header: Header) -> Self {
        Self { header, payload: None }
    }

    /// Create a new message from a message header and payload data.
    pub fn new_with_data(header: Header, data: data::Data) -> Self {
        Self {
            header,
            payload: Some(Payload::Data(data)),
        }
    }

    /// Serialize a message to a slice, returning the number of written bytes.
    pub fn to_bytes(&self, buffer: &mut [u8]) -> usize {
        self.header.to_bytes(buffer)
            + match self.payload.as_ref() {
                Some(Payload::Data(data)) => data.to_bytes(&mut buffer[2..]),
                Some(Payload::Extended(extended)) => {
                    // Unchunked single-frame extended message.
                    let ext_header = ExtendedHeader::new(extended.data_size());
                    let written = ext_header.to_bytes(&mut buffer[2..]);
                    written + extended.to_bytes(&mut buffer[2 + written..])
                }
                None => 0,
            }
    }

    /// Parse a message from a slice of bytes.
    ///
    /// Chunks of a multi-chunk extended transfer cannot be parsed in
    /// isolation; they report [`ParseError::ChunkedExtendedMessage`] and must
    /// be fed through [`extended::chunked::ChunkedMessageAssembler`] instead.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        Self::parse_with_state(data, &())
    }

    /// Parse a message, resolving request data objects against known PDOs.
    pub fn parse_with_state<P: data::source_capabilities::PdoState>(
        data: &[u8],
        state: &P,
    ) -> Result<Self, ParseError> {
        if data.len() < 2 {
            return Err(ParseError::InvalidLength {
                expected: 2,
                found: data.len(),
            });
        }

        let header = Header::from_bytes(&data[..2])?;
        let message = Self::new(header);
        let payload = &data[2..];

        match message.header.message_type() {
            MessageType::Control(_) => Ok(message),
            MessageType::Extended(message_type) => {
                let ext_header = ExtendedHeader::from_bytes(payload)?;

                let multi_chunk = ext_header.data_size() as usize > MAX_EXTENDED_MSG_CHUNK_LEN;
                if ext_header.request_chunk() || (ext_header.chunked() && (multi_chunk || ext_header.chunk_number() > 0))
                {
                    return Err(ParseError::ChunkedExtendedMessage);
                }

                let data_size = ext_header.data_size() as usize;
                if payload.len() < 2 + data_size {
                    return Err(ParseError::InvalidLength {
                        expected: 2 + data_size,
                        found: payload.len(),
                    });
                }

                let mut message = message;
                message.payload = Some(Payload::Extended(extended::Extended::parse(
                    message_type,
                    &payload[2..2 + data_size],
                )?));
                Ok(message)
            }
            MessageType::Data(message_type) => data::Data::parse_message(message, message_type, payload, state),
        }
    }

    /// Split a single received frame of a chunked extended message into its
    /// message header, extended header and chunk payload.
    pub fn parse_extended_chunk(data: &[u8]) -> Result<(Header, ExtendedHeader, &[u8]), ParseError> {
        if data.len() < 4 {
            return Err(ParseError::InvalidLength {
                expected: 4,
                found: data.len(),
            });
        }

        let header = Header::from_bytes(&data[..2])?;
        let ext_header = ExtendedHeader::from_bytes(&data[2..])?;

        let available = data.len() - 4;
        let chunk_len = core::cmp::min(
            available,
            core::cmp::min(ext_header.data_size() as usize, MAX_EXTENDED_MSG_CHUNK_LEN),
        );

        Ok((header, ext_header, &data[4..4 + chunk_len]))
    }
}

#[cfg(test)]
mod tests {
    use super::extended::Extended;
    use super::extended::extended_control::{ExtendedControl, ExtendedControlMessageType};
    use super::header::{ControlMessageType, DataMessageType, ExtendedMessageType, SpecificationRevision};
    use super::*;
    use crate::counters::{Counter, CounterType};
    use crate::{DataRole, PowerRole};

    fn template() -> Header {
        Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X)
    }

    #[test]
    fn control_message_round_trip() {
        let message = Message::new(Header::new_control(
            template(),
            Counter::new_from_value(CounterType::MessageId, 3),
            ControlMessageType::Accept,
        ));

        let mut buf = [0u8; 2];
        assert_eq!(message.to_bytes(&mut buf), 2);

        let parsed = Message::from_bytes(&buf).unwrap();
        assert_eq!(
            parsed.header.message_type(),
            MessageType::Control(ControlMessageType::Accept)
        );
        assert!(parsed.payload.is_none());
    }

    #[test]
    fn single_chunk_extended_message_parses_inline() {
        let header = Header::new_extended(
            template(),
            Counter::new_from_value(CounterType::MessageId, 0),
            ExtendedMessageType::ExtendedControl,
            0,
        );
        let mut message = Message::new(header);
        message.payload = Some(Payload::Extended(Extended::ExtendedControl(
            ExtendedControl::default().with_message_type(ExtendedControlMessageType::EprKeepAlive),
        )));

        let mut buf = [0u8; 8];
        let len = message.to_bytes(&mut buf);

        let parsed = Message::from_bytes(&buf[..len]).unwrap();
        let Some(Payload::Extended(Extended::ExtendedControl(control))) = parsed.payload else {
            panic!("Expected extended control payload");
        };
        assert_eq!(control.message_type().unwrap(), ExtendedControlMessageType::EprKeepAlive);
    }

    #[test]
    fn multi_chunk_frame_demands_assembly() {
        let header = Header::new_extended(
            template(),
            Counter::new_from_value(CounterType::MessageId, 0),
            ExtendedMessageType::EprSourceCapabilities,
            7,
        );

        let mut buf = [0u8; 30];
        header.to_bytes(&mut buf);
        ExtendedHeader::new(44)
            .with_chunked(true)
            .with_chunk_number(0)
            .to_bytes(&mut buf[2..]);

        assert_eq!(Message::from_bytes(&buf), Err(ParseError::ChunkedExtendedMessage));

        let (parsed_header, ext_header, chunk) = Message::parse_extended_chunk(&buf).unwrap();
        assert_eq!(parsed_header, header);
        assert_eq!(ext_header.data_size(), 44);
        assert_eq!(chunk.len(), 26);
    }

    #[test]
    fn request_message_resolves_against_pdo_state() {
        use crate::protocol_layer::message::data::request::PowerSource;
        use crate::protocol_layer::message::data::source_capabilities::{
            FixedSupply, MAX_EPR_PDOS, PowerDataObject, SourceCapabilities,
        };

        let mut pdos: heapless::Vec<PowerDataObject, MAX_EPR_PDOS> = heapless::Vec::new();
        pdos.push(PowerDataObject::FixedSupply(
            FixedSupply::new().with_raw_voltage(100).with_raw_max_current(300),
        ))
        .unwrap();
        let caps = SourceCapabilities(pdos);

        let request = PowerSource::new_fixed(
            crate::protocol_layer::message::data::request::CurrentRequest::Highest,
            crate::protocol_layer::message::data::request::VoltageRequest::Safe5V,
            &caps,
        )
        .unwrap();

        let header = Header::new_data(
            template(),
            Counter::new_from_value(CounterType::MessageId, 0),
            DataMessageType::Request,
            1,
        );
        let message = Message::new_with_data(header, data::Data::Request(request));

        let mut buf = [0u8; 6];
        let len = message.to_bytes(&mut buf);

        let parsed = Message::parse_with_state(&buf[..len], &caps).unwrap();
        let Some(Payload::Data(data::Data::Request(PowerSource::FixedVariableSupply(rdo)))) = parsed.payload else {
            panic!("Expected fixed supply request");
        };
        assert_eq!(rdo.object_position(), 1);
        assert_eq!(rdo.raw_operating_current(), 300);
    }

    #[test]
    fn request_with_object_position_zero_is_unknown() {
        use crate::protocol_layer::message::data::request::PowerSource;
        use crate::protocol_layer::message::data::source_capabilities::{
            FixedSupply, MAX_EPR_PDOS, PowerDataObject, SourceCapabilities,
        };

        let mut pdos: heapless::Vec<PowerDataObject, MAX_EPR_PDOS> = heapless::Vec::new();
        pdos.push(PowerDataObject::FixedSupply(
            FixedSupply::new().with_raw_voltage(100).with_raw_max_current(300),
        ))
        .unwrap();
        let caps = SourceCapabilities(pdos);

        let header = Header::new_data(
            template(),
            Counter::new_from_value(CounterType::MessageId, 0),
            DataMessageType::Request,
            1,
        );

        let mut buf = [0u8; 6];
        header.to_bytes(&mut buf);
        // Object position zero is reserved and must not resolve to a PDO.
        buf[2..6].copy_from_slice(&0u32.to_le_bytes());

        let parsed = Message::parse_with_state(&buf, &caps).unwrap();
        assert!(matches!(
            parsed.payload,
            Some(Payload::Data(data::Data::Request(PowerSource::Unknown(_))))
        ));
    }
}
