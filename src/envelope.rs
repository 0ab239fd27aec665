//! The unit exchanged between peers.
//!
//! ```text
//! [classification: u8]
//! [correlation_id: u64 LE]          (absent for EVENT)
//! [protocol_id: u64 LE] [function_id or feed_id: u64 LE]
//! [payload]
//! ```
//!
//! Header fields are raw, untagged integers. The payload is whatever the
//! classification calls for, always in the tagged wire format.

use crate::codec::{DecodeError, WireReader};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Classification {
    FunctionCall = 1,
    Result = 2,
    Error = 3,
    Subscribe = 4,
    Unsubscribe = 5,
    Event = 6,
}

impl Classification {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Classification::FunctionCall,
            2 => Classification::Result,
            3 => Classification::Error,
            4 => Classification::Subscribe,
            5 => Classification::Unsubscribe,
            6 => Classification::Event,
            _ => return None,
        })
    }

    fn has_correlation_id(self) -> bool {
        self != Classification::Event
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub classification: Classification,
    /// Zero for events and for messages that expect no reply.
    pub correlation_id: u64,
    pub protocol_id: u64,
    /// Function id for calls, feed id for subscriptions and events.
    pub member_id: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("unknown message classification {classification:#04x}")]
    UnknownClassification {
        classification: u8,
        correlation_id: Option<u64>,
    },

    #[error("malformed envelope header: {0}")]
    Header(#[from] DecodeError),
}

impl EnvelopeError {
    /// Correlation id recovered from a rejected envelope, if any.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            EnvelopeError::UnknownClassification { correlation_id, .. } => *correlation_id,
            EnvelopeError::Header(_) => None,
        }
    }
}

impl Envelope {
    pub fn new(
        classification: Classification,
        correlation_id: u64,
        protocol_id: u64,
        member_id: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            classification,
            correlation_id,
            protocol_id,
            member_id,
            payload,
        }
    }

    pub fn call(correlation_id: u64, protocol_id: u64, function_id: u64, args: Bytes) -> Self {
        Self::new(
            Classification::FunctionCall,
            correlation_id,
            protocol_id,
            function_id,
            args,
        )
    }

    pub fn event(protocol_id: u64, feed_id: u64, payload: Bytes) -> Self {
        Self::new(Classification::Event, 0, protocol_id, feed_id, payload)
    }

    fn header_len(&self) -> usize {
        let correlation = if self.classification.has_correlation_id() {
            8
        } else {
            0
        };
        1 + correlation + 16
    }

    pub fn encoded_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.classification as u8);
        if self.classification.has_correlation_id() {
            buf.put_u64_le(self.correlation_id);
        }
        buf.put_u64_le(self.protocol_id);
        buf.put_u64_le(self.member_id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parses a frame. The payload is a zero-copy slice of `frame`.
    pub fn decode(frame: Bytes) -> Result<Self, EnvelopeError> {
        let mut reader = WireReader::new(&frame);
        let raw = reader.read_u8()?;
        let Some(classification) = Classification::from_u8(raw) else {
            return Err(EnvelopeError::UnknownClassification {
                classification: raw,
                correlation_id: reader.read_u64().ok(),
            });
        };
        let correlation_id = if classification.has_correlation_id() {
            reader.read_u64()?
        } else {
            0
        };
        let protocol_id = reader.read_u64()?;
        let member_id = reader.read_u64()?;
        let payload = frame.slice(reader.position()..);
        Ok(Self {
            classification,
            correlation_id,
            protocol_id,
            member_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_args, encode_to_bytes};
    use rstest::rstest;

    #[rstest]
    #[case(Classification::FunctionCall)]
    #[case(Classification::Result)]
    #[case(Classification::Error)]
    #[case(Classification::Subscribe)]
    #[case(Classification::Unsubscribe)]
    fn header_keeps_correlation_id(#[case] classification: Classification) {
        let envelope = Envelope::new(classification, 17, 1, 42, encode_args(&(2i64, 3i64)));
        let back = Envelope::decode(envelope.to_bytes()).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn events_omit_the_correlation_id() {
        let envelope = Envelope::event(3, 9, encode_to_bytes(&"tick"));
        let bytes = envelope.to_bytes();
        assert_eq!(bytes.len(), 1 + 16 + envelope.payload.len());
        assert_eq!(Envelope::decode(bytes).unwrap(), envelope);
    }

    #[test]
    fn unknown_classification_keeps_correlation_id() {
        let mut raw = vec![0x7f];
        raw.extend_from_slice(&5u64.to_le_bytes());
        let err = Envelope::decode(Bytes::from(raw)).unwrap_err();
        assert_eq!(err.correlation_id(), Some(5));
        assert!(matches!(
            err,
            EnvelopeError::UnknownClassification {
                classification: 0x7f,
                ..
            }
        ));
    }

    #[test]
    fn short_header_is_rejected() {
        let err = Envelope::decode(Bytes::from_static(&[1, 0, 0])).unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::Header(DecodeError::BufferUnderrun { .. })
        ));
    }
}
