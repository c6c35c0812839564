//! # Payload Serialization
//!
//! Payload bytes are opaque to the packet codec; this module turns application values
//! into those bytes and back. Bincode is the default, JSON is handy for debugging and
//! interop, MessagePack is a compact self-describing alternative.
//!
//! Every client and server owns a [`Serializer`] whose format can be swapped at
//! runtime; registered typed handlers always decode with the current format.
//!
//! ## Usage
//! ```rust
//! use tagwire::core::serialization::{SerializationFormat, Serializer};
//!
//! let serializer = Serializer::new(SerializationFormat::Json);
//! let bytes = serializer.encode(&vec![1u32, 2, 3]).unwrap();
//! assert_eq!(&bytes[..], b"[1,2,3]");
//!
//! serializer.set_format(SerializationFormat::Bincode);
//! assert_eq!(serializer.format(), SerializationFormat::Bincode);
//! ```

use std::any::type_name;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{NetError, Result};

/// Supported payload formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationFormat {
    /// Binary compact format (default, fastest)
    #[default]
    Bincode,
    /// Human-readable JSON format (debugging, interop)
    Json,
    /// Compact binary format (MessagePack)
    MessagePack,
}

impl SerializationFormat {
    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }

    /// Serialize a value with this format
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        let encoded = match self {
            SerializationFormat::Bincode => bincode::serialize(value).map_err(|e| e.to_string()),
            SerializationFormat::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            SerializationFormat::MessagePack => {
                rmp_serde::to_vec(value).map_err(|e| e.to_string())
            }
        };

        encoded
            .map(Bytes::from)
            .map_err(|reason| NetError::Serialization {
                type_name: type_name::<T>(),
                reason,
                bytes: None,
            })
    }

    /// Deserialize a value with this format
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        let decoded = match self {
            SerializationFormat::Bincode => bincode::deserialize(data).map_err(|e| e.to_string()),
            SerializationFormat::Json => serde_json::from_slice(data).map_err(|e| e.to_string()),
            SerializationFormat::MessagePack => {
                rmp_serde::from_slice(data).map_err(|e| e.to_string())
            }
        };

        decoded.map_err(|reason| NetError::Serialization {
            type_name: type_name::<T>(),
            reason,
            bytes: Some(data.to_vec()),
        })
    }
}

/// Shared, runtime-swappable payload codec handle
#[derive(Debug, Clone, Default)]
pub struct Serializer {
    format: Arc<RwLock<SerializationFormat>>,
}

impl Serializer {
    pub fn new(format: SerializationFormat) -> Self {
        Self {
            format: Arc::new(RwLock::new(format)),
        }
    }

    /// Current format
    pub fn format(&self) -> SerializationFormat {
        // The guarded value is Copy, so a poisoned lock still holds a valid format.
        match self.format.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Swap the format for every later encode/decode
    pub fn set_format(&self, format: SerializationFormat) {
        match self.format.write() {
            Ok(mut guard) => *guard = format,
            Err(poisoned) => *poisoned.into_inner() = format,
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        self.format().encode(value)
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        self.format().decode(data)
    }

    /// Encode an optional value; `None` stays absent.
    ///
    /// The wire has no marker for an empty payload, so a `Some` whose encoding is
    /// zero bytes (`()` or an empty struct under Bincode) is refused rather than
    /// arriving as `None`.
    pub fn encode_optional<T: Serialize + ?Sized>(&self, value: Option<&T>) -> Result<Option<Bytes>> {
        let Some(value) = value else {
            return Ok(None);
        };
        let bytes = self.encode(value)?;
        if bytes.is_empty() {
            return Err(NetError::Serialization {
                type_name: type_name::<T>(),
                reason: "encodes to zero bytes, indistinguishable from an absent payload".to_string(),
                bytes: None,
            });
        }
        Ok(Some(bytes))
    }

    /// Decode an optional payload; an absent payload decodes to `None`
    pub fn decode_optional<T: DeserializeOwned>(&self, data: Option<&Bytes>) -> Result<Option<T>> {
        data.map(|bytes| self.decode(bytes)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Position {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_format_names() {
        assert_eq!(SerializationFormat::Bincode.name(), "Bincode");
        assert_eq!(SerializationFormat::Json.name(), "JSON");
        assert_eq!(SerializationFormat::MessagePack.name(), "MessagePack");
    }

    #[test]
    fn test_default_format() {
        assert_eq!(SerializationFormat::default(), SerializationFormat::Bincode);
        assert_eq!(Serializer::default().format(), SerializationFormat::Bincode);
    }

    #[test]
    fn every_format_decodes_what_it_encodes() {
        let value = Position { x: -4, y: 17 };
        for format in [
            SerializationFormat::Bincode,
            SerializationFormat::Json,
            SerializationFormat::MessagePack,
        ] {
            let bytes = format.encode(&value).unwrap();
            let back: Position = format.decode(&bytes).unwrap();
            assert_eq!(back, value, "format {}", format.name());
        }
    }

    #[test]
    fn decode_failure_carries_bytes_and_type() {
        let err = SerializationFormat::Json
            .decode::<Position>(b"not json")
            .unwrap_err();
        match err {
            NetError::Serialization {
                type_name, bytes, ..
            } => {
                assert!(type_name.ends_with("Position"));
                assert_eq!(bytes.as_deref(), Some(&b"not json"[..]));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn swapping_format_is_visible_to_clones() {
        let serializer = Serializer::default();
        let clone = serializer.clone();
        serializer.set_format(SerializationFormat::Json);
        assert_eq!(clone.format(), SerializationFormat::Json);
        assert_eq!(&clone.encode(&5u8).unwrap()[..], b"5");
    }

    #[test]
    fn optional_payloads() {
        let serializer = Serializer::default();
        assert_eq!(serializer.encode_optional::<u32>(None).unwrap(), None);
        assert_eq!(serializer.decode_optional::<u32>(None).unwrap(), None);

        let bytes = serializer.encode_optional(Some(&7u32)).unwrap();
        assert_eq!(
            serializer.decode_optional::<u32>(bytes.as_ref()).unwrap(),
            Some(7)
        );
    }

    #[test]
    fn zero_byte_values_are_refused() {
        let serializer = Serializer::default();
        let result = serializer.encode_optional(Some(&()));
        assert!(matches!(result, Err(NetError::Serialization { .. })));

        // JSON spells unit as `null`, which survives the trip
        serializer.set_format(SerializationFormat::Json);
        let bytes = serializer.encode_optional(Some(&())).unwrap();
        assert_eq!(bytes.as_deref(), Some(&b"null"[..]));
    }
}
