//! # Packet
//!
//! The tagged envelope exchanged by every transport.
//!
//! ## Wire Format (little-endian)
//! ```text
//! [FrameLength(2)] [TagLength(1)] [Kind(1)] [Tag(TagLength)] [Payload(N)]
//! ```
//! `FrameLength` counts every byte after itself. A packet never exceeds
//! [`MAX_PACKET_SIZE`] bytes on the wire, length prefix included.
//!
//! A zero-length payload is the "absent" marker: it decodes to `None`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{constants, NetError, Result};

/// Size of the frame length prefix
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Tag length byte plus kind byte
pub const BODY_HEADER_SIZE: usize = 2;

/// Full fixed header size
pub const HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + BODY_HEADER_SIZE;

/// Largest packet on the wire, length prefix included
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// Largest body (everything after the length prefix)
pub const MAX_BODY_SIZE: usize = MAX_PACKET_SIZE - LENGTH_PREFIX_SIZE;

/// Largest tag in bytes
pub const MAX_TAG_LEN: usize = u8::MAX as usize;

/// Routing class of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Send = 0,
    Request = 1,
    Response = 2,
}

impl PacketKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PacketKind::Send),
            1 => Some(PacketKind::Request),
            2 => Some(PacketKind::Response),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Send => "send",
            PacketKind::Request => "request",
            PacketKind::Response => "response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub tag: String,
    pub payload: Option<Bytes>,
}

impl Packet {
    /// Build a packet; an empty payload is normalized to `None`.
    pub fn new(kind: PacketKind, tag: impl Into<String>, payload: Option<Bytes>) -> Self {
        Self {
            kind,
            tag: tag.into(),
            payload: payload.filter(|p| !p.is_empty()),
        }
    }

    pub fn send(tag: impl Into<String>, payload: Option<Bytes>) -> Self {
        Self::new(PacketKind::Send, tag, payload)
    }

    pub fn request(tag: impl Into<String>, payload: Option<Bytes>) -> Self {
        Self::new(PacketKind::Request, tag, payload)
    }

    pub fn response(tag: impl Into<String>, payload: Option<Bytes>) -> Self {
        Self::new(PacketKind::Response, tag, payload)
    }

    /// Payload bytes, empty when absent
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }

    /// Encoded size including the length prefix
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.tag.len() + self.payload_bytes().len()
    }

    /// Check the tag and total size limits
    pub fn validate(&self) -> Result<()> {
        if self.tag.len() > MAX_TAG_LEN {
            return Err(NetError::TagTooLong(self.tag.len()));
        }
        let len = self.encoded_len();
        if len > MAX_PACKET_SIZE {
            return Err(NetError::OversizedPacket(len));
        }
        Ok(())
    }

    /// Append the encoded frame to `dst`
    pub fn write_to(&self, dst: &mut BytesMut) -> Result<()> {
        self.validate()?;
        let payload = self.payload_bytes();
        let frame_len = self.encoded_len() - LENGTH_PREFIX_SIZE;

        dst.reserve(LENGTH_PREFIX_SIZE + frame_len);
        dst.put_u16_le(frame_len as u16);
        dst.put_u8(self.tag.len() as u8);
        dst.put_u8(self.kind.as_byte());
        dst.put_slice(self.tag.as_bytes());
        dst.put_slice(payload);
        Ok(())
    }

    /// Encode to a standalone frame
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one complete frame, length prefix included.
    ///
    /// The length field must account for exactly the remaining bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(NetError::MalformedFrame(
                constants::ERR_TRUNCATED_HEADER.to_string(),
            ));
        }
        let frame_len = u16::from_le_bytes([data[0], data[1]]) as usize;
        let body = &data[LENGTH_PREFIX_SIZE..];
        if frame_len != body.len() {
            return Err(NetError::MalformedFrame(format!(
                "{}: header says {frame_len}, got {}",
                constants::ERR_LENGTH_MISMATCH,
                body.len()
            )));
        }
        Self::from_body(body)
    }

    /// Decode the part of a frame that follows the length prefix
    pub fn from_body(body: &[u8]) -> Result<Self> {
        if body.len() > MAX_BODY_SIZE {
            return Err(NetError::OversizedPacket(body.len() + LENGTH_PREFIX_SIZE));
        }
        if body.len() < BODY_HEADER_SIZE {
            return Err(NetError::MalformedFrame(
                constants::ERR_TRUNCATED_HEADER.to_string(),
            ));
        }

        let tag_len = body[0] as usize;
        let kind = PacketKind::from_byte(body[1])
            .ok_or_else(|| NetError::MalformedFrame(format!("Unknown packet kind {}", body[1])))?;

        let rest = &body[BODY_HEADER_SIZE..];
        if tag_len > rest.len() {
            return Err(NetError::MalformedFrame(format!(
                "{}: tag length {tag_len}, {} bytes left",
                constants::ERR_TAG_OVERRUN,
                rest.len()
            )));
        }

        let (tag, payload) = rest.split_at(tag_len);
        let tag = std::str::from_utf8(tag)
            .map_err(|_| NetError::MalformedFrame(constants::ERR_TAG_NOT_UTF8.to_string()))?;

        let payload = if payload.is_empty() {
            None
        } else {
            Some(Bytes::copy_from_slice(payload))
        };

        Ok(Self {
            kind,
            tag: tag.to_string(),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_little_endian_with_tag_then_payload() {
        let packet = Packet::request("echo", Some(Bytes::from_static(b"hi")));
        let bytes = packet.to_bytes().unwrap();

        // 1 (tag len) + 1 (kind) + 4 (tag) + 2 (payload)
        assert_eq!(&bytes[..2], &8u16.to_le_bytes());
        assert_eq!(bytes[2], 4);
        assert_eq!(bytes[3], PacketKind::Request.as_byte());
        assert_eq!(&bytes[4..8], b"echo");
        assert_eq!(&bytes[8..], b"hi");
    }

    #[test]
    fn empty_payload_is_absent() {
        let packet = Packet::send("ping", Some(Bytes::new()));
        assert_eq!(packet.payload, None);

        let decoded = Packet::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.encoded_len(), HEADER_SIZE + 4);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = Packet::send("a", None).to_bytes().unwrap().to_vec();
        bytes[3] = 9;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(NetError::MalformedFrame(_))
        ));
    }

    #[test]
    fn tag_overrun_is_rejected() {
        // frame length 3, tag length 5, only one tag byte present
        let bytes = [3u8, 0, 5, 0, b'x'];
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(NetError::MalformedFrame(_))
        ));
    }

    #[test]
    fn non_utf8_tag_is_rejected() {
        let bytes = [4u8, 0, 2, 0, 0xC3, 0x28];
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(NetError::MalformedFrame(_))
        ));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut bytes = Packet::send("tag", Some(Bytes::from_static(b"abc")))
            .to_bytes()
            .unwrap()
            .to_vec();
        bytes.pop();
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(NetError::MalformedFrame(_))
        ));
    }

    #[test]
    fn limits_are_enforced_on_encode() {
        let long_tag = "t".repeat(MAX_TAG_LEN + 1);
        assert!(matches!(
            Packet::send(long_tag, None).to_bytes(),
            Err(NetError::TagTooLong(256))
        ));

        let max_payload = MAX_PACKET_SIZE - HEADER_SIZE - 1;
        let fits = Packet::send("x", Some(Bytes::from(vec![7u8; max_payload])));
        assert_eq!(fits.to_bytes().unwrap().len(), MAX_PACKET_SIZE);

        let too_big = Packet::send("x", Some(Bytes::from(vec![7u8; max_payload + 1])));
        assert!(matches!(
            too_big.to_bytes(),
            Err(NetError::OversizedPacket(65536))
        ));
    }
}
