//! Tokio codec for framing [`Packet`]s over byte streams.
//!
//! Encoding writes one frame per packet. Decoding drains the read buffer into a
//! [`FrameAssembler`], so partially received frames are held by the codec rather
//! than left in the buffer.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::packet::Packet;
use crate::core::reassembly::FrameAssembler;
use crate::error::{NetError, Result};

#[derive(Debug, Default)]
pub struct PacketCodec {
    assembler: FrameAssembler,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        let (consumed, frame) = self.assembler.push(&src[..]);
        src.advance(consumed);
        frame.transpose()
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = NetError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        item.write_to(dst)
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = NetError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<()> {
        item.write_to(dst)
    }
}
