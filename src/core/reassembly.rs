//! # Stream Reassembly
//!
//! Rebuilds frame boundaries from an arbitrary byte stream. A single socket read can
//! end inside the length prefix, contain several complete frames, or stop halfway
//! through a body; the assembler keeps its position across calls so the caller can
//! hand it whatever the socket produced.
//!
//! ```rust
//! use tagwire::core::packet::Packet;
//! use tagwire::core::reassembly::FrameAssembler;
//!
//! let frame = Packet::send("move", None).to_bytes().unwrap();
//! let mut assembler = FrameAssembler::new();
//!
//! assert!(assembler.feed(&frame[..3]).is_empty());
//! let packets = assembler.feed(&frame[3..]);
//! assert_eq!(packets.len(), 1);
//! ```

use crate::core::packet::{Packet, LENGTH_PREFIX_SIZE};
use crate::error::{NetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    AwaitingLength,
    AwaitingBody,
}

/// Incremental frame decoder state for one stream session
#[derive(Debug)]
pub struct FrameAssembler {
    mode: Mode,
    length_buf: [u8; LENGTH_PREFIX_SIZE],
    length_filled: usize,
    body: Vec<u8>,
    body_written: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            mode: Mode::AwaitingLength,
            length_buf: [0; LENGTH_PREFIX_SIZE],
            length_filled: 0,
            body: Vec::new(),
            body_written: 0,
        }
    }

    /// Consume bytes from `input` until one frame completes or the input runs out.
    ///
    /// Returns the number of bytes consumed and the completed frame, if any. A
    /// malformed frame still consumes exactly its declared length so the stream stays
    /// aligned on the next frame.
    pub fn push(&mut self, input: &[u8]) -> (usize, Option<Result<Packet>>) {
        let mut consumed = 0;

        while consumed < input.len() {
            let available = &input[consumed..];
            match self.mode {
                Mode::AwaitingLength => {
                    let take = (LENGTH_PREFIX_SIZE - self.length_filled).min(available.len());
                    self.length_buf[self.length_filled..self.length_filled + take]
                        .copy_from_slice(&available[..take]);
                    self.length_filled += take;
                    consumed += take;

                    if self.length_filled < LENGTH_PREFIX_SIZE {
                        continue;
                    }

                    self.length_filled = 0;
                    let frame_len = u16::from_le_bytes(self.length_buf) as usize;
                    if frame_len == 0 {
                        return (
                            consumed,
                            Some(Err(NetError::MalformedFrame(
                                "Zero-length frame".to_string(),
                            ))),
                        );
                    }

                    self.body.clear();
                    self.body.resize(frame_len, 0);
                    self.body_written = 0;
                    self.mode = Mode::AwaitingBody;
                }
                Mode::AwaitingBody => {
                    let take = (self.body.len() - self.body_written).min(available.len());
                    self.body[self.body_written..self.body_written + take]
                        .copy_from_slice(&available[..take]);
                    self.body_written += take;
                    consumed += take;

                    if self.body_written == self.body.len() {
                        self.mode = Mode::AwaitingLength;
                        return (consumed, Some(Packet::from_body(&self.body)));
                    }
                }
            }
        }

        (consumed, None)
    }

    /// Consume all of `input`, returning every frame it completed in order.
    pub fn feed(&mut self, mut input: &[u8]) -> Vec<Result<Packet>> {
        let mut frames = Vec::new();
        while !input.is_empty() {
            let (consumed, frame) = self.push(input);
            input = &input[consumed..];
            if let Some(frame) = frame {
                frames.push(frame);
            }
        }
        frames
    }

    /// True when no partial frame is buffered
    pub fn is_idle(&self) -> bool {
        self.mode == Mode::AwaitingLength && self.length_filled == 0
    }

    /// Bytes of the current partial frame held so far
    pub fn buffered(&self) -> usize {
        match self.mode {
            Mode::AwaitingLength => self.length_filled,
            Mode::AwaitingBody => LENGTH_PREFIX_SIZE + self.body_written,
        }
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.mode = Mode::AwaitingLength;
        self.length_filled = 0;
        self.body.clear();
        self.body_written = 0;
    }
}
