// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Length-prefixed message framing over the session buffer.
//!
//! Frames are a 4-byte big-endian payload length followed by the payload.
//! Encoding uses the buffer's prepend reserve, so the header costs no copy
//! of the payload; decoding peeks the length and waits until the whole
//! frame is buffered.

use std::sync::Arc;

use thiserror::Error;

use crate::buffer::Buffer;
use crate::server::TcpConnection;

const HEADER_LEN: usize = 4;

/// Default upper bound on one frame's payload.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

/// A frame that cannot be decoded; the connection should be closed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Declared payload length exceeds the configured bound.
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
}

/// Length-prefix codec with a configurable frame bound.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixCodec {
    max_frame: usize,
}

impl Default for LengthPrefixCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl LengthPrefixCodec {
    /// Creates a codec rejecting payloads larger than `max_frame`.
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Frames `payload` into `out` as header plus body.
    pub fn encode(&self, payload: &[u8], out: &mut Buffer) {
        out.append(payload);
        out.prepend_u32(payload.len() as u32);
    }

    /// Takes the next complete frame off `buf`.
    ///
    /// `Ok(None)` means more bytes are needed; the partial frame stays
    /// buffered. The header is only consumed together with its payload.
    pub fn decode(&self, buf: &mut Buffer) -> Result<Option<Vec<u8>>, FrameError> {
        if buf.readable_bytes() < HEADER_LEN {
            return Ok(None);
        }
        let len = buf.peek_u32() as usize;
        if len > self.max_frame {
            return Err(FrameError::TooLarge(len));
        }
        if buf.readable_bytes() < HEADER_LEN + len {
            return Ok(None);
        }
        buf.consume(HEADER_LEN);
        Ok(Some(buf.take(len)))
    }

    /// Frames and sends `payload` on `conn`.
    pub fn send(&self, conn: &Arc<TcpConnection>, payload: &[u8]) {
        let mut out = Buffer::new();
        self.encode(payload, &mut out);
        conn.send_buffer(&mut out);
    }
}

#[cfg(test)]
mod test {
    use crate::buffer::{Buffer, PREPEND_RESERVE};

    use super::{FrameError, LengthPrefixCodec};

    #[test]
    fn encode_uses_the_prepend_reserve() {
        let codec = LengthPrefixCodec::default();
        let mut out = Buffer::new();
        codec.encode(b"abc", &mut out);
        assert_eq!(PREPEND_RESERVE - 4, out.prependable_bytes());
        assert_eq!(&[0, 0, 0, 3, b'a', b'b', b'c'], out.peek());
    }

    #[test]
    fn decode_round_trips_consecutive_frames() {
        let codec = LengthPrefixCodec::default();
        let mut wire = Buffer::new();
        codec.encode(b"first", &mut wire);
        codec.encode(b"second", &mut wire);

        assert_eq!(Some(b"first".to_vec()), codec.decode(&mut wire).unwrap());
        assert_eq!(Some(b"second".to_vec()), codec.decode(&mut wire).unwrap());
        assert_eq!(None, codec.decode(&mut wire).unwrap());
    }

    #[test]
    fn partial_frames_wait_without_consuming() {
        let codec = LengthPrefixCodec::default();
        let mut wire = Buffer::new();
        let mut framed = Buffer::new();
        codec.encode(b"payload", &mut framed);
        let bytes = framed.take_all();

        for &b in &bytes[..bytes.len() - 1] {
            wire.append(&[b]);
            assert_eq!(None, codec.decode(&mut wire).unwrap());
        }
        wire.append(&bytes[bytes.len() - 1..]);
        assert_eq!(Some(b"payload".to_vec()), codec.decode(&mut wire).unwrap());
    }

    #[test]
    fn oversize_frames_are_rejected_before_buffering_the_body() {
        let codec = LengthPrefixCodec::new(8);
        let mut wire = Buffer::new();
        wire.append_u32(9);
        assert_eq!(Err(FrameError::TooLarge(9)), codec.decode(&mut wire));
        // The poisoned header is left for the caller, who closes.
        assert_eq!(4, wire.readable_bytes());
    }

    #[test]
    fn empty_payload_frames_are_valid() {
        let codec = LengthPrefixCodec::default();
        let mut wire = Buffer::new();
        codec.encode(b"", &mut wire);
        assert_eq!(Some(Vec::new()), codec.decode(&mut wire).unwrap());
    }
}
