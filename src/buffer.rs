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

//! Session byte buffer with a prependable prefix.
//!
//! The buffer is a contiguous region split at two cursors `r <= w <= cap`:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0        <=         r        <=        w        <=       cap
//! ```
//!
//! `r` starts at [`PREPEND_RESERVE`] so that a short header can later be
//! prepended in front of already-written content without copying it.

use std::io::{IoSliceMut, Read, Result};

use memchr::{memchr, memchr_iter};

/// Bytes reserved in front of the readable region for cheap prepending.
pub const PREPEND_RESERVE: usize = 8;

/// Default readable/writable capacity of a fresh buffer.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack scratch area used by [`Buffer::fill_from`].
const SCRATCH_LEN: usize = 64 * 1024;

/// A growable byte buffer with separate read and write cursors and a
/// prependable prefix.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    r: usize,
    w: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    /// Creates a buffer with the default capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer able to hold `capacity` readable bytes before growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; PREPEND_RESERVE + capacity],
            r: PREPEND_RESERVE,
            w: PREPEND_RESERVE,
        }
    }

    /// Number of bytes available for reading.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.w - self.r
    }

    /// Number of bytes that can be written before the buffer grows.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.w
    }

    /// Number of bytes in front of the readable region.
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.r
    }

    /// Total size of the backing storage.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Readable content, without consuming it.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.r..self.w]
    }

    /// Offset of the first `\r\n` within the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        let readable = self.peek();
        memchr_iter(b'\r', readable).find(|&pos| readable.get(pos + 1) == Some(&b'\n'))
    }

    /// Offset of the first `\n` within the readable region.
    pub fn find_eol(&self) -> Option<usize> {
        memchr(b'\n', self.peek())
    }

    /// Advances the read cursor by `n` bytes.
    ///
    /// Consuming everything resets both cursors to the prepend reserve.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.r += n;
        } else {
            self.consume_all();
        }
    }

    /// Discards the whole readable region and resets the prepend reserve.
    pub fn consume_all(&mut self) {
        self.r = PREPEND_RESERVE;
        self.w = PREPEND_RESERVE;
    }

    /// Consumes readable bytes up to (excluding) `offset`.
    pub fn consume_until(&mut self, offset: usize) {
        self.consume(offset);
    }

    /// Removes and returns the first `n` readable bytes.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        debug_assert!(n <= self.readable_bytes());
        let out = self.data[self.r..self.r + n].to_vec();
        self.consume(n);
        out
    }

    /// Removes and returns the entire readable region.
    pub fn take_all(&mut self) -> Vec<u8> {
        self.take(self.readable_bytes())
    }

    /// Removes the first `n` readable bytes as a string, replacing invalid
    /// UTF-8 sequences.
    pub fn take_string(&mut self, n: usize) -> String {
        String::from_utf8_lossy(&self.take(n)).into_owned()
    }

    /// Removes the entire readable region as a string.
    pub fn take_all_string(&mut self) -> String {
        self.take_string(self.readable_bytes())
    }

    /// Appends bytes at the write cursor, growing the buffer if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.w..self.w + data.len()].copy_from_slice(data);
        self.w += data.len();
    }

    /// Rolls back the last `n` written bytes.
    pub fn unwrite(&mut self, n: usize) {
        debug_assert!(n <= self.readable_bytes());
        self.w -= n;
    }

    /// Inserts bytes in front of the readable region.
    ///
    /// The prepend area must be large enough; callers are expected to stay
    /// within [`PREPEND_RESERVE`] minus what they already prepended.
    pub fn prepend(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.prependable_bytes());
        self.r -= data.len();
        self.data[self.r..self.r + data.len()].copy_from_slice(data);
    }

    /// Appends a `u8`.
    pub fn append_u8(&mut self, x: u8) {
        self.append(&[x]);
    }

    /// Appends a `u16` in big-endian byte order.
    pub fn append_u16(&mut self, x: u16) {
        self.append(&x.to_be_bytes());
    }

    /// Appends a `u32` in big-endian byte order.
    pub fn append_u32(&mut self, x: u32) {
        self.append(&x.to_be_bytes());
    }

    /// Appends a `u64` in big-endian byte order.
    pub fn append_u64(&mut self, x: u64) {
        self.append(&x.to_be_bytes());
    }

    /// Prepends a `u16` in big-endian byte order.
    pub fn prepend_u16(&mut self, x: u16) {
        self.prepend(&x.to_be_bytes());
    }

    /// Prepends a `u32` in big-endian byte order.
    pub fn prepend_u32(&mut self, x: u32) {
        self.prepend(&x.to_be_bytes());
    }

    /// Prepends a `u64` in big-endian byte order.
    pub fn prepend_u64(&mut self, x: u64) {
        self.prepend(&x.to_be_bytes());
    }

    /// Reads a big-endian `u8` without consuming it.
    ///
    /// Requires `readable_bytes() >= 1`.
    pub fn peek_u8(&self) -> u8 {
        debug_assert!(self.readable_bytes() >= 1);
        self.peek()[0]
    }

    /// Reads a big-endian `u16` without consuming it.
    ///
    /// Requires `readable_bytes() >= 2`.
    pub fn peek_u16(&self) -> u16 {
        debug_assert!(self.readable_bytes() >= 2);
        u16::from_be_bytes(self.peek()[..2].try_into().expect("checked width"))
    }

    /// Reads a big-endian `u32` without consuming it.
    ///
    /// Requires `readable_bytes() >= 4`.
    pub fn peek_u32(&self) -> u32 {
        debug_assert!(self.readable_bytes() >= 4);
        u32::from_be_bytes(self.peek()[..4].try_into().expect("checked width"))
    }

    /// Reads a big-endian `u64` without consuming it.
    ///
    /// Requires `readable_bytes() >= 8`.
    pub fn peek_u64(&self) -> u64 {
        debug_assert!(self.readable_bytes() >= 8);
        u64::from_be_bytes(self.peek()[..8].try_into().expect("checked width"))
    }

    /// Reads and consumes a big-endian `u8`.
    pub fn read_u8(&mut self) -> u8 {
        let x = self.peek_u8();
        self.consume(1);
        x
    }

    /// Reads and consumes a big-endian `u16`.
    pub fn read_u16(&mut self) -> u16 {
        let x = self.peek_u16();
        self.consume(2);
        x
    }

    /// Reads and consumes a big-endian `u32`.
    pub fn read_u32(&mut self) -> u32 {
        let x = self.peek_u32();
        self.consume(4);
        x
    }

    /// Reads and consumes a big-endian `u64`.
    pub fn read_u64(&mut self) -> u64 {
        let x = self.peek_u64();
        self.consume(8);
        x
    }

    /// Shrinks the backing storage to the readable content plus `reserve`.
    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.take_all();
        self.data = vec![0; PREPEND_RESERVE + readable.len() + reserve];
        self.r = PREPEND_RESERVE;
        self.w = PREPEND_RESERVE;
        self.append(&readable);
    }

    /// Fills the buffer from `reader` with a single vectored read.
    ///
    /// The read targets the writable tail chained with a 64 KiB stack scratch
    /// area, so one syscall serves both the common case and bursts larger
    /// than the current tail. Scratch overflow is appended afterwards,
    /// growing the buffer. Returns the total number of bytes read; `Ok(0)`
    /// means end of stream.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> Result<usize> {
        let mut scratch = [0u8; SCRATCH_LEN];
        let writable = self.writable_bytes();
        let w = self.w;

        let n = {
            let (_, tail) = self.data.split_at_mut(w);
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut scratch)];
            reader.read_vectored(&mut iov)?
        };

        if n <= writable {
            self.w += n;
        } else {
            self.w = self.data.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Makes room for `len` more writable bytes.
    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Either compacts readable content back against the prepend reserve, or
    /// resizes the backing storage. Compaction is preferred whenever the
    /// reclaimable prepend slack plus the tail can hold the request.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + PREPEND_RESERVE {
            let grown = (self.data.len() * 2).max(self.w + len);
            self.data.resize(grown, 0);
        } else {
            let readable = self.readable_bytes();
            self.data.copy_within(self.r..self.w, PREPEND_RESERVE);
            self.r = PREPEND_RESERVE;
            self.w = self.r + readable;
            debug_assert_eq!(readable, self.readable_bytes());
        }
    }
}
