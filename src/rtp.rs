// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP datagram handling as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1),
//! plus the fixed-size buffer pool that backs received packets.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use crossbeam::queue::SegQueue;

use crate::{Error, ErrorInt};

/// Largest datagram the server accepts. Buffers in the pool all have this
/// capacity.
pub const MAX_PACKET_SIZE: usize = 1600;

/// The fixed RTP header length (no CSRCs, no extension).
const MIN_HEADER_LEN: usize = 12;

/// Free list of receive buffers.
///
/// Buffers are taken by the server's read loop and returned by the session
/// that finished running a packet through its stage chain, so the hot path
/// allocates only while the flow count is still growing.
pub(crate) struct BufferPool {
    free: SegQueue<BytesMut>,
    allocated: AtomicUsize,
}

impl BufferPool {
    pub(crate) fn new() -> Self {
        Self {
            free: SegQueue::new(),
            allocated: AtomicUsize::new(0),
        }
    }

    pub(crate) fn take(&self) -> BytesMut {
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(MAX_PACKET_SIZE)
            }
        }
    }

    pub(crate) fn put(&self, buf: BytesMut) {
        self.free.push(buf);
    }

    /// Buffers handed out since construction.
    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Buffers currently sitting in the free list.
    pub(crate) fn idle(&self) -> usize {
        self.free.len()
    }
}

/// A parsed RTP packet backed by a pooled receive buffer.
///
/// Validation happens once in [`Packet::parse`]; header accessors read the
/// raw buffer afterwards. The payload is a subrange of the buffer until a
/// stage swaps it out with [`Packet::set_payload`]; either way the buffer
/// stays with the packet so the session can recycle it.
pub struct Packet {
    /// Full datagram, including the RTP header.
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           timestamp                           |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |           synchronization source (SSRC) identifier            |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// |            contributing source (CSRC) identifiers             |
    /// |                             ....                              |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    data: BytesMut,
    payload: Payload,
}

enum Payload {
    /// `start..end` within `data`. Header-extension and padding bytes, when
    /// flagged, are left inside the range; downstream payload formats here
    /// do not use either.
    Within { start: u16, end: u16 },

    /// Replaced by a stage (FU-A reassembly, PS splitting).
    Replaced(Bytes),
}

/// Parse failure that hands the input buffer back for recycling.
pub struct PacketParseError {
    error: Error,
    data: BytesMut,
}

impl PacketParseError {
    fn new(error: Error, data: BytesMut) -> Self {
        Self { error, data }
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn into_parts(self) -> (Error, BytesMut) {
        (self.error, self.data)
    }
}

impl std::fmt::Debug for PacketParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}\n{:?}",
            self.error,
            crate::hex::LimitedHex::new(&self.data, 64)
        )
    }
}

impl Packet {
    /// Validates one datagram.
    ///
    /// The first 32 bits are `version`, `padding`, `extension`,
    /// `csrc_count`, `marker`, `payload_type`, and `sequence_number`;
    /// then a 32-bit timestamp, a 32-bit SSRC, and `csrc_count` 32-bit
    /// CSRC entries. Everything after that is payload. All multi-byte
    /// fields are big-endian.
    pub fn parse(data: BytesMut) -> Result<Self, PacketParseError> {
        if data.len() < MIN_HEADER_LEN {
            return Err(PacketParseError::new(
                wrap!(ErrorInt::Malformed {
                    reason: "shorter than the 12-byte fixed header",
                }),
                data,
            ));
        }
        let version = data[0] >> 6;
        if version != 2 {
            return Err(PacketParseError::new(
                wrap!(ErrorInt::ProtocolViolation { version }),
                data,
            ));
        }
        let csrc_count = usize::from(data[0] & 0b0000_1111);
        let payload_start = MIN_HEADER_LEN + 4 * csrc_count;
        if data.len() < payload_start {
            return Err(PacketParseError::new(
                wrap!(ErrorInt::Malformed {
                    reason: "truncated CSRC list",
                }),
                data,
            ));
        }
        let start = payload_start as u16;
        let end = data.len() as u16;
        Ok(Self {
            data,
            payload: Payload::Within { start, end },
        })
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.data[0] >> 6
    }

    #[inline]
    pub fn padding(&self) -> bool {
        (self.data[0] & 0b0010_0000) != 0
    }

    #[inline]
    pub fn extension(&self) -> bool {
        (self.data[0] & 0b0001_0000) != 0
    }

    #[inline]
    pub fn mark(&self) -> bool {
        (self.data[1] & 0b1000_0000) != 0
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.data[1] & 0b0111_1111
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    /// The contributing sources, 0–15 entries.
    pub fn csrcs(&self) -> impl Iterator<Item = u32> + '_ {
        let count = usize::from(self.data[0] & 0b0000_1111);
        self.data[MIN_HEADER_LEN..MIN_HEADER_LEN + 4 * count]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        match &self.payload {
            Payload::Within { start, end } => &self.data[usize::from(*start)..usize::from(*end)],
            Payload::Replaced(b) => &b[..],
        }
    }

    /// Swaps the payload view for bytes produced by a stage.
    ///
    /// Downstream stages must not retain the payload across calls; the
    /// container is reused for subsequent forwards.
    #[inline]
    pub fn set_payload(&mut self, payload: Bytes) {
        self.payload = Payload::Replaced(payload);
    }

    /// Recovers the backing buffer for the pool.
    pub(crate) fn into_buffer(self) -> BytesMut {
        self.data
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("ssrc", &self.ssrc())
            .field("sequence_number", &self.sequence_number())
            .field("timestamp", &self.timestamp())
            .field("mark", &self.mark())
            .field("payload_type", &self.payload_type())
            .field(
                "payload",
                &crate::hex::LimitedHex::new(self.payload(), 64),
            )
            .finish()
    }
}

/// Builds packets for tests and benchmarks.
#[doc(hidden)]
pub struct PacketBuilder {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload_type: u8,
    pub mark: bool,
}

impl PacketBuilder {
    pub fn build<P: IntoIterator<Item = u8>>(self, payload: P) -> Result<Packet, &'static str> {
        if self.payload_type >= 0x80 {
            return Err("payload type too large");
        }
        let mut data = BytesMut::with_capacity(MAX_PACKET_SIZE);
        data.extend_from_slice(&[
            2 << 6, // version=2, no padding, no extensions, no CSRCs.
            if self.mark { 0b1000_0000 } else { 0 } | self.payload_type,
        ]);
        data.extend_from_slice(&self.sequence_number.to_be_bytes());
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        data.extend_from_slice(&self.ssrc.to_be_bytes());
        data.extend(payload);
        if data.len() > MAX_PACKET_SIZE {
            return Err("payload too long");
        }
        Packet::parse(data).map_err(|_| "built packet failed to parse")
    }
}
