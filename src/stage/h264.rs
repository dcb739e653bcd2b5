// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reassembly of fragmented H.264 NAL units as specified in
//! [RFC 6184 section 5.8](https://tools.ietf.org/html/rfc6184#section-5.8)
//! (FU-A fragmentation units).

use bytes::{BufMut, Bytes, BytesMut};
use log::warn;

use super::{forward, replace_next, wrong_item_kind, Stage, StageItem};
use crate::{Error, ErrorInt};

/// NAL unit type carried in the low five bits of the payload's first byte.
const NAL_TYPE_FU_A: u8 = 28;

/// Upper bound on buffered fragments; generous for any MTU/NAL-size ratio
/// seen in practice. Overflow discards the run.
const MAX_FRAGMENTS: usize = 100;

/// Reconstructs single NAL units from FU-A fragment runs.
///
/// Fragment payload bytes are copied out of the incoming packets (offset 2
/// onward), so no packet reference outlives its `process` call. A complete
/// run replaces the final packet's payload with the reassembled NAL before
/// forwarding; non-fragmented payload types pass through untouched.
pub struct FuaReassembler {
    next: Option<Box<dyn Stage>>,
    fragments: Vec<Bytes>,
    last_frag_seq: u16,
}

enum Verdict {
    Forward,
    Consumed,
}

impl FuaReassembler {
    pub fn new() -> Self {
        Self {
            next: None,
            fragments: Vec::with_capacity(MAX_FRAGMENTS),
            last_frag_seq: 0,
        }
    }

    fn push_fragment(&mut self, pkt: &mut crate::rtp::Packet) -> Verdict {
        let payload = pkt.payload();
        if payload.len() < 2 {
            warn!(
                "ssrc={:08x} seq={:04x}: FU-A payload too short for a fragment header",
                pkt.ssrc(),
                pkt.sequence_number()
            );
            self.fragments.clear();
            return Verdict::Consumed;
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let seq = pkt.sequence_number();

        if fu_header & 0b1000_0000 != 0 {
            // Start bit: any half-finished run is abandoned.
            self.fragments.clear();
        }

        if !self.fragments.is_empty() && self.last_frag_seq != seq.wrapping_sub(1) {
            let e: Error = wrap!(ErrorInt::FragmentLost {
                seq,
                reason: "sequence gap inside fragment run",
            });
            warn!("ssrc={:08x}: {}", pkt.ssrc(), e);
            self.fragments.clear();
            return Verdict::Consumed;
        }
        if self.fragments.len() == MAX_FRAGMENTS {
            let e: Error = wrap!(ErrorInt::FragmentLost {
                seq,
                reason: "fragment run exceeds buffer capacity",
            });
            warn!("ssrc={:08x}: {}", pkt.ssrc(), e);
            self.fragments.clear();
            return Verdict::Consumed;
        }

        self.fragments
            .push(Bytes::copy_from_slice(&payload[2..]));
        self.last_frag_seq = seq;

        if fu_header & 0b0100_0000 == 0 {
            // Start or interior fragment: buffered, nothing to forward.
            return Verdict::Consumed;
        }

        // End bit: rebuild the NAL header from the indicator's NRI bits and
        // the fragment header's type bits, then splice the fragments.
        let total: usize = self.fragments.iter().map(Bytes::len).sum();
        let mut nal = BytesMut::with_capacity(1 + total);
        nal.put_u8((indicator & 0b0110_0000) | (fu_header & 0b0001_1111));
        for fragment in &self.fragments {
            nal.extend_from_slice(fragment);
        }
        self.fragments.clear();
        pkt.set_payload(nal.freeze());
        Verdict::Forward
    }
}

impl Default for FuaReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for FuaReassembler {
    fn process(&mut self, item: &mut StageItem) -> Result<(), Error> {
        let verdict = {
            let pkt = match item {
                StageItem::Packet(p) => p,
                other => return Err(wrong_item_kind("FuaReassembler", "packet", other)),
            };
            let payload = pkt.payload();
            if payload.is_empty() {
                warn!(
                    "ssrc={:08x} seq={:04x}: empty payload",
                    pkt.ssrc(),
                    pkt.sequence_number()
                );
                self.fragments.clear();
                Verdict::Consumed
            } else if payload[0] & 0b0001_1111 == NAL_TYPE_FU_A {
                self.push_fragment(pkt)
            } else {
                self.fragments.clear();
                Verdict::Forward
            }
        };
        match verdict {
            Verdict::Forward => forward(&mut self.next, item),
            Verdict::Consumed => Ok(()),
        }
    }

    fn attach(&mut self, next: Box<dyn Stage>) {
        replace_next(&mut self.next, next);
    }

    fn release(&mut self) {
        self.fragments.clear();
        if let Some(next) = self.next.as_mut() {
            next.release();
        }
    }
}
