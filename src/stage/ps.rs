// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MPEG program-stream depacketization.
//!
//! Marker-delimited RTP payload aggregates are accumulated into one PS pack,
//! the PES payloads are pulled out of the pack, and the resulting H.264
//! elementary stream is split on 4-byte start codes into individual NAL
//! units, forwarded one per downstream call.

use std::ops::Range;

use bytes::{Bytes, BytesMut};
use log::{debug, warn};

use super::{forward, replace_next, wrong_item_kind, Stage, StageItem};
use crate::{Error, ErrorInt};

const PS_HEADER_LEN: usize = 14;
const START_CODE_LEN: usize = 4;
const PES_HEADER_LEN: usize = 9;
const SYSTEM_HEADER_LEN: usize = 6;
const PSM_HEADER_LEN: usize = 6;

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Strips MPEG-PS framing and emits H.264 NAL units.
///
/// PES packets are ignored until the first program stream map has been
/// seen. On a sequence gap the stage drops payloads until it can
/// resynchronize on a frame boundary (a marker, or a contiguous packet
/// opening a later frame).
pub struct PsDepacketizer {
    next: Option<Box<dyn Stage>>,
    buf: BytesMut,
    first_main_frame: bool,
    last_seq: Option<u16>,
    last_timestamp: u32,
    loss: bool,
}

impl PsDepacketizer {
    pub fn new() -> Self {
        Self {
            next: None,
            buf: BytesMut::new(),
            first_main_frame: false,
            last_seq: None,
            last_timestamp: 0,
            loss: false,
        }
    }

    fn run(&mut self, item: &mut StageItem, seq: u16, ts: u32, marker: bool) -> Result<(), Error> {
        if let Some(last) = self.last_seq {
            if seq.wrapping_sub(last) > 1 {
                self.loss = true;
            }
        }

        if self.loss {
            let pkt = match item {
                StageItem::Packet(p) => p,
                _ => unreachable!("checked in process"),
            };
            debug!(
                "ps loss, dropping ssrc={:08x} seq={:04x} ts={} mark={}",
                pkt.ssrc(),
                seq,
                ts,
                marker
            );
            if marker {
                // The next packet opens a fresh frame.
                self.loss = false;
                self.buf.clear();
            } else if self.last_seq.map_or(false, |l| seq.wrapping_sub(l) <= 1)
                && ts > self.last_timestamp
            {
                // Contiguous packet that already opens a later frame.
                self.loss = false;
                self.buf.clear();
                self.buf.extend_from_slice(pkt.payload());
            }
            return Ok(());
        }

        if ts > self.last_timestamp && !self.buf.is_empty() {
            // Timestamp moved without a marker: the buffered frame is
            // complete. The payload that revealed this is not part of it
            // and is not kept.
            return self.flush(item, seq, ts);
        }

        {
            let pkt = match item {
                StageItem::Packet(p) => p,
                _ => unreachable!("checked in process"),
            };
            self.buf.extend_from_slice(pkt.payload());
        }
        if marker {
            return self.flush(item, seq, ts);
        }
        Ok(())
    }

    /// Extracts the elementary stream from the accumulated pack and
    /// forwards each start-code-delimited NAL, reusing `item` as the
    /// container.
    fn flush(&mut self, item: &mut StageItem, seq: u16, ts: u32) -> Result<(), Error> {
        let pack = std::mem::take(&mut self.buf);
        let mut es = BytesMut::with_capacity(pack.len());
        if let Err(e) = self.extract_h264(&pack, &mut es) {
            let ssrc = match item {
                StageItem::Packet(p) => p.ssrc(),
                _ => 0,
            };
            warn!(
                "ps unpack failed for ssrc={ssrc:08x} seq={seq:04x} ts={ts}: {e}"
            );
        }
        self.buf = pack;
        self.buf.clear();

        let es = es.freeze();
        for range in split_on_start_code(&es) {
            if range.is_empty() {
                continue;
            }
            {
                let pkt = match item {
                    StageItem::Packet(p) => p,
                    _ => unreachable!("checked in process"),
                };
                pkt.set_payload(es.slice(range));
            }
            forward(&mut self.next, item)?;
        }
        Ok(())
    }

    /// Walks one PS pack, appending PES payload bytes to `es`.
    ///
    /// A bounds failure reports `PackInvalid` but leaves whatever was
    /// already appended in `es` for the caller to use.
    fn extract_h264(&mut self, pack: &[u8], es: &mut BytesMut) -> Result<(), Error> {
        if pack.len() < PS_HEADER_LEN {
            bail!(ErrorInt::PackInvalid {
                reason: "shorter than the 14-byte pack header",
            });
        }
        let stuffing = usize::from(pack[13] & 0x07);
        let offset = PS_HEADER_LEN + stuffing;
        if offset >= pack.len() {
            bail!(ErrorInt::PackInvalid {
                reason: "pack stuffing runs past the end",
            });
        }
        let mut next = &pack[offset..];

        while next.len() >= START_CODE_LEN {
            if self.first_main_frame && next[..4] == [0x00, 0x00, 0x01, 0xE0] {
                if PES_HEADER_LEN >= next.len() {
                    bail!(ErrorInt::PackInvalid {
                        reason: "truncated PES header",
                    });
                }
                let pes = &next[..PES_HEADER_LEN];
                let pes_stuffing = usize::from(pes[8]);
                let length = usize::from(u16::from_be_bytes([pes[4], pes[5]]));
                let size = length as isize - 3 - pes_stuffing as isize;
                let data_offset = PES_HEADER_LEN + pes_stuffing;
                if size > 0 {
                    let size = size as usize;
                    if next.len() <= data_offset + size {
                        es.extend_from_slice(&next[data_offset.min(next.len())..]);
                        break;
                    }
                    es.extend_from_slice(&next[data_offset..data_offset + size]);
                    next = &next[data_offset + size..];
                } else {
                    let advance = PES_HEADER_LEN - 3 + length;
                    if next.len() <= advance {
                        break;
                    }
                    next = &next[advance..];
                }
            } else if next[..4] == [0x00, 0x00, 0x01, 0xBB] {
                if next.len() <= SYSTEM_HEADER_LEN {
                    bail!(ErrorInt::PackInvalid {
                        reason: "truncated system header",
                    });
                }
                let length = usize::from(u16::from_be_bytes([next[4], next[5]]));
                let advance = SYSTEM_HEADER_LEN + length;
                if next.len() <= advance {
                    bail!(ErrorInt::PackInvalid {
                        reason: "system header runs past the pack",
                    });
                }
                next = &next[advance..];
            } else if next[..4] == [0x00, 0x00, 0x01, 0xBC] {
                if next.len() <= PSM_HEADER_LEN {
                    bail!(ErrorInt::PackInvalid {
                        reason: "truncated program stream map",
                    });
                }
                let length = usize::from(u16::from_be_bytes([next[4], next[5]]));
                let advance = PSM_HEADER_LEN + length;
                // PES packets become meaningful from here on, even if this
                // map itself turns out to be truncated.
                self.first_main_frame = true;
                if next.len() <= advance {
                    bail!(ErrorInt::PackInvalid {
                        reason: "program stream map runs past the pack",
                    });
                }
                next = &next[advance..];
            } else {
                break;
            }
        }
        Ok(())
    }
}

impl Default for PsDepacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for PsDepacketizer {
    fn process(&mut self, item: &mut StageItem) -> Result<(), Error> {
        let (seq, ts, marker) = match item {
            StageItem::Packet(p) => (p.sequence_number(), p.timestamp(), p.mark()),
            other => return Err(wrong_item_kind("PsDepacketizer", "packet", other)),
        };
        let result = self.run(item, seq, ts, marker);
        self.last_seq = Some(seq);
        self.last_timestamp = ts;
        result
    }

    fn attach(&mut self, next: Box<dyn Stage>) {
        replace_next(&mut self.next, next);
    }

    fn release(&mut self) {
        self.buf.clear();
        if let Some(next) = self.next.as_mut() {
            next.release();
        }
    }
}

/// Splits `data` on each `00 00 00 01`, like the non-overlapping split of
/// the start-code separator; empty parts are yielded and skipped by the
/// caller.
fn split_on_start_code(data: &Bytes) -> Vec<Range<usize>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + START_CODE_LEN <= data.len() {
        if data[i..i + START_CODE_LEN] == START_CODE {
            parts.push(start..i);
            i += START_CODE_LEN;
            start = i;
        } else {
            i += 1;
        }
    }
    parts.push(start..data.len());
    parts
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{marked_packet, packet, Recorder};
    use super::*;

    /// 14-byte pack header with no stuffing.
    fn pack_header() -> Vec<u8> {
        let mut h = vec![0x00, 0x00, 0x01, 0xBA];
        h.extend_from_slice(&[0x44, 0x00, 0x04, 0x00, 0x04, 0x01, 0x00, 0x00, 0x03]);
        h.push(0xF8); // stuffing length 0
        h
    }

    /// Program stream map with a 4-byte body.
    fn psm() -> Vec<u8> {
        vec![0x00, 0x00, 0x01, 0xBC, 0x00, 0x04, 0xE0, 0x1B, 0x00, 0x00]
    }

    /// PES packet with no stuffing wrapping `data`.
    fn pes(data: &[u8]) -> Vec<u8> {
        let mut p = vec![0x00, 0x00, 0x01, 0xE0];
        p.extend_from_slice(&((data.len() + 3) as u16).to_be_bytes());
        p.extend_from_slice(&[0x80, 0x00, 0x00]); // flags, stuffing length 0
        p.extend_from_slice(data);
        p
    }

    fn one_frame_pack(es: &[u8]) -> Vec<u8> {
        let mut pack = pack_header();
        pack.extend_from_slice(&psm());
        pack.extend_from_slice(&pes(es));
        pack
    }

    fn depacketizer_with_recorder() -> (
        PsDepacketizer,
        std::sync::Arc<std::sync::Mutex<Vec<(u16, u32, Vec<u8>)>>>,
    ) {
        let recorder = Recorder::new();
        let packets = recorder.packets.clone();
        let mut ps = PsDepacketizer::new();
        ps.attach(Box::new(recorder));
        (ps, packets)
    }

    #[test]
    fn splits_marker_terminated_frame_into_nals() {
        let (mut ps, packets) = depacketizer_with_recorder();
        let mut es = Vec::new();
        es.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x67, 0xAA]);
        es.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x68, 0xBB]);
        let mut item = StageItem::Packet(marked_packet(1, 90_000, &one_frame_pack(&es)));
        ps.process(&mut item).unwrap();
        let seen = packets.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].2, vec![0x67, 0xAA]);
        assert_eq!(seen[1].2, vec![0x68, 0xBB]);
    }

    #[test]
    fn pes_before_program_stream_map_is_ignored() {
        let (mut ps, packets) = depacketizer_with_recorder();
        let mut pack = pack_header();
        pack.extend_from_slice(&pes(&[0x00, 0x00, 0x00, 0x01, 0x65, 0x01]));
        let mut item = StageItem::Packet(marked_packet(1, 90_000, &pack));
        ps.process(&mut item).unwrap();
        assert!(packets.lock().unwrap().is_empty());
    }

    #[test]
    fn pack_spanning_multiple_datagrams() {
        let (mut ps, packets) = depacketizer_with_recorder();
        let es = [0x00, 0x00, 0x00, 0x01, 0x65, 0x11, 0x22, 0x33];
        let pack = one_frame_pack(&es);
        let (a, b) = pack.split_at(pack.len() / 2);
        let mut item = StageItem::Packet(packet(1, 90_000, a));
        ps.process(&mut item).unwrap();
        assert!(packets.lock().unwrap().is_empty());
        let mut item = StageItem::Packet(marked_packet(2, 90_000, b));
        ps.process(&mut item).unwrap();
        let seen = packets.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].2, vec![0x65, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn timestamp_change_flushes_unterminated_frame() {
        let (mut ps, packets) = depacketizer_with_recorder();
        let es = [0x00, 0x00, 0x00, 0x01, 0x65, 0x77];
        // Final datagram of the frame (with the marker) was never sent.
        let mut item = StageItem::Packet(packet(1, 90_000, &one_frame_pack(&es)));
        ps.process(&mut item).unwrap();
        assert!(packets.lock().unwrap().is_empty());
        // The next frame's first datagram reveals the boundary.
        let mut item = StageItem::Packet(packet(2, 93_000, &pack_header()));
        ps.process(&mut item).unwrap();
        let seen = packets.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].2, vec![0x65, 0x77]);
    }

    #[test]
    fn loss_resynchronizes_after_marker() {
        let (mut ps, packets) = depacketizer_with_recorder();
        let es1 = [0x00, 0x00, 0x00, 0x01, 0x65, 0x01];
        let mut item = StageItem::Packet(marked_packet(1, 90_000, &one_frame_pack(&es1)));
        ps.process(&mut item).unwrap();
        // seq 2 lost mid-frame; 3 carries the frame's tail and the marker.
        let mut item = StageItem::Packet(marked_packet(3, 93_000, &[0x99, 0x98]));
        ps.process(&mut item).unwrap();
        // The damaged frame was dropped, and the following one goes through.
        let es2 = [0x00, 0x00, 0x00, 0x01, 0x41, 0x02];
        let mut item = StageItem::Packet(marked_packet(4, 96_000, &one_frame_pack(&es2)));
        ps.process(&mut item).unwrap();
        let seen = packets.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].2, vec![0x65, 0x01]);
        assert_eq!(seen[1].2, vec![0x41, 0x02]);
    }

    #[test]
    fn truncated_pack_keeps_partial_extraction() {
        let mut ps = PsDepacketizer::new();
        ps.first_main_frame = true;
        let mut pack = pack_header();
        // PES whose declared size exceeds what the pack holds.
        pack.extend_from_slice(&[0x00, 0x00, 0x01, 0xE0, 0x00, 0x20, 0x80, 0x00, 0x00]);
        pack.extend_from_slice(&[0x65, 0x0A, 0x0B]);
        let mut es = BytesMut::new();
        ps.extract_h264(&pack, &mut es).unwrap();
        assert_eq!(&es[..], &[0x65, 0x0A, 0x0B]);
    }

    #[test]
    fn short_pack_is_invalid() {
        let mut ps = PsDepacketizer::new();
        let mut es = BytesMut::new();
        let e = ps.extract_h264(&[0x00, 0x00, 0x01, 0xBA], &mut es).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::PackInvalid);
    }

    #[test]
    fn split_handles_leading_and_trailing_codes() {
        let data = Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x01, 0xAA, 0x00, 0x00, 0x00, 0x01, 0xBB,
        ]);
        let parts: Vec<_> = split_on_start_code(&data)
            .into_iter()
            .filter(|r| !r.is_empty())
            .map(|r| data[r].to_vec())
            .collect();
        assert_eq!(parts, vec![vec![0xAA], vec![0xBB]]);
    }
}
