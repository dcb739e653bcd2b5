// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Muxing of H.264 NAL units into FLV video tags.
//!
//! The muxer is a state machine over sequence-header emission: nothing
//! leaves until an SPS, a PPS, and a positive timestamp spacing have all
//! been observed. At that point it emits one onMetaData script tag and one
//! AVC sequence-header tag, then every subsequent NAL becomes an AVC NALU
//! tag.

use bytes::Bytes;
use log::{debug, info};

use super::{forward, replace_next, wrong_item_kind, Stage, StageItem};
use crate::flv::{
    AvcDecoderConfigurationRecord, FlvTag, MetaData, VideoData, AVC_NALU, AVC_SEQ_HEADER,
    CODEC_AVC, FRAME_TYPE_INTER, FRAME_TYPE_KEY, TAG_SCRIPT, TAG_VIDEO,
};
use crate::Error;

mod sps;

pub use sps::Sps;

/// The RTP clock for H.264 always runs at 90 kHz, so dividing an RTP tick
/// delta by 90 yields milliseconds.
const RTP_TICKS_PER_MS: u32 = 90;

/// Fixed presentation offset applied to every frame.
const COMPOSITION_TIME_MS: i32 = 10;

pub struct FlvMuxer {
    next: Option<Box<dyn Stage>>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    sps_sent: bool,
    first_timestamp: Option<u32>,
    last_timestamp: Option<u32>,

    /// Smallest strictly-positive RTP timestamp spacing observed so far;
    /// zero until one exists. Approximates the frame interval for the
    /// metadata framerate.
    delta_timestamp: u32,
}

impl FlvMuxer {
    pub fn new() -> Self {
        Self {
            next: None,
            sps: None,
            pps: None,
            sps_sent: false,
            first_timestamp: None,
            last_timestamp: None,
            delta_timestamp: 0,
        }
    }

    fn run(&mut self, ts: u32, payload: Bytes) -> Result<(), Error> {
        let first = *self.first_timestamp.get_or_insert(ts);
        if let Some(last) = self.last_timestamp {
            let delta = ts.wrapping_sub(last);
            if delta > 0 && (self.delta_timestamp == 0 || delta < self.delta_timestamp) {
                self.delta_timestamp = delta;
            }
        }
        if payload.is_empty() {
            return Ok(());
        }

        let dts = ts.wrapping_sub(first) / RTP_TICKS_PER_MS;
        let nal_type = payload[0] & 0x1F;

        match nal_type {
            7 => self.sps = Some(payload.clone()),
            8 => self.pps = Some(payload.clone()),
            _ => {}
        }

        if nal_type == 7 || nal_type == 8 {
            let (sps, pps) = match (&self.sps, &self.pps) {
                (Some(s), Some(p)) if !self.sps_sent && self.delta_timestamp > 0 => {
                    (s.clone(), p.clone())
                }
                _ => return Ok(()),
            };
            if sps.len() < 4 {
                debug!("dropping undersized SPS ({} bytes)", sps.len());
                return Ok(());
            }
            let parsed = match Sps::parse(&sps) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("dropping unparseable SPS: {e}");
                    return Ok(());
                }
            };

            let metadata = MetaData {
                has_video: true,
                has_audio: false,
                can_seek_to_end: false,
                frame_rate: 90_000 / self.delta_timestamp,
                width: parsed.width(),
                height: parsed.height(),
                video_codec_id: CODEC_AVC,
            };
            info!(
                "stream parameters: {}x{} profile={} level={} ~{} fps",
                metadata.width, metadata.height, parsed.profile_idc, parsed.level_idc,
                metadata.frame_rate
            );
            self.emit(FlvTag::new(TAG_SCRIPT, 0, metadata.marshal()?))?;

            let record = AvcDecoderConfigurationRecord {
                configuration_version: 1,
                avc_profile_indication: sps[1],
                profile_compatibility: sps[2],
                avc_level_indication: sps[3],
                sps,
                pps,
            };
            let video = VideoData {
                frame_type: FRAME_TYPE_KEY,
                codec_id: CODEC_AVC,
                avc_packet_type: AVC_SEQ_HEADER,
                composition_time: COMPOSITION_TIME_MS,
                data: record.marshal(),
            };
            self.emit(FlvTag::new(TAG_VIDEO, dts, video.marshal()))?;
            self.sps_sent = true;
        } else if self.sps_sent {
            let video = VideoData {
                frame_type: if nal_type == 5 {
                    FRAME_TYPE_KEY
                } else {
                    FRAME_TYPE_INTER
                },
                codec_id: CODEC_AVC,
                avc_packet_type: AVC_NALU,
                composition_time: COMPOSITION_TIME_MS,
                data: payload,
            };
            self.emit(FlvTag::new(TAG_VIDEO, dts, video.marshal()))?;
        }
        Ok(())
    }

    fn emit(&mut self, tag: FlvTag) -> Result<(), Error> {
        let mut item = StageItem::Tag(tag);
        forward(&mut self.next, &mut item)
    }
}

impl Default for FlvMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for FlvMuxer {
    fn process(&mut self, item: &mut StageItem) -> Result<(), Error> {
        let (ts, payload) = match item {
            StageItem::Packet(p) => (p.timestamp(), Bytes::copy_from_slice(p.payload())),
            other => return Err(wrong_item_kind("FlvMuxer", "packet", other)),
        };
        let result = self.run(ts, payload);
        self.last_timestamp = Some(ts);
        result
    }

    fn attach(&mut self, next: Box<dyn Stage>) {
        replace_next(&mut self.next, next);
    }

    fn release(&mut self) {
        if let Some(next) = self.next.as_mut() {
            next.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{packet, Recorder};
    use super::*;
    use rml_amf0::Amf0Value;

    const SPS: [u8; 13] = [
        0x67, 0x42, 0x00, 0x1E, 0x96, 0x54, 0x05, 0x01, 0xED, 0x00, 0xF1, 0x22, 0x6A,
    ];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];

    fn muxer_with_recorder() -> (
        FlvMuxer,
        std::sync::Arc<std::sync::Mutex<Vec<FlvTag>>>,
    ) {
        let recorder = Recorder::new();
        let tags = recorder.tags.clone();
        let mut muxer = FlvMuxer::new();
        muxer.attach(Box::new(recorder));
        (muxer, tags)
    }

    fn push(muxer: &mut FlvMuxer, seq: u16, ts: u32, payload: &[u8]) {
        let mut item = StageItem::Packet(packet(seq, ts, payload));
        muxer.process(&mut item).unwrap();
    }

    #[test]
    fn silent_until_quorum() {
        let (mut muxer, tags) = muxer_with_recorder();
        push(&mut muxer, 1, 90_000, &SPS);
        // Same timestamp: no positive spacing yet, so the pair is held.
        push(&mut muxer, 2, 90_000, &PPS);
        // Frames cannot be emitted before the sequence header either.
        push(&mut muxer, 3, 93_000, &[0x65, 0x01, 0x02]);
        assert!(tags.lock().unwrap().is_empty());
    }

    #[test]
    fn emits_metadata_then_sequence_header_then_frames() {
        let (mut muxer, tags) = muxer_with_recorder();
        push(&mut muxer, 1, 90_000, &SPS);
        push(&mut muxer, 2, 93_000, &PPS);
        push(&mut muxer, 3, 93_000, &[0x65, 0xAA]);
        push(&mut muxer, 4, 96_000, &[0x41, 0xBB]);
        let tags = tags.lock().unwrap();
        assert_eq!(tags.len(), 4);

        let script = &tags[0];
        assert_eq!(script.tag_type, TAG_SCRIPT);
        assert_eq!(script.timestamp_ms, 0);
        let mut cursor = std::io::Cursor::new(&script.data[..]);
        let values = rml_amf0::deserialize(&mut cursor).unwrap();
        let props = match &values[2] {
            Amf0Value::Object(p) => p,
            other => panic!("expected object, got {other:?}"),
        };
        assert_eq!(props["width"], Amf0Value::Number(640.0));
        assert_eq!(props["height"], Amf0Value::Number(480.0));
        assert_eq!(props["framerate"], Amf0Value::Number(30.0));

        let seq_header = &tags[1];
        assert_eq!(seq_header.tag_type, TAG_VIDEO);
        assert_eq!(seq_header.timestamp_ms, 33); // 3000 ticks / 90
        assert_eq!(seq_header.data[0], 0x17); // key frame, AVC
        assert_eq!(seq_header.data[1], AVC_SEQ_HEADER);
        // The configuration record embeds the SPS and PPS verbatim.
        assert_eq!(&seq_header.data[5..9], &[0x01, 0x42, 0x00, 0x1E]);

        let idr = &tags[2];
        assert_eq!(idr.tag_type, TAG_VIDEO);
        assert_eq!(idr.data[0], 0x17);
        assert_eq!(idr.data[1], AVC_NALU);
        assert_eq!(&idr.data[9..], &[0x65, 0xAA]);

        let inter = &tags[3];
        assert_eq!(inter.data[0], 0x27); // inter frame, AVC
        assert_eq!(inter.timestamp_ms, 66);
    }

    #[test]
    fn sequence_header_is_sent_once() {
        let (mut muxer, tags) = muxer_with_recorder();
        push(&mut muxer, 1, 90_000, &SPS);
        push(&mut muxer, 2, 93_000, &PPS);
        push(&mut muxer, 3, 96_000, &SPS);
        push(&mut muxer, 4, 96_000, &PPS);
        assert_eq!(tags.lock().unwrap().len(), 2);
    }

    #[test]
    fn unparseable_sps_blocks_emission() {
        let (mut muxer, tags) = muxer_with_recorder();
        // Claims to be an SPS but truncates mid-field.
        push(&mut muxer, 1, 90_000, &[0x67, 0x42, 0x00, 0x1E]);
        push(&mut muxer, 2, 93_000, &PPS);
        push(&mut muxer, 3, 96_000, &[0x65, 0x01]);
        assert!(tags.lock().unwrap().is_empty());
    }

    #[test]
    fn composition_time_is_fixed_offset() {
        let (mut muxer, tags) = muxer_with_recorder();
        push(&mut muxer, 1, 90_000, &SPS);
        push(&mut muxer, 2, 93_000, &PPS);
        push(&mut muxer, 3, 93_000, &[0x65, 0xAA]);
        let tags = tags.lock().unwrap();
        let idr = &tags[2];
        assert_eq!(&idr.data[2..5], &[0x00, 0x00, 0x0A]);
    }
}
