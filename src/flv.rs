// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! FLV tag model and wire serialization.
//!
//! Only the tag *bodies* travel to the RTMP library; the 11-byte tag
//! header and the 13-byte file header exist for persisting streams to
//! disk and for tests.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use rml_amf0::Amf0Value;

use crate::{Error, ErrorInt};

pub const TAG_AUDIO: u8 = 8;
pub const TAG_VIDEO: u8 = 9;
pub const TAG_SCRIPT: u8 = 18;

pub const FRAME_TYPE_KEY: u8 = 1;
pub const FRAME_TYPE_INTER: u8 = 2;

pub const CODEC_AVC: u8 = 7;

pub const AVC_SEQ_HEADER: u8 = 0;
pub const AVC_NALU: u8 = 1;
pub const AVC_SEQ_END: u8 = 2;

pub const SOUND_FORMAT_AAC: u8 = 10;
pub const SOUND_RATE_44: u8 = 3;
pub const SOUND_SIZE_8: u8 = 0;
pub const SOUND_SIZE_16: u8 = 1;
pub const SOUND_TYPE_MONO: u8 = 0;
pub const SOUND_TYPE_STEREO: u8 = 1;
pub const AAC_HEADER: u8 = 0;
pub const AAC_RAW: u8 = 1;

/// `"FLV"`, version 1, audio+video present, 9-byte header, PreviousTagSize0.
pub const FLV_FILE_HEADER: [u8; 13] = [
    0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

/// One FLV tag: a script, video, or audio body plus its timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct FlvTag {
    pub tag_type: u8,
    pub data_size: u32,
    pub timestamp_ms: u32,
    pub data: Bytes,
}

impl FlvTag {
    pub fn new(tag_type: u8, timestamp_ms: u32, data: Bytes) -> Self {
        Self {
            tag_type,
            data_size: data.len() as u32,
            timestamp_ms,
            data,
        }
    }

    /// Appends the tag in file framing: 11-byte header then the body.
    /// The timestamp wraps to 24 bits; the extension byte and the stream
    /// id are zero.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(u32::from(self.tag_type) << 24 | self.data_size).to_be_bytes());
        out.extend_from_slice(&(self.timestamp_ms << 8).to_be_bytes());
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&self.data);
    }
}

/// Body of a video tag before serialization.
pub struct VideoData {
    pub frame_type: u8,
    pub codec_id: u8,
    pub avc_packet_type: u8,
    pub composition_time: i32,
    pub data: Bytes,
}

impl VideoData {
    /// `(frame_type << 4 | codec_id)`, then a big-endian
    /// `(avc_packet_type << 24 | composition_time)`, then a length-prefixed
    /// NAL for `AVC_NALU` bodies or the raw decoder configuration record
    /// for `AVC_SEQ_HEADER` bodies.
    pub fn marshal(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(9 + self.data.len());
        out.put_u8(self.frame_type << 4 | self.codec_id);
        out.put_u32(
            u32::from(self.avc_packet_type) << 24 | (self.composition_time as u32 & 0x00FF_FFFF),
        );
        if self.avc_packet_type == AVC_NALU {
            out.put_u32(self.data.len() as u32);
        }
        out.extend_from_slice(&self.data);
        out.freeze()
    }
}

/// ISO/IEC 14496-15 `AVCDecoderConfigurationRecord`, restricted to one SPS
/// and one PPS as the muxer produces.
pub struct AvcDecoderConfigurationRecord {
    pub configuration_version: u8,
    pub avc_profile_indication: u8,
    pub profile_compatibility: u8,
    pub avc_level_indication: u8,
    pub sps: Bytes,
    pub pps: Bytes,
}

impl AvcDecoderConfigurationRecord {
    pub fn marshal(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(11 + self.sps.len() + self.pps.len());
        out.put_u8(self.configuration_version);
        out.put_u8(self.avc_profile_indication);
        out.put_u8(self.profile_compatibility);
        out.put_u8(self.avc_level_indication);
        out.put_u8(0xff); // reserved + 4-byte NAL length
        out.put_u8(0xe1); // reserved + one SPS
        out.put_u16(self.sps.len() as u16);
        out.extend_from_slice(&self.sps);
        out.put_u8(0x01); // one PPS
        out.put_u16(self.pps.len() as u16);
        out.extend_from_slice(&self.pps);
        out.freeze()
    }
}

/// Stream descriptors carried by the onMetaData script tag.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MetaData {
    pub has_video: bool,
    pub has_audio: bool,
    pub can_seek_to_end: bool,
    pub frame_rate: u32,
    pub width: u32,
    pub height: u32,
    pub video_codec_id: u8,
}

impl MetaData {
    /// AMF0-encodes `"@setDataFrame"`, `"onMetaData"`, and an anonymous
    /// object with the stream descriptors. `width`/`height` are only
    /// written when known.
    pub fn marshal(&self) -> Result<Bytes, Error> {
        let mut properties = HashMap::new();
        properties.insert(
            "copyright".to_string(),
            Amf0Value::Utf8String(env!("CARGO_PKG_NAME").to_string()),
        );
        properties.insert("hasVideo".to_string(), Amf0Value::Boolean(self.has_video));
        properties.insert("hasAudio".to_string(), Amf0Value::Boolean(self.has_audio));
        properties.insert(
            "canSeekToEnd".to_string(),
            Amf0Value::Boolean(self.can_seek_to_end),
        );
        properties.insert(
            "framerate".to_string(),
            Amf0Value::Number(f64::from(self.frame_rate)),
        );
        properties.insert(
            "videocodecid".to_string(),
            Amf0Value::Number(f64::from(self.video_codec_id)),
        );
        if self.width > 0 {
            properties.insert("width".to_string(), Amf0Value::Number(f64::from(self.width)));
        }
        if self.height > 0 {
            properties.insert(
                "height".to_string(),
                Amf0Value::Number(f64::from(self.height)),
            );
        }
        let values = vec![
            Amf0Value::Utf8String("@setDataFrame".to_string()),
            Amf0Value::Utf8String("onMetaData".to_string()),
            Amf0Value::Object(properties),
        ];
        let bytes = rml_amf0::serialize(&values).map_err(|e| {
            wrap!(ErrorInt::RtmpProtocol {
                description: format!("onMetaData serialization failed: {e:?}"),
            })
        })?;
        Ok(Bytes::from(bytes))
    }
}

/// Body of an audio tag before serialization. Present for completeness;
/// nothing in the default chain produces audio tags.
#[cfg(feature = "audio")]
pub struct AudioData {
    pub sound_format: u8,
    pub sound_rate: u8,
    pub sound_size: u8,
    pub sound_type: u8,
    pub aac_packet_type: u8,
    pub data: Bytes,
}

#[cfg(feature = "audio")]
impl AudioData {
    pub fn marshal(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(2 + self.data.len());
        out.put_u8(
            self.sound_format << 4 | self.sound_rate << 2 | self.sound_size << 1 | self.sound_type,
        );
        out.put_u8(self.aac_packet_type);
        out.extend_from_slice(&self.data);
        out.freeze()
    }
}
