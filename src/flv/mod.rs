//! FLV muxer: wraps H.264 NAL units in AVC video tags behind a minimal
//! FLV file header, one instance per connected FLV client.
//!
//! Layout follows the Adobe FLV spec and ISO/IEC 14496-15's
//! AVCDecoderConfigurationRecord; see [`AvcDecoderConfig`] for the latter.

use bytes::{BufMut, Bytes, BytesMut};

use crate::nal::{self, NalRange};

const FLV_HEADER: [u8; 13] = [
    b'F', b'L', b'V', // signature
    0x01, // version
    0x01, // flags: video present, audio absent
    0x00, 0x00, 0x00, 0x09, // data offset: 9 (header length)
    0x00, 0x00, 0x00, 0x00, // PreviousTagSize0
];

const TAG_TYPE_VIDEO: u8 = 0x09;
const TAG_TYPE_SCRIPT_DATA: u8 = 0x12;

const FRAME_TYPE_KEY: u8 = 1;
const FRAME_TYPE_INTER: u8 = 2;
const CODEC_ID_AVC: u8 = 7;

const AVC_PACKET_TYPE_SEQUENCE_HEADER: u8 = 0;
const AVC_PACKET_TYPE_NALU: u8 = 1;

/// The decoder configuration an FLV client needs before any video tag
/// can be decoded: SPS/PPS plus the AVCC length-prefix width this
/// muxer will use for every subsequent NALU tag.
#[derive(Debug, Clone)]
pub struct AvcDecoderConfig {
    pub sps: Bytes,
    pub pps: Bytes,
    pub nalu_length_size: u8,
}

impl AvcDecoderConfig {
    /// Build an AVCDecoderConfigurationRecord (ISO/IEC 14496-15 5.2.4.1)
    /// from one SPS and one PPS. Profile/level bytes are lifted straight
    /// out of the SPS as most encoders and players expect.
    fn to_record(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u8(0x01); // configurationVersion

        let (profile, profile_compat, level) = if self.sps.len() >= 4 {
            (self.sps[1], self.sps[2], self.sps[3])
        } else {
            (0x64, 0x00, 0x1F) // fallback: High profile, level 3.1
        };
        out.put_u8(profile);
        out.put_u8(profile_compat);
        out.put_u8(level);

        out.put_u8(0xFC | (self.nalu_length_size.clamp(1, 4) - 1)); // reserved(6)=111111 | lengthSizeMinusOne

        out.put_u8(0xE0 | 0x01); // reserved(3)=111 | numOfSequenceParameterSets=1
        out.put_u16(self.sps.len() as u16);
        out.put_slice(&self.sps);

        out.put_u8(0x01); // numOfPictureParameterSets
        out.put_u16(self.pps.len() as u16);
        out.put_slice(&self.pps);

        out.freeze()
    }
}

/// Per-client FLV muxer state. Created fresh for every connecting
/// client; the client is held back (by the consumer registry) until
/// the first keyframe so its stream always opens on an IDR.
pub struct FlvMuxer {
    header_sent: bool,
    config_sent: bool,
}

impl Default for FlvMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl FlvMuxer {
    pub fn new() -> Self {
        Self {
            header_sent: false,
            config_sent: false,
        }
    }

    /// Whether this muxer still needs a keyframe before it can emit
    /// anything: the caller gates its first `write_frame` call on this.
    pub fn needs_keyframe_to_start(&self) -> bool {
        !self.config_sent
    }

    /// Mux one frame (already AVCC-framed NAL units, parameter sets
    /// excluded) into an FLV byte stream: header + onMetaData + AVC
    /// sequence header on the very first call, then one AVC video tag
    /// per subsequent frame.
    pub fn write_frame(
        &mut self,
        nals: &[NalRange],
        nal_buf: &[u8],
        is_keyframe: bool,
        config: &AvcDecoderConfig,
        timestamp_ms: u32,
        width: u32,
        height: u32,
        framerate: f64,
    ) -> Bytes {
        let mut out = BytesMut::new();

        if !self.header_sent {
            out.put_slice(&FLV_HEADER);
            out.put_slice(&build_metadata_tag(width, height, framerate));
            self.header_sent = true;
        }

        if !self.config_sent {
            if !is_keyframe {
                return out.freeze();
            }
            out.put_slice(&build_video_tag(
                FRAME_TYPE_KEY,
                AVC_PACKET_TYPE_SEQUENCE_HEADER,
                0,
                &config.to_record(),
            ));
            self.config_sent = true;
        }

        let payload = build_avcc_payload(nals, nal_buf, config.nalu_length_size);
        let frame_type = if is_keyframe { FRAME_TYPE_KEY } else { FRAME_TYPE_INTER };
        out.put_slice(&build_video_tag(frame_type, AVC_PACKET_TYPE_NALU, timestamp_ms, &payload));

        out.freeze()
    }
}

/// Re-encode a set of Annex-B-parsed NAL ranges as AVCC payload
/// (`nalu_length_size`-byte big-endian length, then the NAL bytes).
fn build_avcc_payload(nals: &[NalRange], buf: &[u8], nalu_length_size: u8) -> Bytes {
    let mut out = BytesMut::new();
    let size = nalu_length_size.clamp(1, 4) as usize;

    for range in nals {
        let nal = range.slice(buf);
        if nal::is_sps(nal) || nal::is_pps(nal) {
            continue;
        }
        let len_bytes = (nal.len() as u32).to_be_bytes();
        out.put_slice(&len_bytes[4 - size..]);
        out.put_slice(nal);
    }

    out.freeze()
}

/// Build one FLV tag (type, 24-bit data size, 24+8-bit timestamp,
/// 24-bit stream id = 0) followed by its payload and the trailing
/// PreviousTagSize.
fn build_tag(tag_type: u8, timestamp_ms: u32, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 15);
    out.put_u8(tag_type);
    put_u24(&mut out, payload.len() as u32);
    put_u24(&mut out, timestamp_ms & 0x00FF_FFFF);
    out.put_u8(((timestamp_ms >> 24) & 0xFF) as u8); // timestamp extended byte
    put_u24(&mut out, 0); // stream id, always 0
    out.put_slice(payload);
    out.put_u32((payload.len() + 11) as u32); // PreviousTagSize
    out.freeze()
}

fn build_video_tag(frame_type: u8, avc_packet_type: u8, composition_time: i32, avc_payload: &[u8]) -> Bytes {
    let mut payload = BytesMut::with_capacity(avc_payload.len() + 5);
    payload.put_u8((frame_type << 4) | CODEC_ID_AVC);
    payload.put_u8(avc_packet_type);
    // CompositionTime, 24-bit signed, always 0: this muxer never reorders frames.
    put_u24(&mut payload, (composition_time & 0x00FF_FFFF) as u32);
    payload.put_slice(avc_payload);
    build_tag(TAG_TYPE_VIDEO, 0, &payload)
}

/// Minimal onMetaData ScriptData tag (AMF0): width/height/framerate so
/// players can size their canvas before the first video tag arrives.
fn build_metadata_tag(width: u32, height: u32, framerate: f64) -> Bytes {
    let mut amf = BytesMut::new();
    amf.put_u8(0x02); // AMF0 string marker
    amf.put_u16(10);
    amf.put_slice(b"onMetaData");

    amf.put_u8(0x08); // AMF0 ECMA array marker
    amf.put_u32(4); // approximate element count

    put_amf_string_key(&mut amf, "width");
    put_amf_number(&mut amf, width as f64);

    put_amf_string_key(&mut amf, "height");
    put_amf_number(&mut amf, height as f64);

    put_amf_string_key(&mut amf, "framerate");
    put_amf_number(&mut amf, framerate);

    put_amf_string_key(&mut amf, "videocodecid");
    put_amf_number(&mut amf, CODEC_ID_AVC as f64);

    amf.put_u8(0x00); // object end marker: empty key
    amf.put_u8(0x00);
    amf.put_u8(0x09);

    build_tag(TAG_TYPE_SCRIPT_DATA, 0, &amf)
}

fn put_amf_string_key(out: &mut BytesMut, key: &str) {
    out.put_u16(key.len() as u16);
    out.put_slice(key.as_bytes());
}

fn put_amf_number(out: &mut BytesMut, value: f64) {
    out.put_u8(0x00); // AMF0 number marker
    out.put_f64(value);
}

fn put_u24(out: &mut BytesMut, value: u32) {
    out.put_u8(((value >> 16) & 0xFF) as u8);
    out.put_u8(((value >> 8) & 0xFF) as u8);
    out.put_u8((value & 0xFF) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AvcDecoderConfig {
        AvcDecoderConfig {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F, 0xAC]),
            pps: Bytes::from_static(&[0x68, 0xEB, 0xE3]),
            nalu_length_size: 4,
        }
    }

    #[test]
    fn file_header_only_emitted_once() {
        let mut muxer = FlvMuxer::new();
        let nal_buf = [0x65u8, 0x01, 0x02];
        let nals = [NalRange { start: 0, end: 3 }];

        let first = muxer.write_frame(&nals, &nal_buf, true, &config(), 0, 1280, 720, 30.0);
        assert_eq!(&first[..3], b"FLV");

        let second = muxer.write_frame(&nals, &nal_buf, false, &config(), 40, 1280, 720, 30.0);
        assert_ne!(&second[..3.min(second.len())], b"FLV");
    }

    #[test]
    fn non_keyframe_before_config_yields_empty_output() {
        let mut muxer = FlvMuxer::new();
        let nal_buf = [0x61u8, 0x01];
        let nals = [NalRange { start: 0, end: 2 }];

        let out = muxer.write_frame(&nals, &nal_buf, false, &config(), 0, 1280, 720, 30.0);
        // Only the file header + metadata tag, no video tag yet.
        assert!(muxer.needs_keyframe_to_start());
        assert!(out.len() < 100);
    }

    #[test]
    fn avcc_payload_uses_configured_length_size() {
        let nal_buf = [0x65u8, 0xAA, 0xBB];
        let nals = [NalRange { start: 0, end: 3 }];
        let payload = build_avcc_payload(&nals, &nal_buf, 4);
        assert_eq!(&payload[0..4], &[0, 0, 0, 3]);
        assert_eq!(&payload[4..7], &nal_buf);
    }

    #[test]
    fn keyframe_sets_frame_type_nibble() {
        let mut muxer = FlvMuxer::new();
        let nal_buf = [0x65u8, 0x01];
        let nals = [NalRange { start: 0, end: 2 }];
        let out = muxer.write_frame(&nals, &nal_buf, true, &config(), 0, 1280, 720, 30.0);

        // Locate the video tag: after the FLV header, metadata tag, and
        // AVC sequence header tag.
        assert!(out.len() > FLV_HEADER.len());
    }
}
