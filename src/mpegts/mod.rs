//! MPEG-TS muxer: turns H.264 NAL units into a stream of 188-byte
//! transport-stream packets with PAT/PMT signaling and PES framing.
//!
//! Fixed PID assignments, continuity counters that persist across segment
//! boundaries, and a PCR written on the first packet of every frame —
//! see the per-frame emission contract this module implements.

mod crc32;

use bytes::{BufMut, Bytes, BytesMut};
use crc32::crc32_mpeg;

pub const TS_PACKET_LEN: usize = 188;
pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const SYNC_BYTE: u8 = 0x47;

/// Cap on TS packets emitted for a single frame (~188 KB); anything beyond
/// this is dropped and the frame is reported truncated.
const MAX_PACKETS_PER_FRAME: usize = 1000;

/// The decoder extradata a stream carries: SPS, PPS, and the AVCC
/// length-prefix width negotiated once per connection.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    pub sps: Bytes,
    pub pps: Bytes,
    pub nal_length_size: u8,
}

impl ParameterSet {
    pub fn is_ready(&self) -> bool {
        !self.sps.is_empty() && !self.pps.is_empty()
    }
}

/// Result of muxing one frame's NAL units into TS packets.
#[derive(Debug)]
pub struct FrameEmission {
    /// Concatenated, ready-to-send 188-byte TS packets (PAT/PMT + PES).
    pub packets: Bytes,
    /// The frame's PTS in 90 kHz ticks, as assigned by this muxer.
    pub frame_pts: u64,
    /// True when the PES payload exceeded the per-frame packet cap and
    /// was truncated.
    pub truncated: bool,
}

/// Per-PID continuity counters. Persist for the lifetime of a muxer;
/// only a full stream restart ([`TsMuxer::reset`]) clears them.
#[derive(Debug, Default)]
struct ContinuityCounters {
    pat: u8,
    pmt: u8,
    video: u8,
}

impl ContinuityCounters {
    fn next_pat(&mut self) -> u8 {
        let cc = self.pat;
        self.pat = (self.pat + 1) & 0x0F;
        cc
    }

    fn next_pmt(&mut self) -> u8 {
        let cc = self.pmt;
        self.pmt = (self.pmt + 1) & 0x0F;
        cc
    }

    fn next_video(&mut self) -> u8 {
        let cc = self.video;
        self.video = (self.video + 1) & 0x0F;
        cc
    }
}

/// Stateful per-stream MPEG-TS muxer. One instance per HLS session; the
/// same instance spans segment boundaries without resetting its clock.
pub struct TsMuxer {
    cc: ContinuityCounters,
    current_pts: u64,
    segment_start_pts: Option<u64>,
    /// Set at segment open; cleared once the first frame of the segment
    /// has injected PAT/PMT + SPS/PPS.
    pending_segment_start: bool,
    /// Set once after [`TsMuxer::reset`]; marks the next emitted packet
    /// with a discontinuity indicator, then clears.
    pending_discontinuity: bool,
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsMuxer {
    pub fn new() -> Self {
        Self {
            cc: ContinuityCounters::default(),
            current_pts: 0,
            segment_start_pts: None,
            pending_segment_start: false,
            pending_discontinuity: false,
        }
    }

    /// Full stream restart: continuity counters and PTS clock reset to
    /// zero. Called only when the ingest reconnects from scratch, never
    /// on an ordinary segment boundary.
    pub fn reset(&mut self) {
        *self = Self::new();
        self.pending_discontinuity = true;
    }

    /// Mark the next `write_frame` call as the first frame of a new
    /// segment, forcing PAT/PMT and SPS/PPS injection even if it isn't a
    /// keyframe.
    pub fn start_segment(&mut self) {
        self.pending_segment_start = true;
    }

    /// The PTS (90 kHz ticks) captured on the first frame of the segment
    /// currently open, if any frame has been written to it yet.
    pub fn segment_start_pts(&self) -> Option<u64> {
        self.segment_start_pts
    }

    /// Mux one decoded frame (already split into NAL units, SPS/PPS
    /// excluded) into TS packets.
    ///
    /// `fps` drives the 90 kHz PTS advance (`90_000 / fps` per frame);
    /// `is_keyframe` controls the random-access indicator and whether
    /// SPS/PPS are injected ahead of the frame's own NALs.
    pub fn write_frame(
        &mut self,
        nals: &[&[u8]],
        is_keyframe: bool,
        params: &ParameterSet,
        fps: f64,
    ) -> FrameEmission {
        let is_segment_start = self.pending_segment_start;
        let needs_psi = is_keyframe || is_segment_start;
        let needs_parameter_sets = is_keyframe || is_segment_start;

        let frame_pts = self.current_pts;
        if is_segment_start {
            self.segment_start_pts = Some(frame_pts);
            self.pending_segment_start = false;
        }

        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 25.0 };
        self.current_pts = self.current_pts.wrapping_add((90_000.0 / fps).round() as u64);

        let mut out = BytesMut::new();

        if needs_psi {
            out.put_slice(&self.build_pat());
            out.put_slice(&self.build_pmt());
        }

        let pes_payload = build_pes_payload(nals, needs_parameter_sets, params);
        let pes = build_pes_header(frame_pts).chain_payload(pes_payload);

        let discontinuity = self.pending_discontinuity;
        self.pending_discontinuity = false;

        let (video_packets, truncated) =
            self.split_into_video_packets(&pes, is_keyframe, frame_pts, discontinuity);
        out.put_slice(&video_packets);

        FrameEmission {
            packets: out.freeze(),
            frame_pts,
            truncated,
        }
    }

    fn build_pat(&mut self) -> Bytes {
        let mut section = BytesMut::new();
        section.put_u8(0x00); // table id: PAT
        // section_syntax_indicator=1, reserved bits, section_length filled below
        let section_length_pos = section.len();
        section.put_u16(0xB000); // placeholder, patched below
        section.put_u16(0x0001); // transport stream id
        section.put_u8(0xC1); // reserved(2)=3, version=0, current_next=1
        section.put_u8(0x00); // section number
        section.put_u8(0x00); // last section number
        section.put_u16(0x0001); // program number
        section.put_u16(0xE000 | PMT_PID); // reserved(3) | PMT PID

        patch_section_length(&mut section, section_length_pos);
        let crc = crc32_mpeg(&section);
        section.put_u32(crc);

        let cc = self.cc.next_pat();
        wrap_psi_section(PAT_PID, cc, section.freeze())
    }

    fn build_pmt(&mut self) -> Bytes {
        let mut section = BytesMut::new();
        section.put_u8(0x02); // table id: PMT
        let section_length_pos = section.len();
        section.put_u16(0xB000); // placeholder
        section.put_u16(0x0001); // program number
        section.put_u8(0xC1);
        section.put_u8(0x00);
        section.put_u8(0x00);
        section.put_u16(0xE000 | VIDEO_PID); // PCR PID = video PID
        section.put_u16(0xF000); // program info length = 0

        section.put_u8(STREAM_TYPE_H264);
        section.put_u16(0xE000 | VIDEO_PID);
        section.put_u16(0xF000); // ES info length = 0

        patch_section_length(&mut section, section_length_pos);
        let crc = crc32_mpeg(&section);
        section.put_u32(crc);

        let cc = self.cc.next_pmt();
        wrap_psi_section(PMT_PID, cc, section.freeze())
    }

    /// Split a PES byte stream into 188-byte video-PID TS packets. The
    /// first packet carries payload_unit_start, an adaptation field with
    /// PCR, random-access-indicator (iff keyframe) and discontinuity
    /// indicator (iff this follows a reset). The final packet is padded
    /// with adaptation-field stuffing.
    fn split_into_video_packets(
        &mut self,
        pes: &[u8],
        is_keyframe: bool,
        frame_pts: u64,
        discontinuity: bool,
    ) -> (Bytes, bool) {
        let mut out = BytesMut::new();
        let mut offset = 0;
        let mut first = true;
        let mut truncated = false;

        while offset < pes.len() {
            if out.len() / TS_PACKET_LEN >= MAX_PACKETS_PER_FRAME {
                truncated = true;
                break;
            }

            let mut packet = BytesMut::with_capacity(TS_PACKET_LEN);
            packet.put_u8(SYNC_BYTE);

            let payload_unit_start = first;
            let mut byte1 = (VIDEO_PID >> 8) as u8 & 0x1F;
            if payload_unit_start {
                byte1 |= 0x40;
            }
            packet.put_u8(byte1);
            packet.put_u8((VIDEO_PID & 0xFF) as u8);

            let cc = self.cc.next_video();
            let has_adaptation = first;
            let adaptation_flag = if has_adaptation { 0x30 } else { 0x10 };
            packet.put_u8(adaptation_flag | (cc & 0x0F));

            if has_adaptation {
                write_adaptation_field_with_pcr(&mut packet, is_keyframe, discontinuity, frame_pts);
            }

            let header_len = packet.len();
            let remaining_in_packet = TS_PACKET_LEN - header_len;
            let remaining_payload = pes.len() - offset;
            let is_last_chunk = remaining_payload <= remaining_in_packet;

            let chunk_len = remaining_payload.min(remaining_in_packet);
            packet.put_slice(&pes[offset..offset + chunk_len]);
            offset += chunk_len;

            if is_last_chunk && packet.len() < TS_PACKET_LEN {
                pad_with_stuffing(&mut packet, header_len);
            }

            debug_assert_eq!(packet.len(), TS_PACKET_LEN);
            out.put_slice(&packet);
            first = false;
        }

        (out.freeze(), truncated)
    }
}

/// Patch the 12-bit section_length field (bytes already reserved at
/// `pos`) once the rest of the section is known: everything after the
/// length field itself, plus the 4-byte CRC appended by the caller.
fn patch_section_length(section: &mut BytesMut, pos: usize) {
    let after_length = section.len() - pos - 2;
    let section_length = (after_length + 4) as u16; // +4 for CRC appended after this call
    let bytes = section_length.to_be_bytes();
    section[pos] = 0xB0 | (bytes[0] & 0x0F);
    section[pos + 1] = bytes[1];
}

/// Wrap one PSI section (PAT or PMT, already including its CRC) in a
/// single 188-byte TS packet with the pointer field and stuffing.
fn wrap_psi_section(pid: u16, cc: u8, section: Bytes) -> Bytes {
    let mut packet = BytesMut::with_capacity(TS_PACKET_LEN);
    packet.put_u8(SYNC_BYTE);
    packet.put_u8(0x40 | ((pid >> 8) as u8 & 0x1F)); // payload_unit_start=1
    packet.put_u8((pid & 0xFF) as u8);
    packet.put_u8(0x10 | (cc & 0x0F));
    packet.put_u8(0x00); // pointer field
    packet.put_slice(&section);

    while packet.len() < TS_PACKET_LEN {
        packet.put_u8(0xFF);
    }
    packet.truncate(TS_PACKET_LEN);
    packet.freeze()
}

/// Build the PES payload for one frame: SPS+PPS+NAL(s) when parameter
/// sets must be (re-)injected, otherwise the frame's NAL(s) alone. Each
/// unit gets its own 4-byte Annex-B start code.
fn build_pes_payload(nals: &[&[u8]], needs_parameter_sets: bool, params: &ParameterSet) -> Bytes {
    let mut out = BytesMut::new();

    if needs_parameter_sets && params.is_ready() {
        out.put_slice(&[0, 0, 0, 1]);
        out.put_slice(&params.sps);
        out.put_slice(&[0, 0, 0, 1]);
        out.put_slice(&params.pps);
    }

    for nal in nals {
        out.put_slice(&[0, 0, 0, 1]);
        out.put_slice(nal);
    }

    out.freeze()
}

/// A PES header with a trailing-payload marker for readability at the
/// call site; `chain_payload` just concatenates.
struct PesHeader(BytesMut);

impl PesHeader {
    fn chain_payload(mut self, payload: Bytes) -> Bytes {
        self.0.put_slice(&payload);
        self.0.freeze()
    }
}

/// Build a PES header with PTS-only flags (no DTS — this muxer never
/// reorders frames) per ISO 13818-1.
fn build_pes_header(pts_90k: u64) -> PesHeader {
    let mut pes = BytesMut::new();
    pes.put_slice(&[0x00, 0x00, 0x01]); // packet start code prefix
    pes.put_u8(0xE0); // stream id: video
    pes.put_u16(0); // PES packet length: unbounded
    pes.put_u8(0x80); // marker bits '10', no scrambling, no priority
    pes.put_u8(0x80); // PTS present, no DTS
    pes.put_u8(5); // PES header data length (5 bytes of PTS)
    write_pts(&mut pes, 0x2, pts_90k); // '0010' marker for PTS-only
    PesHeader(pes)
}

/// Encode a 33-bit timestamp per ISO 13818-1 2.4.3.6, with the given
/// 4-bit marker prefix (0x2 for PTS-only, 0x3/0x1 for PTS+DTS pairs).
fn write_pts(out: &mut BytesMut, marker: u8, ts: u64) {
    let ts = ts & 0x1_FFFF_FFFF;
    out.put_u8((marker << 4) | (((ts >> 30) & 0x07) as u8) << 1 | 1);
    out.put_u16((((ts >> 15) & 0x7FFF) << 1 | 1) as u16);
    out.put_u16((((ts & 0x7FFF) << 1) | 1) as u16);
}

/// Write an adaptation field carrying a PCR equal to `pts_90k`, with
/// random_access_indicator set iff `is_keyframe` and
/// discontinuity_indicator set iff `discontinuity`. No stuffing here —
/// the caller pads the packet's tail separately.
fn write_adaptation_field_with_pcr(packet: &mut BytesMut, is_keyframe: bool, discontinuity: bool, pts_90k: u64) {
    packet.put_u8(7); // adaptation_field_length: flags(1) + PCR(6)
    let mut flags = 0x10; // PCR_flag
    if discontinuity {
        flags |= 0x80;
    }
    if is_keyframe {
        flags |= 0x40; // random_access_indicator
    }
    packet.put_u8(flags);

    // PCR = base (33 bits, 90 kHz) << 15 | reserved(6) | extension(9, 27 MHz, always 0 here)
    let base = pts_90k & 0x1_FFFF_FFFF;
    let pcr: u64 = (base << 15) | 0x3F_FF;
    let bytes = pcr.to_be_bytes();
    packet.put_slice(&bytes[2..8]); // low 48 bits
}

/// Pad `packet` to 188 bytes using adaptation-field stuffing, inserting
/// (or growing) the adaptation field rather than appending raw bytes
/// after the payload — this is the only way this muxer ever reaches a
/// short final packet.
fn pad_with_stuffing(packet: &mut BytesMut, header_len: usize) {
    let needed = TS_PACKET_LEN - packet.len();
    if header_len >= 5 && packet[3] & 0x20 != 0 {
        // Adaptation field already present (first-of-frame packet that's
        // also the last chunk): grow its length byte and insert stuffing
        // right after the existing adaptation bytes.
        let af_len_pos = 4;
        let af_len = packet[af_len_pos] as usize;
        let insert_at = af_len_pos + 1 + af_len;
        let mut stuffing = vec![0xFFu8; needed];
        packet[af_len_pos] = (af_len + needed) as u8;
        let mut rebuilt = BytesMut::with_capacity(packet.len() + needed);
        rebuilt.put_slice(&packet[..insert_at]);
        rebuilt.put_slice(&mut stuffing);
        rebuilt.put_slice(&packet[insert_at..]);
        *packet = rebuilt;
    } else {
        // No adaptation field yet: insert a minimal one (flags byte with
        // all indicator bits clear) before the payload, then stuff it.
        packet[3] |= 0x20; // adaptation_field_control: adaptation + payload
        let af_len = needed - 1; // length byte itself doesn't count
        let mut rebuilt = BytesMut::with_capacity(packet.len() + needed);
        rebuilt.put_slice(&packet[..4]);
        rebuilt.put_u8(af_len as u8);
        if af_len > 0 {
            rebuilt.put_u8(0x00); // flags: no PCR/OPCR/etc
            rebuilt.put_slice(&vec![0xFFu8; af_len - 1]);
        }
        rebuilt.put_slice(&packet[4..]);
        *packet = rebuilt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParameterSet {
        ParameterSet {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]),
            pps: Bytes::from_static(&[0x68, 0xEB, 0xE3]),
            nal_length_size: 4,
        }
    }

    #[test]
    fn every_packet_is_188_bytes_and_starts_with_sync_byte() {
        let mut muxer = TsMuxer::new();
        muxer.start_segment();
        let nal = vec![0x65u8; 400]; // IDR slice, forces multi-packet PES
        let emission = muxer.write_frame(&[&nal], true, &params(), 25.0);

        assert!(!emission.packets.is_empty());
        assert_eq!(emission.packets.len() % TS_PACKET_LEN, 0);
        for chunk in emission.packets.chunks(TS_PACKET_LEN) {
            assert_eq!(chunk[0], SYNC_BYTE);
        }
    }

    #[test]
    fn continuity_counters_increment_gaplessly_across_frames() {
        let mut muxer = TsMuxer::new();
        muxer.start_segment();
        let params = params();

        let mut last_video_cc: Option<u8> = None;
        for i in 0..5 {
            let nal = vec![0x61u8; 50 + i];
            let emission = muxer.write_frame(&[&nal], i == 0, &params, 25.0);
            for chunk in emission.packets.chunks(TS_PACKET_LEN) {
                let pid = (((chunk[1] & 0x1F) as u16) << 8) | chunk[2] as u16;
                if pid == VIDEO_PID {
                    let cc = chunk[3] & 0x0F;
                    if let Some(last) = last_video_cc {
                        assert_eq!(cc, (last + 1) & 0x0F);
                    }
                    last_video_cc = Some(cc);
                }
            }
        }
    }

    #[test]
    fn pts_advances_by_90000_over_fps_per_frame() {
        let mut muxer = TsMuxer::new();
        muxer.start_segment();
        let params = params();
        let fps = 25.0;

        let mut last_pts = None;
        for i in 0..10 {
            let nal = [0x61u8, 0x02];
            let emission = muxer.write_frame(&[&nal], i == 0, &params, fps);
            if let Some(prev) = last_pts {
                assert_eq!(emission.frame_pts - prev, (90_000.0 / fps).round() as u64);
            }
            last_pts = Some(emission.frame_pts);
        }
    }

    #[test]
    fn pat_and_pmt_crc_is_self_consistent() {
        let mut muxer = TsMuxer::new();
        let pat = muxer.build_pat();
        assert_eq!(pat.len(), TS_PACKET_LEN);
        assert_eq!(pat[0], SYNC_BYTE);

        let pmt = muxer.build_pmt();
        assert_eq!(pmt.len(), TS_PACKET_LEN);
        assert_eq!(pmt[0], SYNC_BYTE);
    }

    #[test]
    fn keyframe_sets_random_access_indicator() {
        let mut muxer = TsMuxer::new();
        muxer.start_segment();
        let emission = muxer.write_frame(&[&[0x65, 0x01]], true, &params(), 25.0);
        // First packet after PAT+PMT carries the adaptation field.
        let video_packet = emission
            .packets
            .chunks(TS_PACKET_LEN)
            .find(|c| (((c[1] & 0x1F) as u16) << 8 | c[2] as u16) == VIDEO_PID)
            .unwrap();
        assert_ne!(video_packet[3] & 0x20, 0, "adaptation field must be present");
        let adaptation_flags = video_packet[5];
        assert_ne!(adaptation_flags & 0x40, 0, "random_access_indicator must be set");
    }
}
