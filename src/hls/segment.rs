//! Segment and partial-segment data held by the HLS engine.

use std::time::Instant;

use bytes::Bytes;

/// One LL-HLS partial segment: a byte range within its parent segment's
/// buffer, a duration derived from frame count ÷ measured FPS (never
/// from PTS deltas, so parts always sum exactly to the segment
/// duration), and whether it opens on a keyframe.
#[derive(Debug, Clone)]
pub struct Part {
    pub index: u32,
    pub start: usize,
    pub end: usize,
    pub duration_secs: f64,
    pub independent: bool,
}

/// A finalized TS segment: whole 188-byte packets, a monotonic media
/// sequence number, and the PTS (90 kHz) of its first frame.
#[derive(Debug, Clone)]
pub struct Segment {
    pub msn: u64,
    pub data: Bytes,
    pub duration_secs: f64,
    pub start_pts_90k: u64,
    pub parts: Vec<Part>,
    pub created_at: Instant,
}

impl Segment {
    pub fn byte_range(&self, start: usize, end: usize) -> Bytes {
        self.data.slice(start..end.min(self.data.len()))
    }

    pub fn part_bytes(&self, part_index: u32) -> Option<Bytes> {
        self.parts
            .iter()
            .find(|p| p.index == part_index)
            .map(|p| self.byte_range(p.start, p.end))
    }
}

/// The segment currently being assembled. Promoted to a [`Segment`] on
/// the next keyframe once `segment_target` has elapsed.
pub struct InProgressSegment {
    pub msn: u64,
    pub buf: Vec<u8>,
    pub parts: Vec<Part>,
    pub part_start: usize,
    pub part_frame_count: u32,
    pub part_is_independent: bool,
    pub frame_count: u64,
    pub start_time: Instant,
    pub start_pts_90k: Option<u64>,
}

impl InProgressSegment {
    pub fn new(msn: u64) -> Self {
        Self {
            msn,
            buf: Vec::new(),
            parts: Vec::new(),
            part_start: 0,
            part_frame_count: 0,
            part_is_independent: false,
            frame_count: 0,
            start_time: Instant::now(),
            start_pts_90k: None,
        }
    }

    pub fn next_part_index(&self) -> u32 {
        self.parts.len() as u32
    }

    /// Close the part currently open, recording its byte range and
    /// frame-count-derived duration. No-op if no frames have been
    /// written to it yet.
    pub fn close_part(&mut self, fps: f64) {
        if self.part_frame_count == 0 {
            return;
        }
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 25.0 };
        let duration = (self.part_frame_count as f64 / fps).clamp(0.05, 2.0);

        self.parts.push(Part {
            index: self.next_part_index(),
            start: self.part_start,
            end: self.buf.len(),
            duration_secs: duration,
            independent: self.part_is_independent,
        });

        self.part_start = self.buf.len();
        self.part_frame_count = 0;
        self.part_is_independent = false;
    }

    pub fn total_duration_from_parts(&self) -> f64 {
        self.parts.iter().map(|p| p.duration_secs).sum()
    }
}
