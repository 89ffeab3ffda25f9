//! Playlist rendering: the modern (LL-HLS) and legacy (v3) flavors.
//!
//! Both are pure functions over already-collected segment/part state so
//! they can be unit tested without touching the engine's locks.

use std::fmt::Write as _;

use super::config::HlsConfig;
use super::segment::{InProgressSegment, Segment};

/// One entry in the currently-building segment, mirrored out of
/// [`InProgressSegment`] so the renderer doesn't need the engine's
/// internal lock type.
pub struct OpenPart {
    pub index: u32,
    pub duration_secs: f64,
    pub independent: bool,
}

pub fn render_modern(
    session_id: u64,
    base_media_sequence: u64,
    segments: &[Segment],
    open_segment_msn: Option<u64>,
    open_parts: &[OpenPart],
    config: &HlsConfig,
) -> String {
    let mut out = String::new();
    let target_duration = config.segment_target_secs().ceil() as u64;
    let part_target = config.part_target_secs();

    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:6");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target_duration}");
    let _ = writeln!(out, "#EXT-X-PART-INF:PART-TARGET={part_target:.3}");
    let _ = writeln!(
        out,
        "#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK={:.3},HOLD-BACK={:.3}",
        part_target * 4.0,
        config.segment_target_secs() * 3.0,
    );

    let skip_oldest = 2.min(segments.len().saturating_sub(1)) as u64;
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", base_media_sequence + skip_oldest);

    for segment in segments {
        for part in &segment.parts {
            write_part_line(&mut out, session_id, segment.msn, part.index, part.duration_secs, part.independent);
        }
        let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration_secs);
        let _ = writeln!(out, "segment-{session_id}-{}.ts", segment.msn);
    }

    if let Some(msn) = open_segment_msn {
        for part in open_parts {
            write_part_line(&mut out, session_id, msn, part.index, part.duration_secs, part.independent);
        }
        let next_index = open_parts.last().map(|p| p.index + 1).unwrap_or(0);
        let _ = writeln!(
            out,
            "#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"part-{session_id}-{msn}.{next_index}.ts\""
        );
    }

    out
}

fn write_part_line(out: &mut String, session_id: u64, msn: u64, index: u32, duration: f64, independent: bool) {
    let independent_attr = if independent { ",INDEPENDENT=YES" } else { "" };
    let _ = writeln!(
        out,
        "#EXT-X-PART:DURATION={duration:.3},URI=\"part-{session_id}-{msn}.{index}.ts\"{independent_attr}"
    );
}

/// Legacy (v3) playlist. `EXT-X-DISCONTINUITY-SEQUENCE` is set equal to
/// `EXT-X-MEDIA-SEQUENCE`; this is nonstandard (a real discontinuity
/// sequence counts discontinuity tags, not segments) but is preserved
/// because the legacy clients this flavor targets depend on it.
pub fn render_legacy(session_id: u64, base_media_sequence: u64, segments: &[Segment], config: &HlsConfig) -> String {
    let mut out = String::new();
    let target_duration = config.segment_target_secs().ceil() as u64;

    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:3");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target_duration}");
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{base_media_sequence}");
    let _ = writeln!(out, "#EXT-X-DISCONTINUITY-SEQUENCE:{base_media_sequence}");

    for segment in segments {
        let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration_secs);
        let _ = writeln!(out, "legacy-segment-{session_id}-{}.ts", segment.msn);
    }

    out
}

pub fn open_parts_from(in_progress: &InProgressSegment) -> Vec<OpenPart> {
    in_progress
        .parts
        .iter()
        .map(|p| OpenPart {
            index: p.index,
            duration_secs: p.duration_secs,
            independent: p.independent,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::hls::segment::Part;

    fn seg(msn: u64) -> Segment {
        Segment {
            msn,
            data: bytes::Bytes::from_static(&[0x47; 188]),
            duration_secs: 0.8,
            start_pts_90k: 0,
            parts: vec![Part {
                index: 0,
                start: 0,
                end: 188,
                duration_secs: 0.8,
                independent: true,
            }],
            created_at: Instant::now(),
        }
    }

    #[test]
    fn modern_playlist_includes_required_tags() {
        let cfg = HlsConfig::default();
        let segments = vec![seg(10), seg(11)];
        let playlist = render_modern(42, 9, &segments, None, &[], &cfg);
        assert!(playlist.contains("#EXT-X-VERSION:6"));
        assert!(playlist.contains("#EXT-X-PART-INF"));
        assert!(playlist.contains("#EXT-X-SERVER-CONTROL"));
        assert!(playlist.contains("segment-42-10.ts"));
    }

    #[test]
    fn legacy_discontinuity_sequence_equals_media_sequence() {
        let cfg = HlsConfig::default();
        let segments = vec![seg(5)];
        let playlist = render_legacy(7, 5, &segments, &cfg);
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:5"));
        assert!(playlist.contains("#EXT-X-DISCONTINUITY-SEQUENCE:5"));
    }

    #[test]
    fn skip_oldest_caps_at_two() {
        let cfg = HlsConfig::default();
        let segments: Vec<Segment> = (0..5).map(seg).collect();
        let playlist = render_modern(1, 100, &segments, None, &[], &cfg);
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:102"));
    }
}
