//! H.264 NAL unit framing conversions.
//!
//! Two wire framings coexist in this codebase: AVCC (each NAL unit prefixed
//! by a fixed-width big-endian length) and Annex B (each NAL unit preceded
//! by a `00 00 01` or `00 00 00 01` start code). FLV/MPEG-TS containers
//! disagree on which one they want, so every consumer routes through here
//! rather than repeating NAL-length arithmetic locally.

use bytes::{BufMut, Bytes, BytesMut};

/// NAL type codes this codebase cares about. H.264 defines more; we only
/// ever branch on these.
pub mod nal_type {
    pub const SLICE_NON_IDR: u8 = 1;
    pub const IDR: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
    pub const FILLER: u8 = 12;
}

/// Byte range of one NAL unit (payload only, no prefix/start-code) within
/// a parsed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalRange {
    pub start: usize,
    pub end: usize,
}

impl NalRange {
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    #[inline]
    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end]
    }
}

/// Errors raised by NAL parsing.
#[derive(Debug, thiserror::Error)]
pub enum NalError {
    #[error("AVCC length prefix {declared} exceeds remaining buffer ({remaining} bytes)")]
    MalformedAvcc { declared: usize, remaining: usize },
}

/// Result of a partial/failed AVCC parse: whatever NAL units were found
/// before the first malformed prefix, plus the error that stopped parsing.
#[derive(Debug)]
pub struct PartialParse {
    pub nals: Vec<NalRange>,
    pub error: NalError,
}

/// Extract the NAL type (lower 5 bits of the NAL header byte).
#[inline]
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

#[inline]
pub fn is_sps(nal: &[u8]) -> bool {
    nal_type(nal) == Some(nal_type::SPS)
}

#[inline]
pub fn is_pps(nal: &[u8]) -> bool {
    nal_type(nal) == Some(nal_type::PPS)
}

#[inline]
pub fn is_idr(nal: &[u8]) -> bool {
    nal_type(nal) == Some(nal_type::IDR)
}

/// Parse an AVCC buffer (NAL units each prefixed by a `prefix_size`-byte
/// big-endian length) into NAL byte ranges.
///
/// On a malformed prefix (length exceeds what remains in the buffer),
/// parsing stops and returns everything parsed so far alongside the error,
/// matching ffmpeg-style "best effort" demuxing rather than failing the
/// whole buffer.
pub fn parse_avcc(buf: &[u8], prefix_size: u8) -> Result<Vec<NalRange>, PartialParse> {
    let prefix_size = prefix_size.clamp(1, 4) as usize;
    let mut nals = Vec::new();
    let mut pos = 0;

    while pos + prefix_size <= buf.len() {
        let len = read_be_len(&buf[pos..pos + prefix_size]);
        let nal_start = pos + prefix_size;
        let remaining = buf.len().saturating_sub(nal_start);

        if len > remaining {
            return Err(PartialParse {
                nals,
                error: NalError::MalformedAvcc {
                    declared: len,
                    remaining,
                },
            });
        }

        nals.push(NalRange {
            start: nal_start,
            end: nal_start + len,
        });
        pos = nal_start + len;
    }

    Ok(nals)
}

fn read_be_len(bytes: &[u8]) -> usize {
    bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize)
}

/// Scan an Annex B buffer for `00 00 01` / `00 00 00 01` start codes and
/// return the byte range of each NAL unit's payload (start code excluded).
/// Emulation-prevention bytes inside the payload are left untouched —
/// callers that need RBSP must strip them separately.
pub fn parse_annex_b(buf: &[u8]) -> Vec<NalRange> {
    let starts = start_code_positions(buf);
    let mut nals = Vec::with_capacity(starts.len());

    for (i, &(code_pos, code_len)) in starts.iter().enumerate() {
        let nal_start = code_pos + code_len;
        let nal_end = starts
            .get(i + 1)
            .map(|&(next_pos, _)| next_pos)
            .unwrap_or(buf.len());
        if nal_start < nal_end {
            nals.push(NalRange {
                start: nal_start,
                end: nal_end,
            });
        }
    }

    nals
}

/// Locate every Annex-B start code in `buf`, returning (position, code_len).
fn start_code_positions(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut positions = Vec::new();
    let mut i = 0;

    while i + 3 <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
            positions.push((i, 3));
            i += 3;
        } else if i + 4 <= buf.len() && buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 0 && buf[i + 3] == 1 {
            positions.push((i, 4));
            i += 4;
        } else {
            i += 1;
        }
    }

    positions
}

/// Convert an AVCC buffer to Annex B, writing a 4-byte start code before
/// each NAL unit. When `filter_parameter_sets` is set, SPS/PPS NALs are
/// dropped (the caller carries them out-of-band, e.g. as extradata).
pub fn avcc_to_annex_b(buf: &[u8], prefix_size: u8, filter_parameter_sets: bool) -> Result<Bytes, NalError> {
    let nals = match parse_avcc(buf, prefix_size) {
        Ok(nals) => nals,
        Err(partial) => return Err(partial.error),
    };

    let mut out = BytesMut::with_capacity(buf.len() + nals.len() * 4);
    for range in nals {
        let nal = range.slice(buf);
        if filter_parameter_sets && (is_sps(nal) || is_pps(nal)) {
            continue;
        }
        out.put_slice(&[0, 0, 0, 1]);
        out.put_slice(nal);
    }

    Ok(out.freeze())
}

/// Convert an Annex B buffer to AVCC with a 4-byte big-endian length
/// prefix per NAL unit (the direction MPEG-TS/WebSocket input takes when
/// handed to the FLV muxer). SPS/PPS are filtered the same way as
/// [`avcc_to_annex_b`] when `filter_parameter_sets` is set.
pub fn annex_b_to_avcc(buf: &[u8], filter_parameter_sets: bool) -> Bytes {
    let nals = parse_annex_b(buf);
    let mut out = BytesMut::with_capacity(buf.len());

    for range in nals {
        let nal = range.slice(buf);
        if filter_parameter_sets && (is_sps(nal) || is_pps(nal)) {
            continue;
        }
        out.put_u32(nal.len() as u32);
        out.put_slice(nal);
    }

    out.freeze()
}

/// Build an Annex-B keyframe buffer: SPS, then PPS, then the IDR NAL,
/// each prefixed with a 4-byte start code. Used for the WebSocket
/// late-join frame and as the C7 snapshot decoder's input.
pub fn build_annex_b_keyframe(sps: &[u8], pps: &[u8], idr_nal: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(sps.len() + pps.len() + idr_nal.len() + 12);
    for nal in [sps, pps, idr_nal] {
        out.put_slice(&[0, 0, 0, 1]);
        out.put_slice(nal);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avcc_encode(nals: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for nal in nals {
            buf.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            buf.extend_from_slice(nal);
        }
        buf
    }

    #[test]
    fn parse_avcc_round_trips_for_all_prefix_sizes() {
        let nals: &[&[u8]] = &[&[0x67, 0x01, 0x02], &[0x68, 0x03], &[0x65, 0xAA, 0xBB, 0xCC]];

        for prefix_size in 1u8..=4 {
            let mut buf = Vec::new();
            for nal in nals {
                let len_bytes = (nal.len() as u32).to_be_bytes();
                buf.extend_from_slice(&len_bytes[4 - prefix_size as usize..]);
                buf.extend_from_slice(nal);
            }

            let parsed = parse_avcc(&buf, prefix_size).expect("valid buffer");
            assert_eq!(parsed.len(), nals.len());

            let mut reassembled = Vec::new();
            for (range, nal) in parsed.iter().zip(nals) {
                let len_bytes = (nal.len() as u32).to_be_bytes();
                reassembled.extend_from_slice(&len_bytes[4 - prefix_size as usize..]);
                reassembled.extend_from_slice(range.slice(&buf));
            }
            assert_eq!(reassembled, buf);
        }
    }

    #[test]
    fn parse_avcc_stops_at_malformed_prefix() {
        let mut buf = avcc_encode(&[&[0x67, 0x01]]);
        buf.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]); // declares a huge NAL with no data
        let err = parse_avcc(&buf, 4).unwrap_err();
        assert_eq!(err.nals.len(), 1);
        assert!(matches!(err.error, NalError::MalformedAvcc { .. }));
    }

    #[test]
    fn parse_annex_b_handles_3_and_4_byte_start_codes() {
        let buf = [
            0, 0, 0, 1, 0x67, 0xAA, // SPS, 4-byte start code
            0, 0, 1, 0x68, 0xBB, // PPS, 3-byte start code
        ];
        let nals = parse_annex_b(&buf);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0].slice(&buf), &[0x67, 0xAA]);
        assert_eq!(nals[1].slice(&buf), &[0x68, 0xBB]);
    }

    #[test]
    fn annex_b_avcc_round_trip_excludes_parameter_sets_when_filtered() {
        let sps: &[u8] = &[0x67, 0x01];
        let pps: &[u8] = &[0x68, 0x02];
        let idr: &[u8] = &[0x65, 0x03, 0x04];

        let annex_b = build_annex_b_keyframe(sps, pps, idr);
        let avcc = annex_b_to_avcc(&annex_b, true);
        let back = avcc_to_annex_b(&avcc, 4, false).unwrap();

        let expected = {
            let mut b = BytesMut::new();
            b.put_slice(&[0, 0, 0, 1]);
            b.put_slice(idr);
            b.freeze()
        };
        assert_eq!(back, expected);
    }

    #[test]
    fn nal_type_extracts_low_five_bits() {
        assert_eq!(nal_type(&[0x67]), Some(nal_type::SPS));
        assert_eq!(nal_type(&[0x68]), Some(nal_type::PPS));
        assert_eq!(nal_type(&[0x65]), Some(nal_type::IDR));
        assert_eq!(nal_type(&[]), None);
    }
}
