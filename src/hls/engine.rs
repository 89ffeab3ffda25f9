//! The HLS engine: owns segment storage, the TS muxer, and blocking
//! playlist waiters. One instance per ingest session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::AppError;
use crate::mpegts::{ParameterSet, TsMuxer};
use crate::nal::{self, NalRange};

use super::config::HlsConfig;
use super::playlist::{self, open_parts_from};
use super::pts_adjust;
use super::segment::{InProgressSegment, Segment};

const BLOCKING_TIMEOUT: Duration = Duration::from_secs(30);
const EVICTION_GRACE: Duration = Duration::from_secs(30);
/// A segment's accumulated bytes may not exceed this before the engine
/// drops it as an overflow rather than let it grow unbounded.
const MAX_SEGMENT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterOutcome {
    Ready,
    Evicted,
    Cancelled,
}

struct FpsEstimator {
    ema: f64,
    last_arrival: Option<Instant>,
}

impl FpsEstimator {
    fn new() -> Self {
        Self {
            ema: 25.0,
            last_arrival: None,
        }
    }

    fn observe(&mut self, now: Instant) -> f64 {
        if let Some(last) = self.last_arrival {
            let delta = now.duration_since(last).clamp(Duration::from_millis(1), Duration::from_millis(1000));
            let instantaneous = 1.0 / delta.as_secs_f64();
            self.ema = 0.5 * instantaneous + 0.5 * self.ema;
        }
        self.last_arrival = Some(now);
        self.ema
    }
}

struct EngineState {
    muxer: TsMuxer,
    segments: VecDeque<Segment>,
    current: Option<InProgressSegment>,
    next_msn: u64,
    base_media_sequence: u64,
    waiting_for_keyframe: bool,
    legacy_pts_offset: u64,
    window_base_pts: u64,
    fps: FpsEstimator,
}

impl EngineState {
    fn new() -> Self {
        Self {
            muxer: TsMuxer::new(),
            segments: VecDeque::new(),
            current: None,
            next_msn: 0,
            base_media_sequence: 0,
            waiting_for_keyframe: true,
            legacy_pts_offset: 0,
            window_base_pts: 0,
            fps: FpsEstimator::new(),
        }
    }
}

pub struct HlsEngine {
    config: HlsConfig,
    session_id: u64,
    state: Mutex<EngineState>,
    waiters: Mutex<HashMap<(u64, u32), Vec<oneshot::Sender<WaiterOutcome>>>>,
}

impl HlsEngine {
    pub fn new(config: HlsConfig) -> Arc<Self> {
        let config = config.clamped();
        let session_id = rand::thread_rng().gen_range(1..=u32::MAX as u64);
        Arc::new(Self {
            config,
            session_id,
            state: Mutex::new(EngineState::new()),
            waiters: Mutex::new(HashMap::new()),
        })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn has_keyframe(&self) -> bool {
        !self.state.lock().waiting_for_keyframe
    }

    /// Full reset on ingest reconnect: drop all segments and waiters,
    /// reset the muxer's CCs/PTS, re-arm `waiting_for_keyframe`.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            *state = EngineState::new();
            state.muxer.reset();
        }
        let mut waiters = self.waiters.lock();
        for (_, senders) in waiters.drain() {
            for tx in senders {
                let _ = tx.send(WaiterOutcome::Cancelled);
            }
        }
    }

    /// Feed one H.264 packet (AVCC-framed, SPS/PPS excluded) into the
    /// engine.
    pub fn push_packet(&self, payload: &[u8], is_keyframe: bool, params: &ParameterSet, prefix_size: u8) -> Result<(), AppError> {
        let nals = match nal::parse_avcc(payload, prefix_size) {
            Ok(nals) => nals,
            Err(partial) => {
                tracing::warn!(error = %partial.error, "malformed AVCC packet, using partial parse");
                partial.nals
            }
        };
        let nal_slices: Vec<&[u8]> = nals.iter().map(|r| r.slice(payload)).collect();

        let mut state = self.state.lock();

        if state.waiting_for_keyframe {
            if !is_keyframe {
                return Ok(());
            }
            state.waiting_for_keyframe = false;
        }

        let now = Instant::now();
        let fps = state.fps.observe(now);

        if state.current.is_none() {
            self.open_new_segment(&mut state);
        }

        if is_keyframe {
            let elapsed = state
                .current
                .as_ref()
                .map(|c| c.start_time.elapsed())
                .unwrap_or_default();
            if elapsed.as_secs_f64() >= self.config.segment_target_secs() {
                self.finalize_current_segment(&mut state, fps);
                self.open_new_segment(&mut state);
            }
        }

        let emission = state.muxer.write_frame(&nal_slices, is_keyframe, params, fps);
        if emission.truncated {
            tracing::warn!("frame truncated: exceeded per-frame TS packet cap");
        }

        let part_threshold = self.config.part_frame_threshold(fps);
        let (msn, closed_part_index) = {
            let current = state.current.as_mut().expect("segment opened above");
            if current.frame_count == 0 {
                current.start_pts_90k = Some(emission.frame_pts);
            }
            if current.part_frame_count == 0 {
                current.part_is_independent = is_keyframe;
            }
            current.buf.extend_from_slice(&emission.packets);
            current.frame_count += 1;
            current.part_frame_count += 1;

            let mut closed = None;
            if current.part_frame_count >= part_threshold {
                current.close_part(fps);
                closed = current.parts.last().map(|p| p.index);
            }

            if current.buf.len() > MAX_SEGMENT_BYTES {
                tracing::warn!(msn = current.msn, "segment exceeded 4 MiB, dropping early");
                let msn = current.msn;
                state.current = None;
                (msn, None)
            } else {
                (current.msn, closed)
            }
        };

        drop(state);

        if let Some(part_index) = closed_part_index {
            self.notify_up_to(msn, part_index, WaiterOutcome::Ready);
        }

        self.evict_stale();
        Ok(())
    }

    fn open_new_segment(&self, state: &mut EngineState) {
        let msn = state.next_msn;
        state.next_msn += 1;
        state.current = Some(InProgressSegment::new(msn));
        state.muxer.start_segment();
    }

    fn finalize_current_segment(&self, state: &mut EngineState, fps: f64) {
        let Some(mut current) = state.current.take() else {
            return;
        };
        current.close_part(fps);

        let duration = if !current.parts.is_empty() {
            current.total_duration_from_parts()
        } else {
            current.frame_count as f64 / fps
        }
        .clamp(0.1, 5.0);

        let segment = Segment {
            msn: current.msn,
            data: Bytes::from(current.buf),
            duration_secs: duration,
            start_pts_90k: current.start_pts_90k.unwrap_or(0),
            parts: current.parts,
            created_at: Instant::now(),
        };
        state.segments.push_back(segment);

        while state.segments.len() > self.config.max_segments() {
            self.evict_oldest(state);
        }
    }

    fn evict_oldest(&self, state: &mut EngineState) {
        if let Some(evicted) = state.segments.pop_front() {
            state.legacy_pts_offset = state.legacy_pts_offset.saturating_add((evicted.duration_secs * 90_000.0) as u64);
            state.base_media_sequence += 1;
            state.window_base_pts = state.segments.front().map(|s| s.start_pts_90k).unwrap_or(state.window_base_pts);
            self.notify_up_to(evicted.msn, u32::MAX, WaiterOutcome::Evicted);
        }
    }

    /// Drop segments older than `window + 30s` grace even if the count
    /// hasn't exceeded `max_segments` (e.g. a slow producer).
    fn evict_stale(&self) {
        let mut state = self.state.lock();
        let cutoff = Duration::from_secs_f64(self.config.window_secs) + EVICTION_GRACE;
        while let Some(front) = state.segments.front() {
            if front.created_at.elapsed() > cutoff {
                self.evict_oldest(&mut state);
            } else {
                break;
            }
        }
    }

    fn notify_up_to(&self, msn: u64, part_index: u32, outcome: WaiterOutcome) {
        let mut waiters = self.waiters.lock();
        let keys: Vec<(u64, u32)> = waiters
            .keys()
            .copied()
            .filter(|&(m, p)| m < msn || (m == msn && p <= part_index))
            .collect();
        for key in keys {
            if let Some(senders) = waiters.remove(&key) {
                for tx in senders {
                    let _ = tx.send(outcome);
                }
            }
        }
    }

    pub fn legacy_playlist(&self) -> Result<String, AppError> {
        let state = self.state.lock();
        if state.waiting_for_keyframe {
            return Err(AppError::NotReady("no keyframe received yet".into()));
        }
        let segments: Vec<Segment> = state.segments.iter().cloned().collect();
        Ok(playlist::render_legacy(
            self.session_id,
            state.base_media_sequence,
            &segments,
            &self.config,
        ))
    }

    fn render_modern_locked(&self, state: &EngineState) -> String {
        let (open_msn, open_parts) = match &state.current {
            Some(c) => (Some(c.msn), open_parts_from(c)),
            None => (None, Vec::new()),
        };
        let segments: Vec<Segment> = state.segments.iter().cloned().collect();
        playlist::render_modern(
            self.session_id,
            state.base_media_sequence,
            &segments,
            open_msn,
            &open_parts,
            &self.config,
        )
    }

    fn part_available(&self, state: &EngineState, msn: u64, part: u32) -> bool {
        if let Some(seg) = state.segments.iter().find(|s| s.msn == msn) {
            return seg.parts.iter().any(|p| p.index == part);
        }
        if let Some(current) = &state.current {
            if current.msn == msn {
                return current.parts.iter().any(|p| p.index == part);
            }
        }
        false
    }

    /// Render the modern LL-HLS playlist. When `msn`/`part` are given,
    /// blocks (up to 30s) until that part is available, proven evicted,
    /// or the deadline elapses — in every case it serves whatever
    /// playlist snapshot is current at that point.
    pub async fn modern_playlist(&self, msn: Option<u64>, part: Option<u32>) -> Result<String, AppError> {
        {
            let state = self.state.lock();
            if state.waiting_for_keyframe {
                return Err(AppError::NotReady("no keyframe received yet".into()));
            }
        }

        let (target_msn, target_part) = match (msn, part) {
            (Some(m), p) => (m, p.unwrap_or(0)),
            (None, _) => {
                let state = self.state.lock();
                return Ok(self.render_modern_locked(&state));
            }
        };

        let rx = {
            let state = self.state.lock();
            if target_msn < state.base_media_sequence || self.part_available(&state, target_msn, target_part) {
                return Ok(self.render_modern_locked(&state));
            }
            let (tx, rx) = oneshot::channel();
            drop(state);
            self.waiters.lock().entry((target_msn, target_part)).or_default().push(tx);
            rx
        };

        let _ = timeout(BLOCKING_TIMEOUT, rx).await;
        let state = self.state.lock();
        Ok(self.render_modern_locked(&state))
    }

    pub fn segment_bytes(&self, msn: u64, legacy: bool) -> Option<Bytes> {
        let state = self.state.lock();
        let segment = state.segments.iter().find(|s| s.msn == msn)?;
        if legacy {
            Some(pts_adjust::apply_legacy_offset(&segment.data, state.window_base_pts))
        } else {
            Some(segment.data.clone())
        }
    }

    pub fn part_bytes(&self, msn: u64, part_index: u32) -> Option<Bytes> {
        let state = self.state.lock();
        if let Some(segment) = state.segments.iter().find(|s| s.msn == msn) {
            return segment.part_bytes(part_index);
        }
        if let Some(current) = &state.current {
            if current.msn == msn {
                if let Some(p) = current.parts.iter().find(|p| p.index == part_index) {
                    return Some(Bytes::copy_from_slice(&current.buf[p.start..p.end]));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParameterSet {
        ParameterSet {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]),
            pps: Bytes::from_static(&[0x68, 0xEB]),
            nal_length_size: 4,
        }
    }

    fn avcc_frame(nal: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        buf.extend_from_slice(nal);
        buf
    }

    #[tokio::test]
    async fn no_segments_before_first_keyframe() {
        let engine = HlsEngine::new(HlsConfig::default());
        assert!(!engine.has_keyframe());
        engine.push_packet(&avcc_frame(&[0x61, 0x01]), false, &params(), 4).unwrap();
        assert!(!engine.has_keyframe());
        assert!(engine.legacy_playlist().is_err());
    }

    #[tokio::test]
    async fn first_keyframe_opens_engine() {
        let engine = HlsEngine::new(HlsConfig::default());
        engine.push_packet(&avcc_frame(&[0x65, 0x01]), true, &params(), 4).unwrap();
        assert!(engine.has_keyframe());
    }

    #[tokio::test]
    async fn modern_playlist_without_query_returns_immediately() {
        let engine = HlsEngine::new(HlsConfig::default());
        engine.push_packet(&avcc_frame(&[0x65, 0x01]), true, &params(), 4).unwrap();
        let playlist = engine.modern_playlist(None, None).await.unwrap();
        assert!(playlist.contains("#EXTM3U"));
    }
}
