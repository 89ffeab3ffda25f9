//! The packet router: single entry point for ingest frames. Fans out
//! to the HLS engine, WebSocket clients, and FLV clients for H.264
//! input; bypasses all of that for MJPEG input.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use xxhash_rust::xxh3::xxh3_64;

use crate::consumer::ConsumerRegistry;
use crate::flv::{AvcDecoderConfig, FlvMuxer};
use crate::hls::HlsEngine;
use crate::nal::{self, NalRange};
use crate::mpegts::ParameterSet;

const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// One H.264 access unit handed to [`PacketRouter::push_h264`]. The
/// payload is AVCC-framed and excludes SPS/PPS, which travel
/// out-of-band via [`PacketRouter::update_parameter_set`].
pub struct H264Packet {
    pub payload: Bytes,
    pub is_keyframe: bool,
    pub pts_ms: u64,
}

/// A cached frame buffer with a content hash and monotonic sequence
/// number, so two callers holding distinct-but-identical buffers don't
/// falsely invalidate one another's cache (see the snapshot decoder).
#[derive(Debug, Clone)]
pub struct CachedFrame {
    pub data: Bytes,
    pub content_hash: u64,
    pub sequence: u64,
}

impl CachedFrame {
    fn new(data: Bytes, sequence: u64) -> Self {
        let content_hash = xxh3_64(&data);
        Self { data, content_hash, sequence }
    }
}

#[derive(Debug, Default)]
struct RouterStats {
    total_frames: u64,
    dropped_small_packets: u64,
    window_start: Option<Instant>,
    window_frames: u64,
    last_stats_log: Option<Instant>,
}

pub struct PacketRouter {
    hls: Arc<HlsEngine>,
    ws_clients: Arc<ConsumerRegistry<()>>,
    flv_clients: Arc<ConsumerRegistry<FlvMuxer>>,
    mjpeg_clients: Arc<ConsumerRegistry<()>>,
    params: ArcSwap<ParameterSet>,
    prefix_size: AtomicU64,
    last_keyframe: RwLock<Option<CachedFrame>>,
    last_jpeg: RwLock<Option<CachedFrame>>,
    frame_sequence: AtomicU64,
    has_keyframe: AtomicBool,
    last_keyframe_is_jpeg: AtomicBool,
    measured_input_fps: AtomicU64, // bit-cast f64 via to_bits, see `measured_fps`
    stats: Mutex<RouterStats>,
}

impl PacketRouter {
    pub fn new(hls: Arc<HlsEngine>) -> Arc<Self> {
        Arc::new(Self {
            hls,
            ws_clients: ConsumerRegistry::new(),
            flv_clients: ConsumerRegistry::new(),
            mjpeg_clients: ConsumerRegistry::new(),
            params: ArcSwap::from_pointee(ParameterSet::default()),
            prefix_size: AtomicU64::new(4),
            last_keyframe: RwLock::new(None),
            last_jpeg: RwLock::new(None),
            frame_sequence: AtomicU64::new(0),
            has_keyframe: AtomicBool::new(false),
            last_keyframe_is_jpeg: AtomicBool::new(false),
            measured_input_fps: AtomicU64::new(25.0f64.to_bits()),
            stats: Mutex::new(RouterStats::default()),
        })
    }

    pub fn ws_clients(&self) -> &Arc<ConsumerRegistry<()>> {
        &self.ws_clients
    }

    pub fn flv_clients(&self) -> &Arc<ConsumerRegistry<FlvMuxer>> {
        &self.flv_clients
    }

    pub fn mjpeg_clients(&self) -> &Arc<ConsumerRegistry<()>> {
        &self.mjpeg_clients
    }

    pub fn hls(&self) -> &Arc<HlsEngine> {
        &self.hls
    }

    pub fn has_keyframe(&self) -> bool {
        self.has_keyframe.load(Ordering::Acquire)
    }

    pub fn last_keyframe_is_jpeg(&self) -> bool {
        self.last_keyframe_is_jpeg.load(Ordering::Acquire)
    }

    pub fn measured_fps(&self) -> f64 {
        f64::from_bits(self.measured_input_fps.load(Ordering::Relaxed))
    }

    pub fn dropped_small_packets(&self) -> u64 {
        self.stats.lock().dropped_small_packets
    }

    /// The cached keyframe: Annex-B `SPS ‖ PPS ‖ IDR` in H.264 mode, or
    /// the last JPEG in MJPEG mode.
    pub fn cached_frame(&self) -> Option<CachedFrame> {
        if self.last_keyframe_is_jpeg() {
            self.last_jpeg.read().clone()
        } else {
            self.last_keyframe.read().clone()
        }
    }

    /// Replace the decoder extradata atomically. Readers take a
    /// per-packet snapshot via `ArcSwap::load`.
    pub fn update_parameter_set(&self, params: ParameterSet, prefix_size: u8) {
        self.prefix_size.store(prefix_size as u64, Ordering::Release);
        self.params.store(Arc::new(params));
    }

    fn next_sequence(&self) -> u64 {
        self.frame_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Single entry point for H.264 access units. Forwards
    /// unconditionally to the HLS engine, then fans out to WebSocket
    /// and FLV clients as needed.
    pub fn push_h264(&self, packet: H264Packet) {
        self.record_arrival();

        let params = self.params.load_full();
        let prefix_size = self.prefix_size.load(Ordering::Acquire) as u8;

        if let Err(err) = self.hls.push_packet(&packet.payload, packet.is_keyframe, &params, prefix_size) {
            tracing::warn!(error = %err, "HLS engine rejected packet");
        }

        let nals = match nal::parse_avcc(&packet.payload, prefix_size) {
            Ok(nals) => nals,
            Err(partial) => {
                self.stats.lock().dropped_small_packets += 1;
                partial.nals
            }
        };

        // Building the Annex-B frame is only worth it when a WebSocket
        // client might read it, or to refresh the keyframe cache.
        let needs_annex_b = self.ws_clients.client_count() > 0 || packet.is_keyframe;
        let annex_b_frame = if needs_annex_b {
            let mut body = nal::avcc_to_annex_b(&packet.payload, prefix_size, false).unwrap_or_default();
            if packet.is_keyframe && params.is_ready() {
                let mut with_params = bytes::BytesMut::with_capacity(params.sps.len() + params.pps.len() + body.len() + 8);
                with_params.extend_from_slice(&[0, 0, 0, 1]);
                with_params.extend_from_slice(&params.sps);
                with_params.extend_from_slice(&[0, 0, 0, 1]);
                with_params.extend_from_slice(&params.pps);
                with_params.extend_from_slice(&body);
                body = with_params.freeze();
            }
            Some(body)
        } else {
            None
        };

        if packet.is_keyframe {
            self.has_keyframe.store(true, Ordering::Release);
            self.last_keyframe_is_jpeg.store(false, Ordering::Release);
            if let Some(ref frame) = annex_b_frame {
                *self.last_keyframe.write() = Some(CachedFrame::new(frame.clone(), self.next_sequence()));
            }
        }

        if self.ws_clients.client_count() > 0 {
            if let Some(frame) = annex_b_frame {
                self.ws_clients.broadcast(frame);
            }
        }

        if self.flv_clients.client_count() > 0 {
            let config = AvcDecoderConfig {
                sps: params.sps.clone(),
                pps: params.pps.clone(),
                nalu_length_size: params.nal_length_size,
            };
            let pts_ms = packet.pts_ms as u32;
            let is_keyframe = packet.is_keyframe;
            let nal_refs: Vec<NalRange> = nals.clone();
            let fps = self.measured_fps();
            self.flv_clients.for_each_mut(|_id, muxer| {
                if muxer.needs_keyframe_to_start() && !is_keyframe {
                    return None;
                }
                let out = muxer.write_frame(&nal_refs, &packet.payload, is_keyframe, &config, pts_ms, 0, 0, fps);
                if out.is_empty() {
                    None
                } else {
                    Some(out)
                }
            });
        }

        self.maybe_log_stats();
    }

    /// MJPEG source mode: caches the frame and fans out to MJPEG
    /// clients. Bypasses the H.264 pipeline entirely.
    pub fn push_jpeg(&self, frame: Bytes) {
        self.record_arrival();
        self.has_keyframe.store(true, Ordering::Release);
        self.last_keyframe_is_jpeg.store(true, Ordering::Release);
        *self.last_jpeg.write() = Some(CachedFrame::new(frame.clone(), self.next_sequence()));
        self.mjpeg_clients.broadcast(frame);
        self.maybe_log_stats();
    }

    fn record_arrival(&self) {
        let mut stats = self.stats.lock();
        stats.total_frames += 1;
        let now = Instant::now();
        match stats.window_start {
            None => {
                stats.window_start = Some(now);
                stats.window_frames = 1;
            }
            Some(start) => {
                stats.window_frames += 1;
                let elapsed = now.duration_since(start);
                if elapsed >= Duration::from_secs(1) {
                    let fps = stats.window_frames as f64 / elapsed.as_secs_f64();
                    self.measured_input_fps.store(fps.to_bits(), Ordering::Relaxed);
                    stats.window_start = Some(now);
                    stats.window_frames = 0;
                }
            }
        }
    }

    fn maybe_log_stats(&self) {
        let mut stats = self.stats.lock();
        let now = Instant::now();
        let should_log = match stats.last_stats_log {
            Some(last) => now.duration_since(last) >= STATS_INTERVAL,
            None => {
                stats.last_stats_log = Some(now);
                false
            }
        };
        if should_log {
            tracing::info!(
                total_frames = stats.total_frames,
                dropped_small_packets = stats.dropped_small_packets,
                measured_input_fps = self.measured_fps(),
                ws_clients = self.ws_clients.client_count(),
                flv_clients = self.flv_clients.client_count(),
                mjpeg_clients = self.mjpeg_clients.client_count(),
                "router stats"
            );
            stats.total_frames = 0;
            stats.dropped_small_packets = 0;
            stats.last_stats_log = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::HlsConfig;

    fn router() -> Arc<PacketRouter> {
        PacketRouter::new(HlsEngine::new(HlsConfig::default()))
    }

    #[test]
    fn no_keyframe_before_first_push() {
        let router = router();
        assert!(!router.has_keyframe());
    }

    #[test]
    fn keyframe_flips_has_keyframe_flag() {
        let router = router();
        router.update_parameter_set(
            ParameterSet {
                sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]),
                pps: Bytes::from_static(&[0x68, 0xEB]),
                nal_length_size: 4,
            },
            4,
        );
        let mut payload = Vec::new();
        payload.extend_from_slice(&4u32.to_be_bytes());
        payload.extend_from_slice(&[0x65, 0x01, 0x02, 0x03]);

        router.push_h264(H264Packet {
            payload: Bytes::from(payload),
            is_keyframe: true,
            pts_ms: 0,
        });

        assert!(router.has_keyframe());
        assert!(!router.last_keyframe_is_jpeg());
        assert!(router.cached_frame().is_some());
    }

    #[test]
    fn mjpeg_push_sets_jpeg_cache() {
        let router = router();
        router.push_jpeg(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]));
        assert!(router.has_keyframe());
        assert!(router.last_keyframe_is_jpeg());
    }
}
