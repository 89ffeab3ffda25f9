//! Still-image snapshot endpoint: decodes the cached H.264 keyframe to
//! pixels and re-encodes as JPEG. In MJPEG source mode this is a no-op,
//! since the cached frame is already a JPEG.
//!
//! Decode is comparatively expensive, so results are cached by the
//! frame's content hash and decoding is rate-limited: concurrent
//! requests during a cache miss collapse onto a single decode via
//! `tokio::sync::Mutex`, and misses are capped at 10/sec so a burst of
//! snapshot requests can't starve the ingest thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use openh264::decoder::Decoder;
use openh264::OpenH264API;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::AppError;
use crate::nal;
use crate::router::{CachedFrame, PacketRouter};

const MIN_DECODE_INTERVAL: Duration = Duration::from_millis(100); // 10/sec

struct CachedJpeg {
    source_hash: u64,
    data: Bytes,
}

/// Decoder and compressor share one mutex: both hold internal state
/// that isn't safe to touch from two requests at once.
struct DecoderState {
    decoder: Decoder,
    compressor: turbojpeg::Compressor,
}

pub struct SnapshotDecoder {
    router: Arc<PacketRouter>,
    state: AsyncMutex<DecoderState>,
    cache: SyncMutex<Option<CachedJpeg>>,
    last_decode_at: SyncMutex<Option<Instant>>,
}

impl SnapshotDecoder {
    pub fn new(router: Arc<PacketRouter>, jpeg_quality: u8) -> Result<Arc<Self>, AppError> {
        let api = OpenH264API::from_source();
        let decoder = Decoder::new(api).map_err(|e| AppError::Internal(format!("openh264 decoder init failed: {e}")))?;
        let mut compressor = turbojpeg::Compressor::new()
            .map_err(|e| AppError::Internal(format!("turbojpeg compressor init failed: {e}")))?;
        compressor
            .set_quality(jpeg_quality.clamp(1, 100) as i32)
            .map_err(|e| AppError::Internal(format!("turbojpeg set_quality failed: {e}")))?;

        Ok(Arc::new(Self {
            router,
            state: AsyncMutex::new(DecoderState { decoder, compressor }),
            cache: SyncMutex::new(None),
            last_decode_at: SyncMutex::new(None),
        }))
    }

    /// Return a JPEG snapshot of the most recent keyframe, decoding and
    /// re-encoding only when the cached content hash is stale.
    pub async fn snapshot(&self) -> Result<Bytes, AppError> {
        let frame = self
            .router
            .cached_frame()
            .ok_or_else(|| AppError::NotReady("no keyframe received yet".into()))?;

        if self.router.last_keyframe_is_jpeg() {
            return Ok(frame.data);
        }

        if let Some(cached) = self.cache.lock().as_ref() {
            if cached.source_hash == frame.content_hash {
                return Ok(cached.data.clone());
            }
        }

        if !self.allow_decode() {
            // Rate-limited: serve the last JPEG we have, stale or not,
            // rather than decode again this soon.
            if let Some(cached) = self.cache.lock().as_ref() {
                return Ok(cached.data.clone());
            }
        }

        let jpeg = self.decode_and_encode(&frame).await?;
        *self.cache.lock() = Some(CachedJpeg {
            source_hash: frame.content_hash,
            data: jpeg.clone(),
        });
        Ok(jpeg)
    }

    fn allow_decode(&self) -> bool {
        let mut last = self.last_decode_at.lock();
        let now = Instant::now();
        let allowed = match *last {
            None => true,
            Some(prev) => now.duration_since(prev) >= MIN_DECODE_INTERVAL,
        };
        if allowed {
            *last = Some(now);
        }
        allowed
    }

    async fn decode_and_encode(&self, frame: &CachedFrame) -> Result<Bytes, AppError> {
        let mut state = self.state.lock().await;
        let DecoderState { decoder, compressor } = &mut *state;

        let decoded = decode_annex_b(decoder, &frame.data)
            .ok_or_else(|| AppError::DecodeFailure("openh264 produced no frame from cached keyframe".into()))?;

        let yuv_image = turbojpeg::YuvImage {
            pixels: decoded.data.as_slice(),
            width: decoded.width as usize,
            height: decoded.height as usize,
            align: 1,
            subsamp: turbojpeg::Subsamp::Sub2x2,
        };
        let jpeg = compressor
            .compress_yuv_to_vec(yuv_image)
            .map_err(|e| AppError::Internal(format!("turbojpeg encode failed: {e}")))?;

        Ok(Bytes::from(jpeg))
    }
}

struct DecodedI420 {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

/// Feed every NAL unit in an Annex-B buffer (SPS, PPS, IDR in order) to
/// the decoder one at a time; `openh264` only emits a frame once it has
/// seen both parameter sets and a full picture.
fn decode_annex_b(decoder: &mut Decoder, annex_b: &[u8]) -> Option<DecodedI420> {
    let nals = nal::parse_annex_b(annex_b);
    let mut last_frame = None;

    for range in nals {
        let mut with_start_code = Vec::with_capacity(range.len() + 4);
        with_start_code.extend_from_slice(&[0, 0, 0, 1]);
        with_start_code.extend_from_slice(range.slice(annex_b));

        match decoder.decode(&with_start_code) {
            Ok(Some(yuv)) => {
                let (width, height) = yuv.dimension_rgb();
                let w = width;
                let h = height;
                let half_w = w / 2;
                let half_h = h / 2;
                let y_size = w * h;
                let uv_size = half_w * half_h;

                let mut data = vec![0u8; y_size + uv_size * 2];

                let y_stride = yuv.y().len() / h;
                for row in 0..h {
                    let src = row * y_stride;
                    let dst = row * w;
                    data[dst..dst + w].copy_from_slice(&yuv.y()[src..src + w]);
                }

                let u_stride = yuv.u().len() / half_h;
                for row in 0..half_h {
                    let src = row * u_stride;
                    let dst = y_size + row * half_w;
                    data[dst..dst + half_w].copy_from_slice(&yuv.u()[src..src + half_w]);
                }

                let v_stride = yuv.v().len() / half_h;
                for row in 0..half_h {
                    let src = row * v_stride;
                    let dst = y_size + uv_size + row * half_w;
                    data[dst..dst + half_w].copy_from_slice(&yuv.v()[src..src + half_w]);
                }

                last_frame = Some(DecodedI420 {
                    width: w as u32,
                    height: h as u32,
                    data,
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(error = ?e, "openh264 decode error, continuing");
            }
        }
    }

    last_frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::{HlsConfig, HlsEngine};

    #[tokio::test]
    async fn snapshot_is_not_ready_before_any_keyframe() {
        let router = PacketRouter::new(HlsEngine::new(HlsConfig::default()));
        let decoder = SnapshotDecoder::new(router, 80).unwrap();
        let err = decoder.snapshot().await.unwrap_err();
        assert!(matches!(err, AppError::NotReady(_)));
    }

    #[tokio::test]
    async fn snapshot_returns_jpeg_bytes_directly_in_mjpeg_mode() {
        let router = PacketRouter::new(HlsEngine::new(HlsConfig::default()));
        router.push_jpeg(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]));
        let decoder = SnapshotDecoder::new(router, 80).unwrap();
        let jpeg = decoder.snapshot().await.unwrap();
        assert_eq!(&jpeg[..], &[0xFF, 0xD8, 0xFF, 0xD9]);
    }
}
