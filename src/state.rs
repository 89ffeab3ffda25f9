use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::hls::HlsEngine;
use crate::router::PacketRouter;
use crate::snapshot::SnapshotDecoder;
use crate::utils::throttle::LogThrottler;

/// Application-wide state shared across handlers: the HLS engine, the
/// packet router that feeds it and fans out to the other protocols,
/// and the snapshot decoder built on top of the router's keyframe
/// cache.
pub struct AppState {
    pub config: AppConfig,
    pub hls: Arc<HlsEngine>,
    pub router: Arc<PacketRouter>,
    pub snapshot: Arc<SnapshotDecoder>,
    pub consumer_gone_throttle: LogThrottler,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Arc<Self>, crate::error::AppError> {
        let hls = HlsEngine::new(config.hls_config());
        let router = PacketRouter::new(hls.clone());
        let snapshot = SnapshotDecoder::new(router.clone(), config.snapshot_jpeg_quality)?;

        Ok(Arc::new(Self {
            config,
            hls,
            router,
            snapshot,
            consumer_gone_throttle: LogThrottler::general(),
            started_at: Instant::now(),
        }))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
