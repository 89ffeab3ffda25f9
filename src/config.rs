//! Application configuration: a single struct covering the HTTP
//! server, the HLS engine, and the ingest source mode, loaded from CLI
//! flags (no persisted store — unlike some sibling projects in this
//! codebase, the core here is stateless between runs).

use std::net::IpAddr;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::hls::HlsConfig;

/// Whether the ingest feeds H.264 packets or already-encoded JPEG
/// frames. MJPEG mode bypasses the NAL codec, MPEG-TS muxer, FLV
/// muxer, and HLS engine entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoSourceMode {
    H264,
    Mjpeg,
}

impl Default for VideoSourceMode {
    fn default() -> Self {
        VideoSourceMode::H264
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_addresses: Vec<IpAddr>,
    pub http_port: u16,
    pub source_mode: VideoSourceMode,
    pub hls_window_secs: f64,
    pub hls_segment_target_ms: u64,
    pub hls_part_target_ms: u64,
    pub snapshot_jpeg_quality: u8,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let hls = HlsConfig::default();
        Self {
            bind_addresses: vec!["0.0.0.0".parse().unwrap()],
            http_port: 8080,
            source_mode: VideoSourceMode::H264,
            hls_window_secs: hls.window_secs,
            hls_segment_target_ms: hls.segment_target_ms,
            hls_part_target_ms: hls.part_target_ms,
            snapshot_jpeg_quality: 80,
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn hls_config(&self) -> HlsConfig {
        HlsConfig {
            window_secs: self.hls_window_secs,
            segment_target_ms: self.hls_segment_target_ms,
            part_target_ms: self.hls_part_target_ms,
        }
        .clamped()
    }
}

/// Command-line flags. These seed an [`AppConfig`]; there is no
/// on-disk settings store to reconcile with.
#[derive(Debug, Parser)]
#[command(name = "camproxy", about = "Multi-protocol camera proxy for 3D printers")]
pub struct CliArgs {
    /// Bind address, repeatable for multiple interfaces.
    #[arg(long = "address", short = 'a')]
    pub addresses: Vec<IpAddr>,

    #[arg(long, default_value_t = 8080)]
    pub http_port: u16,

    #[arg(long, value_enum, default_value = "h264")]
    pub source_mode: SourceModeArg,

    #[arg(long, default_value_t = 10.0)]
    pub hls_window_secs: f64,

    #[arg(long, default_value_t = 800)]
    pub hls_segment_target_ms: u64,

    #[arg(long, default_value_t = 200)]
    pub hls_part_target_ms: u64,

    #[arg(long, default_value_t = 80)]
    pub snapshot_jpeg_quality: u8,

    /// Log level (error, warn, info, debug, trace). Overridden by
    /// `RUST_LOG` when set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Increase verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SourceModeArg {
    H264,
    Mjpeg,
}

impl From<CliArgs> for AppConfig {
    fn from(args: CliArgs) -> Self {
        let defaults = AppConfig::default();
        let log_level = match args.verbose {
            0 => args.log_level,
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        };
        Self {
            bind_addresses: if args.addresses.is_empty() {
                defaults.bind_addresses
            } else {
                args.addresses
            },
            http_port: args.http_port,
            source_mode: match args.source_mode {
                SourceModeArg::H264 => VideoSourceMode::H264,
                SourceModeArg::Mjpeg => VideoSourceMode::Mjpeg,
            },
            hls_window_secs: args.hls_window_secs,
            hls_segment_target_ms: args.hls_segment_target_ms,
            hls_part_target_ms: args.hls_part_target_ms,
            snapshot_jpeg_quality: args.snapshot_jpeg_quality,
            log_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_hls_window() {
        let config = AppConfig::default();
        assert_eq!(config.hls_window_secs, 10.0);
        assert_eq!(config.source_mode, VideoSourceMode::H264);
    }
}
