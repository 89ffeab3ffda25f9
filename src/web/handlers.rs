//! HTTP handlers for every endpoint in the external interface: MJPEG
//! multipart, JPEG snapshot, the non-WebSocket `/h264` probe, FLV, LL-HLS
//! playlists/segments/parts, `/status`, and the stubbed `/led*` routes.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::VideoSourceMode;
use crate::error::AppError;
use crate::state::AppState;

/// H.264/HLS/FLV endpoints only make sense when the ingest is feeding
/// H.264; in MJPEG mode they're unavailable rather than silently idle.
fn require_h264_mode(state: &AppState) -> Result<(), AppError> {
    if state.config.source_mode == VideoSourceMode::H264 {
        Ok(())
    } else {
        Err(AppError::MjpegModeUnavailable)
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct HlsPlaylistQuery {
    #[serde(rename = "_HLS_msn")]
    pub hls_msn: Option<u64>,
    #[serde(rename = "_HLS_part")]
    pub hls_part: Option<u32>,
}

/// `GET /stream`, `/mjpeg`, `/`: chunked MJPEG multipart. Sends the
/// cached JPEG immediately if one exists, then streams subsequent
/// frames as they're pushed.
pub async fn mjpeg_stream(State(state): State<Arc<AppState>>) -> Response {
    let (guard, mut rx) = state.router.mjpeg_clients().register(2, ());

    let initial = state.router.cached_frame().filter(|_| state.router.last_keyframe_is_jpeg());

    let body_stream = async_stream::stream! {
        let _guard = guard;
        if let Some(frame) = initial {
            yield Ok::<Bytes, std::io::Error>(mjpeg_part(&frame.data));
        }
        while let Some(jpeg) = rx.recv().await {
            yield Ok(mjpeg_part(&jpeg));
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=mjpegboundary")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .body(Body::from_stream(body_stream))
        .unwrap()
}

fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(jpeg.len() + 64);
    buf.put_slice(b"\r\n--mjpegboundary\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes());
    buf.put_slice(jpeg);
    buf.freeze()
}

/// `GET /snapshot`, `/snap`, `/image`: single JPEG, 503 if no keyframe
/// cached yet.
pub async fn snapshot(State(state): State<Arc<AppState>>) -> Response {
    match state.snapshot.snapshot().await {
        Ok(jpeg) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "image/jpeg")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(jpeg))
            .unwrap(),
        Err(AppError::NotReady(_)) => Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::from("No frame available"))
            .unwrap(),
        Err(err) => err.into_response(),
    }
}

/// `GET /h264` without an `Upgrade: websocket` header: a JSON
/// description of the endpoint and current state, rather than a 426.
pub async fn h264_info(State(state): State<Arc<AppState>>) -> Response {
    if let Err(err) = require_h264_mode(&state) {
        return err.into_response();
    }

    Json(H264InfoResponse {
        protocol: "websocket",
        format: "annex-b h264",
        has_keyframe: state.router.has_keyframe() && !state.router.last_keyframe_is_jpeg(),
        ws_clients: state.router.ws_clients().client_count(),
    })
    .into_response()
}

#[derive(Serialize)]
pub struct H264InfoResponse {
    protocol: &'static str,
    format: &'static str,
    has_keyframe: bool,
    ws_clients: usize,
}

/// `GET /flv`: chunked FLV stream, fed by the router's FLV client
/// registry via a fresh per-connection muxer instance.
pub async fn flv_stream(State(state): State<Arc<AppState>>) -> Response {
    if let Err(err) = require_h264_mode(&state) {
        return err.into_response();
    }

    let muxer = crate::flv::FlvMuxer::new();
    let (guard, mut rx) = state.router.flv_clients().register(8, muxer);

    let body_stream = async_stream::stream! {
        let _guard = guard;
        // The first chunk the router hands this client carries the FLV
        // file header and onMetaData tag; nothing is sent until then.
        while let Some(chunk) = rx.recv().await {
            yield Ok::<Bytes, std::io::Error>(chunk);
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::CONTENT_LENGTH, "99999999999")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    running: bool,
    clients: usize,
    mjpeg_clients: usize,
    h264_clients: usize,
    flv_clients: usize,
    frame_width: u32,
    frame_height: u32,
    has_frame: bool,
    max_fps: f64,
    idle_fps: f64,
    jpeg_quality: u8,
    frames_skipped: u64,
    measured_input_fps: f64,
    uptime_secs: u64,
    session_id: u64,
}

/// `GET /status`: aggregate counters across all consumer kinds.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let mjpeg_clients = state.router.mjpeg_clients().client_count();
    let h264_clients = state.router.ws_clients().client_count();
    let flv_clients = state.router.flv_clients().client_count();

    Json(StatusResponse {
        running: true,
        clients: mjpeg_clients + h264_clients + flv_clients,
        mjpeg_clients,
        h264_clients,
        flv_clients,
        frame_width: 0,
        frame_height: 0,
        has_frame: state.router.has_keyframe(),
        max_fps: state.router.measured_fps(),
        idle_fps: 1.0,
        jpeg_quality: state.config.snapshot_jpeg_quality,
        frames_skipped: state.router.dropped_small_packets(),
        measured_input_fps: state.router.measured_fps(),
        uptime_secs: state.uptime_secs(),
        session_id: state.hls.session_id(),
    })
}

#[derive(Serialize)]
pub struct LedResponse {
    state: Option<&'static str>,
    success: bool,
}

/// `GET/POST /led`, `/led/on`, `/led/off`: this deployment has no LED
/// collaborator wired in, so every call reports unavailable.
pub async fn led_unavailable() -> (StatusCode, Json<LedResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(LedResponse { state: None, success: false }),
    )
}

/// `GET /hls/playlist.m3u8`: modern LL-HLS playlist, blocking when
/// `_HLS_msn`/`_HLS_part` are present and not yet available.
pub async fn hls_playlist(State(state): State<Arc<AppState>>, Query(query): Query<HlsPlaylistQuery>) -> Response {
    if let Err(err) = require_h264_mode(&state) {
        return err.into_response();
    }

    match state.hls.modern_playlist(query.hls_msn, query.hls_part).await {
        Ok(body) => playlist_response(body),
        Err(err) => err.into_response(),
    }
}

/// `GET /hls/legacy.m3u8`.
pub async fn hls_legacy_playlist(State(state): State<Arc<AppState>>) -> Response {
    if let Err(err) = require_h264_mode(&state) {
        return err.into_response();
    }

    match state.hls.legacy_playlist() {
        Ok(body) => playlist_response(body),
        Err(err) => err.into_response(),
    }
}

fn playlist_response(body: String) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(body))
        .unwrap()
}

/// Parsed form of everything under `/hls/` except the two named
/// playlists: segments, legacy segments, and parts all share the
/// `/hls/{file}` route and are told apart by filename shape, since the
/// router can't hold more than one dynamic segment per path element.
enum HlsFile {
    Segment { msn: u64 },
    LegacySegment { msn: u64 },
    Part { msn: u64, part: u32 },
}

fn parse_hls_filename(name: &str) -> Option<HlsFile> {
    if let Some(rest) = name.strip_prefix("legacy-segment-").and_then(|r| r.strip_suffix(".ts")) {
        let (_sid, msn) = rest.split_once('-')?;
        return Some(HlsFile::LegacySegment { msn: msn.parse().ok()? });
    }
    if let Some(rest) = name.strip_prefix("segment-").and_then(|r| r.strip_suffix(".ts")) {
        let (_sid, msn) = rest.split_once('-')?;
        return Some(HlsFile::Segment { msn: msn.parse().ok()? });
    }
    if let Some(rest) = name.strip_prefix("part-").and_then(|r| r.strip_suffix(".ts")) {
        let (sid_msn, part) = rest.rsplit_once('.')?;
        let (_sid, msn) = sid_msn.split_once('-')?;
        return Some(HlsFile::Part { msn: msn.parse().ok()?, part: part.parse().ok()? });
    }
    None
}

#[derive(Debug, Deserialize)]
pub struct HlsFilePath {
    pub file: String,
}

/// `GET /hls/segment-<sid>-<msn>.ts`, `/hls/legacy-segment-<sid>-<msn>.ts`,
/// `/hls/part-<sid>-<msn>.<p>.ts`.
pub async fn hls_file(State(state): State<Arc<AppState>>, Path(path): Path<HlsFilePath>) -> Response {
    if let Err(err) = require_h264_mode(&state) {
        return err.into_response();
    }

    match parse_hls_filename(&path.file) {
        Some(HlsFile::Segment { msn }) => segment_response(&state, msn, false),
        Some(HlsFile::LegacySegment { msn }) => segment_response(&state, msn, true),
        Some(HlsFile::Part { msn, part }) => match state.hls.part_bytes(msn, part) {
            Some(data) => ts_response(data),
            None => AppError::Evicted(format!("part {msn}.{part} not available")).into_response(),
        },
        None => AppError::MalformedInput(format!("unrecognized HLS resource {:?}", path.file)).into_response(),
    }
}

fn segment_response(state: &AppState, msn: u64, legacy: bool) -> Response {
    match state.hls.segment_bytes(msn, legacy) {
        Some(data) => ts_response(data),
        None => AppError::Evicted(format!("segment {msn} no longer in window")).into_response(),
    }
}

fn ts_response(data: Bytes) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(data))
        .unwrap()
}
