//! WebSocket handler for the raw H.264 feed at `/h264`. Binary frames
//! carry Annex-B access units; a newly connected client is sent the
//! cached keyframe immediately so it doesn't wait for the next one.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};

use crate::config::VideoSourceMode;
use crate::error::AppError;
use crate::state::AppState;

pub async fn h264_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.config.source_mode != VideoSourceMode::H264 {
        return AppError::MjpegModeUnavailable.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    if let Some(frame) = state.router.cached_frame() {
        if state.router.last_keyframe_is_jpeg() {
            // WS clients only exist in H.264 mode; nothing to send yet.
        } else if sender.send(Message::Binary(frame.data.to_vec())).await.is_err() {
            return;
        }
    }

    let (guard, mut rx) = state.router.ws_clients().register(8, ());

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if sender.send(Message::Binary(frame.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    drop(guard);
}
