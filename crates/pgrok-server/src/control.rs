//! Control-channel acceptance and processing loop
//!
//! One WebSocket per tunnel. The processing loop is the sole reader and the
//! sole owner of the tunnel record; a dedicated writer task drains the
//! tunnel's frame queue so wire writes are serialized. A liveness ticker
//! pings every 30 seconds and force-closes the channel after ~90 seconds of
//! silence.

use crate::dispatch;
use crate::server::AppState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pgrok_control::{ControlSender, Tunnel, TunnelKind, LIVENESS_TIMEOUT, PING_INTERVAL};
use pgrok_proto::Frame;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queue depth between frame producers and the channel writer task
const SEND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Deserialize)]
pub(crate) struct ConnectParams {
    id: Option<String>,
    mode: Option<String>,
    token: Option<String>,
}

pub(crate) async fn tunnel_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| run_control_channel(socket, params, state))
}

async fn run_control_channel(socket: WebSocket, params: ConnectParams, state: AppState) {
    let tunnel_id = match params.id {
        Some(id) if !id.is_empty() => id,
        _ => Uuid::new_v4().to_string(),
    };

    if !is_valid_tunnel_id(&tunnel_id) {
        return reject(socket, format!("invalid tunnel id '{}'", tunnel_id)).await;
    }

    if let Err(err) = state
        .authorizer
        .authorize(&tunnel_id, params.token.as_deref())
        .await
    {
        return reject(socket, err.to_string()).await;
    }

    let kind = match params.mode.as_deref() {
        Some("tcp") => TunnelKind::Tcp,
        _ => TunnelKind::Http,
    };

    let (sender, frame_rx) = ControlSender::channel(SEND_QUEUE_DEPTH);
    let tunnel = Tunnel::new(tunnel_id.clone(), kind, sender);

    // TCP single-client exclusivity is enforced atomically by register()
    if let Err(err) = state.registry.register(tunnel.clone()) {
        return reject(socket, err.to_string()).await;
    }

    info!(tunnel_id, kind = kind.as_str(), "tunnel registered");

    if kind == TunnelKind::Tcp {
        if let Some(relay) = &state.tcp_relay {
            relay.mark_heartbeat();
        }
    }

    let (ws_sink, ws_stream) = socket.split();

    let writer = tokio::spawn(write_frames(
        ws_sink,
        frame_rx,
        tunnel.cancel_token().clone(),
    ));
    let liveness = tokio::spawn(liveness_loop(tunnel.clone()));

    read_frames(ws_stream, &tunnel, &state).await;

    // Teardown is authoritative here, on the owning loop
    state.registry.remove(&tunnel_id);
    tunnel.dispose();
    tunnel
        .pending()
        .drain(503, "Tunnel Disconnected", "the tunnel control channel closed");
    if kind == TunnelKind::Tcp {
        if let Some(relay) = &state.tcp_relay {
            relay.close_all();
        }
    }

    liveness.abort();
    let _ = writer.await;

    info!(tunnel_id, "tunnel closed");
}

async fn read_frames(mut ws_stream: SplitStream<WebSocket>, tunnel: &Arc<Tunnel>, state: &AppState) {
    loop {
        tokio::select! {
            _ = tunnel.cancel_token().cancelled() => {
                debug!(tunnel_id = tunnel.id(), "processing loop cancelled");
                break;
            }
            message = ws_stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    tunnel.touch();
                    match Frame::decode(&text) {
                        Ok(frame) => handle_frame(state, tunnel, frame).await,
                        Err(err) => {
                            warn!(tunnel_id = tunnel.id(), %err, "discarding malformed frame");
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => tunnel.touch(),
                Some(Ok(Message::Binary(_))) => {
                    warn!(tunnel_id = tunnel.id(), "discarding unexpected binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(tunnel_id = tunnel.id(), ?frame, "client closed control channel");
                    break;
                }
                Some(Err(err)) => {
                    warn!(tunnel_id = tunnel.id(), %err, "control channel transport error");
                    break;
                }
                None => break,
            }
        }
    }
}

async fn handle_frame(state: &AppState, tunnel: &Arc<Tunnel>, frame: Frame) {
    match frame {
        Frame::Ping => {
            if tunnel.send(Frame::Pong).await.is_err() {
                debug!(tunnel_id = tunnel.id(), "pong dropped, writer gone");
            }
        }
        // Activity was already recorded; nothing else to do
        Frame::Pong => {}
        Frame::HttpResponse(envelope) | Frame::DispatchResponse(envelope) => {
            // complete() warns about unknown ids itself
            tunnel.pending().complete(envelope);
        }
        Frame::Dispatch(envelope) => {
            tokio::spawn(dispatch::handle_dispatch(
                state.clone(),
                tunnel.clone(),
                envelope,
            ));
        }
        Frame::Tcp(envelope) => {
            // Handled inline: per-connection frame order must be preserved
            match &state.tcp_relay {
                Some(relay) => relay.handle_frame(tunnel, envelope).await,
                None => {
                    warn!(tunnel_id = tunnel.id(), "TCP frame but no TCP listener configured");
                }
            }
        }
        Frame::WsRelay(envelope) => {
            debug!(
                tunnel_id = tunnel.id(),
                connection_id = envelope.connection_id,
                "discarding WebSocket relay frame (passthrough not supported)"
            );
        }
        Frame::HttpRequest(envelope) => {
            warn!(
                tunnel_id = tunnel.id(),
                request_id = envelope.request_id,
                "discarding unexpected request envelope from client"
            );
        }
    }
}

/// Drain the frame queue onto the wire; the single writer per channel
async fn write_frames(
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut frame_rx: mpsc::Receiver<Frame>,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frame_rx.recv() => match frame {
                Some(frame) => {
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(%err, "dropping unencodable frame");
                            continue;
                        }
                    };
                    if ws_sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    let _ = ws_sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "tunnel closed".into(),
        })))
        .await;
}

async fn liveness_loop(tunnel: Arc<Tunnel>) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tunnel.cancel_token().cancelled() => break,
            _ = ticker.tick() => {
                let silent = (Utc::now() - tunnel.last_activity())
                    .to_std()
                    .unwrap_or_default();
                if silent >= LIVENESS_TIMEOUT {
                    warn!(
                        tunnel_id = tunnel.id(),
                        silent_secs = silent.as_secs(),
                        "no frames received, force-closing control channel"
                    );
                    tunnel.dispose();
                    break;
                }
                if tunnel.send(Frame::Ping).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Reject an already-upgraded channel with a policy-violation close
async fn reject(mut socket: WebSocket, reason: String) {
    warn!(reason, "rejecting control channel");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })))
        .await;
}

fn is_valid_tunnel_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| !c.is_control() && c != '/')
}
