//! Connection supervisor
//!
//! Drives the client through `Idle → Connecting → Connected → Draining →
//! Backoff → Connecting`. A session ends on transport error, protocol
//! violation, server policy close or liveness failure; draining fails all
//! locally pending work with 503 and tears down sub-streams before the
//! backoff wait. An external stop exits cleanly from any state.

use crate::backoff::{ReconnectError, ReconnectManager};
use crate::config::{ClientConfig, TunnelMode};
use crate::forward::LocalForwarder;
use crate::reverse_proxy;
use crate::tcp::TcpMirror;
use crate::ClientError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pgrok_control::{ControlSender, PendingRequests, PING_INTERVAL};
use pgrok_proto::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_QUEUE_DEPTH: usize = 64;

/// Why a connected session ended
enum SessionEnd {
    /// External stop; the supervisor exits cleanly
    Shutdown,
    /// Transport or liveness failure; the supervisor backs off and redials
    Transport(String),
}

pub struct TunnelSupervisor {
    config: ClientConfig,
    shutdown: CancellationToken,
}

impl TunnelSupervisor {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the supervisor cleanly from any state
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until stopped or the reconnect ceiling is reached
    pub async fn run(self) -> Result<(), ClientError> {
        let url = self.config.control_url()?;
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            info!(tunnel_id = self.config.tunnel_id, %url, "connecting to relay");
            let connect = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                result = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())) => result,
            };

            match connect {
                Ok(Ok((ws, _response))) => {
                    info!(tunnel_id = self.config.tunnel_id, "control channel established");
                    reconnect.reset();
                    match self.run_session(ws).await {
                        SessionEnd::Shutdown => {
                            info!(tunnel_id = self.config.tunnel_id, "client stopped");
                            return Ok(());
                        }
                        SessionEnd::Transport(reason) => {
                            warn!(tunnel_id = self.config.tunnel_id, reason, "control channel lost");
                        }
                    }
                }
                Ok(Err(err)) => {
                    warn!(tunnel_id = self.config.tunnel_id, %err, "connect failed");
                }
                Err(_) => {
                    warn!(tunnel_id = self.config.tunnel_id, "connect timed out");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                result = reconnect.wait() => {
                    if let Err(ReconnectError::MaxAttemptsReached) = result {
                        return Err(ClientError::ReconnectExhausted(reconnect.attempt()));
                    }
                }
            }
        }
    }

    /// One connected session: processing loop plus its satellite tasks
    async fn run_session(&self, ws: WsStream) -> SessionEnd {
        let session = CancellationToken::new();
        let (sender, frame_rx) = ControlSender::channel(SEND_QUEUE_DEPTH);
        let pending = PendingRequests::new();

        let (ws_sink, ws_stream) = ws.split();
        let writer = tokio::spawn(write_frames(ws_sink, frame_rx, session.clone()));

        let outstanding_ping = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(heartbeat_loop(
            sender.clone(),
            outstanding_ping.clone(),
            session.clone(),
            self.config.is_tcp(),
        ));

        let forwarder = match &self.config.mode {
            TunnelMode::Http { local_url } => {
                match LocalForwarder::new(local_url.clone(), &self.config.tunnel_id) {
                    Ok(forwarder) => Some(Arc::new(forwarder)),
                    Err(err) => {
                        warn!(%err, "failed to build local forwarder");
                        None
                    }
                }
            }
            TunnelMode::Tcp { .. } => None,
        };

        let mirror = match &self.config.mode {
            TunnelMode::Tcp { local_addr } => Some(TcpMirror::new(
                local_addr.clone(),
                sender.clone(),
                session.clone(),
            )),
            TunnelMode::Http { .. } => None,
        };

        if let (Some(port), false) = (self.config.proxy_port, self.config.is_tcp()) {
            let proxy_sender = sender.clone();
            let proxy_pending = pending.clone();
            let proxy_session = session.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    reverse_proxy::serve(port, proxy_sender, proxy_pending, proxy_session).await
                {
                    warn!(%err, "reverse proxy stopped");
                }
            });
        }

        let end = self
            .process_frames(ws_stream, &sender, &pending, &forwarder, &mirror, &session, &outstanding_ping)
            .await;

        // Draining: cancel satellites, fail pending work, drop sub-streams
        session.cancel();
        pending.drain(503, "Tunnel Disconnected", "control channel lost");
        if let Some(mirror) = &mirror {
            mirror.close_all();
        }
        heartbeat.abort();
        let _ = writer.await;

        end
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_frames(
        &self,
        mut ws_stream: SplitStream<WsStream>,
        sender: &ControlSender,
        pending: &PendingRequests,
        forwarder: &Option<Arc<LocalForwarder>>,
        mirror: &Option<Arc<TcpMirror>>,
        session: &CancellationToken,
        outstanding_ping: &Arc<AtomicBool>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                _ = session.cancelled() => {
                    return SessionEnd::Transport("session cancelled (liveness failure)".to_string());
                }
                message = ws_stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        match Frame::decode(&text) {
                            Ok(frame) => {
                                self.handle_frame(frame, sender, pending, forwarder, mirror, outstanding_ping)
                                    .await;
                            }
                            Err(err) => {
                                warn!(%err, "discarding malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| {
                                format!("closed by server: {} {}", u16::from(f.code), f.reason)
                            })
                            .unwrap_or_else(|| "closed by server".to_string());
                        return SessionEnd::Transport(reason);
                    }
                    Some(Ok(_)) => {
                        // Ping/pong handled by tungstenite, binary ignored
                    }
                    Some(Err(err)) => return SessionEnd::Transport(err.to_string()),
                    None => return SessionEnd::Transport("connection closed".to_string()),
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        sender: &ControlSender,
        pending: &PendingRequests,
        forwarder: &Option<Arc<LocalForwarder>>,
        mirror: &Option<Arc<TcpMirror>>,
        outstanding_ping: &Arc<AtomicBool>,
    ) {
        match frame {
            Frame::Ping => {
                if sender.send(Frame::Pong).await.is_err() {
                    debug!("pong dropped, writer gone");
                }
            }
            Frame::Pong => {
                outstanding_ping.store(false, Ordering::SeqCst);
            }
            Frame::HttpRequest(envelope) => match forwarder {
                Some(forwarder) => {
                    let forwarder = forwarder.clone();
                    let sender = sender.clone();
                    tokio::spawn(async move {
                        let reply = forwarder.forward(envelope).await;
                        if sender.send(Frame::HttpResponse(reply)).await.is_err() {
                            debug!("response dropped, channel closed");
                        }
                    });
                }
                None => {
                    warn!("HTTP envelope on a TCP tunnel, discarding");
                }
            },
            Frame::Dispatch(envelope) => match forwarder {
                Some(forwarder) => {
                    let forwarder = forwarder.clone();
                    let sender = sender.clone();
                    tokio::spawn(async move {
                        let reply = forwarder.forward(envelope).await;
                        if sender.send(Frame::DispatchResponse(reply)).await.is_err() {
                            debug!("dispatch reply dropped, channel closed");
                        }
                    });
                }
                None => {
                    warn!("dispatch envelope on a TCP tunnel, discarding");
                }
            },
            Frame::DispatchResponse(envelope) => {
                // Reverse-proxy replies; complete() warns on unknown ids
                pending.complete(envelope);
            }
            Frame::Tcp(envelope) => match mirror {
                // Inline: per-connection frame order must be preserved
                Some(mirror) => mirror.handle_frame(envelope).await,
                None => {
                    warn!("TCP envelope on an HTTP tunnel, discarding");
                }
            },
            Frame::WsRelay(envelope) => {
                debug!(
                    connection_id = envelope.connection_id,
                    "discarding WebSocket relay frame (passthrough not supported)"
                );
            }
            Frame::HttpResponse(envelope) => {
                warn!(
                    request_id = envelope.request_id,
                    "discarding unexpected response envelope from server"
                );
            }
        }
    }
}

/// Drain the frame queue onto the wire; the single writer per channel
async fn write_frames(
    mut ws_sink: SplitSink<WsStream, Message>,
    mut frame_rx: mpsc::Receiver<Frame>,
    session: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = session.cancelled() => break,
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
                        session.cancel();
                        break;
                    }
                }
                None => break,
            }
        }
    }

    let _ = ws_sink
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client shutting down".into(),
        })))
        .await;
}

/// Ping the server every interval; an unanswered ping is a liveness failure.
/// TCP tunnels additionally emit the heartbeat control frame.
async fn heartbeat_loop(
    sender: ControlSender,
    outstanding_ping: Arc<AtomicBool>,
    session: CancellationToken,
    tcp_mode: bool,
) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            _ = ticker.tick() => {
                if outstanding_ping.swap(true, Ordering::SeqCst) {
                    warn!("ping went unanswered, declaring the channel dead");
                    session.cancel();
                    break;
                }
                if sender.send(Frame::Ping).await.is_err() {
                    break;
                }
                if tcp_mode {
                    if sender
                        .send(Frame::Tcp(pgrok_proto::TcpEnvelope::heartbeat()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    }
}
