//! Public TCP relay
//!
//! Multiplexes raw public TCP connections over the sole TCP tunnel. Each
//! accepted connection gets a server-minted connection id; its bytes travel
//! as base64 `data` envelopes on the control channel. The table of
//! sub-streams is keyed by connection id; per-connection byte order is
//! preserved by handling incoming frames inline on the processing loop and
//! funnelling writes through one bounded queue per socket.

use bytes::Bytes;
use dashmap::DashMap;
use pgrok_control::{Tunnel, TunnelRegistry, TCP_HEARTBEAT_INTERVAL};
use pgrok_proto::{Frame, TcpEnvelope, TcpMessageKind, TCP_CHUNK_SIZE};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queued chunks per public socket before backpressure reaches the channel
const SUBSTREAM_QUEUE_DEPTH: usize = 32;

struct SubStream {
    tx: mpsc::Sender<Bytes>,
    opened_at: Instant,
}

/// Server half of the TCP multiplexer
pub struct TcpRelay {
    registry: Arc<TunnelRegistry>,
    streams: DashMap<String, SubStream>,
    last_heartbeat: Mutex<Instant>,
    shutdown: CancellationToken,
}

impl TcpRelay {
    pub fn new(registry: Arc<TunnelRegistry>, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            registry,
            streams: DashMap::new(),
            last_heartbeat: Mutex::new(Instant::now()),
            shutdown,
        })
    }

    /// Accept public connections until shutdown
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("TCP relay listening on {}", addr);
        }

        let watchdog = tokio::spawn(self.clone().heartbeat_watchdog());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        let relay = self.clone();
                        tokio::spawn(async move {
                            relay.handle_public_conn(socket, peer_addr).await;
                        });
                    }
                    Err(err) => {
                        warn!(%err, "failed to accept TCP connection");
                    }
                }
            }
        }

        watchdog.abort();
        self.close_all();
        info!("TCP relay stopped");
    }

    async fn handle_public_conn(self: Arc<Self>, socket: TcpStream, peer_addr: SocketAddr) {
        let Some(tunnel) = self.registry.tcp_tunnel() else {
            // Raw TCP has no error vocabulary; the caller sees a closed socket
            debug!(%peer_addr, "no TCP tunnel connected, dropping connection");
            return;
        };

        let connection_id = Uuid::new_v4().to_string();
        debug!(%peer_addr, connection_id, "accepted public TCP connection");

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Bytes>(SUBSTREAM_QUEUE_DEPTH);
        self.streams.insert(
            connection_id.clone(),
            SubStream {
                tx: chunk_tx,
                opened_at: Instant::now(),
            },
        );

        if tunnel
            .send(Frame::Tcp(TcpEnvelope::init(&connection_id)))
            .await
            .is_err()
        {
            self.streams.remove(&connection_id);
            return;
        }

        let (mut read_half, mut write_half) = socket.into_split();
        let cancel = tunnel.cancel_token().clone();

        // Writer: decoded data frames from the client, in arrival order
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    chunk = chunk_rx.recv() => match chunk {
                        Some(bytes) => {
                            if write_half.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Reader: public socket → data frames
        let mut buf = vec![0u8; TCP_CHUNK_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => {
                        let _ = tunnel
                            .send(Frame::Tcp(TcpEnvelope::close(&connection_id)))
                            .await;
                        break;
                    }
                    Ok(n) => {
                        if tunnel
                            .send(Frame::Tcp(TcpEnvelope::data(&connection_id, buf[..n].to_vec())))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(connection_id, %err, "public socket read error");
                        let _ = tunnel
                            .send(Frame::Tcp(TcpEnvelope::close(&connection_id)))
                            .await;
                        break;
                    }
                }
            }
        }

        if let Some((_, stream)) = self.streams.remove(&connection_id) {
            debug!(
                connection_id,
                lived_ms = stream.opened_at.elapsed().as_millis() as u64,
                "sub-stream closed"
            );
        }
        let _ = writer.await;
    }

    /// Apply one TCP envelope received on the control channel.
    ///
    /// Called inline from the processing loop: data frames for one
    /// connection must not be reordered, and the bounded per-socket queue is
    /// the backpressure path back to the client.
    pub async fn handle_frame(&self, tunnel: &Arc<Tunnel>, envelope: TcpEnvelope) {
        match envelope.kind {
            TcpMessageKind::Control => {
                if envelope.is_heartbeat() {
                    self.mark_heartbeat();
                } else {
                    debug!(
                        connection_id = envelope.connection_id,
                        "ignoring unknown control frame"
                    );
                }
            }
            TcpMessageKind::Data => {
                let Some(data) = envelope.data else {
                    warn!(
                        connection_id = envelope.connection_id,
                        "data frame without payload"
                    );
                    return;
                };
                // Clone the sender out so no table lock is held across await
                let tx = self
                    .streams
                    .get(&envelope.connection_id)
                    .map(|entry| entry.tx.clone());
                match tx {
                    Some(tx) => {
                        if tx.send(Bytes::from(data)).await.is_err() {
                            self.streams.remove(&envelope.connection_id);
                        }
                    }
                    None => {
                        debug!(
                            connection_id = envelope.connection_id,
                            "data for unknown connection, asking client to close"
                        );
                        let _ = tunnel
                            .send(Frame::Tcp(TcpEnvelope::close(&envelope.connection_id)))
                            .await;
                    }
                }
            }
            TcpMessageKind::Close => {
                debug!(connection_id = envelope.connection_id, "client closed sub-stream");
                self.streams.remove(&envelope.connection_id);
            }
            TcpMessageKind::Error => {
                warn!(
                    connection_id = envelope.connection_id,
                    error = envelope.error.as_deref().unwrap_or("unspecified"),
                    "client reported sub-stream error"
                );
                self.streams.remove(&envelope.connection_id);
            }
            TcpMessageKind::Init => {
                warn!(
                    connection_id = envelope.connection_id,
                    "unexpected init from client"
                );
            }
        }
    }

    pub fn mark_heartbeat(&self) {
        *self
            .last_heartbeat
            .lock()
            .expect("heartbeat lock poisoned") = Instant::now();
    }

    /// Drop every sub-stream (tunnel closed or relay shutting down)
    pub fn close_all(&self) {
        let count = self.streams.len();
        self.streams.clear();
        if count > 0 {
            debug!(count, "closed all TCP sub-streams");
        }
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Dispose the TCP tunnel when heartbeats stop arriving
    async fn heartbeat_watchdog(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TCP_HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(tunnel) = self.registry.tcp_tunnel() else {
                        continue;
                    };
                    let elapsed = self
                        .last_heartbeat
                        .lock()
                        .expect("heartbeat lock poisoned")
                        .elapsed();
                    if elapsed >= 2 * TCP_HEARTBEAT_INTERVAL {
                        warn!(
                            tunnel_id = tunnel.id(),
                            silent_secs = elapsed.as_secs(),
                            "TCP heartbeat missing, closing tunnel"
                        );
                        tunnel.dispose();
                        self.mark_heartbeat();
                    }
                }
            }
        }
    }
}
