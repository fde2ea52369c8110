//! Client half of the TCP multiplexer
//!
//! Mirrors the server's sub-stream table: on `init` it dials the configured
//! local service, then relays bytes both ways until either side closes. Data
//! frames are applied inline from the processing loop so per-connection byte
//! order is preserved.

use bytes::Bytes;
use dashmap::DashMap;
use pgrok_control::ControlSender;
use pgrok_proto::{Frame, TcpEnvelope, TcpMessageKind, TCP_CHUNK_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSTREAM_QUEUE_DEPTH: usize = 32;

pub struct TcpMirror {
    local_addr: String,
    sender: ControlSender,
    streams: DashMap<String, mpsc::Sender<Bytes>>,
    session: CancellationToken,
}

impl TcpMirror {
    pub fn new(
        local_addr: impl Into<String>,
        sender: ControlSender,
        session: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_addr: local_addr.into(),
            sender,
            streams: DashMap::new(),
            session,
        })
    }

    /// Apply one TCP envelope from the control channel (inline, ordered)
    pub async fn handle_frame(self: &Arc<Self>, envelope: TcpEnvelope) {
        match envelope.kind {
            TcpMessageKind::Init => {
                let connection_id = envelope.connection_id;
                debug!(connection_id, "opening sub-stream to {}", self.local_addr);

                let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(SUBSTREAM_QUEUE_DEPTH);
                // Registered before the dial completes so data frames that
                // race the connect are queued, not lost.
                self.streams.insert(connection_id.clone(), chunk_tx);

                let mirror = self.clone();
                tokio::spawn(async move {
                    mirror.run_substream(connection_id, chunk_rx).await;
                });
            }
            TcpMessageKind::Data => {
                let Some(data) = envelope.data else {
                    warn!(
                        connection_id = envelope.connection_id,
                        "data frame without payload"
                    );
                    return;
                };
                let tx = self
                    .streams
                    .get(&envelope.connection_id)
                    .map(|entry| entry.value().clone());
                match tx {
                    Some(tx) => {
                        if tx.send(Bytes::from(data)).await.is_err() {
                            self.streams.remove(&envelope.connection_id);
                        }
                    }
                    None => {
                        // No implicit creation: only init opens sub-streams
                        warn!(
                            connection_id = envelope.connection_id,
                            "data for unknown connection"
                        );
                        let _ = self
                            .sender
                            .send(Frame::Tcp(TcpEnvelope::error(
                                &envelope.connection_id,
                                "unknown connection id",
                            )))
                            .await;
                    }
                }
            }
            TcpMessageKind::Close => {
                debug!(connection_id = envelope.connection_id, "server closed sub-stream");
                self.streams.remove(&envelope.connection_id);
            }
            TcpMessageKind::Error => {
                warn!(
                    connection_id = envelope.connection_id,
                    error = envelope.error.as_deref().unwrap_or("unspecified"),
                    "server reported sub-stream error"
                );
                self.streams.remove(&envelope.connection_id);
            }
            TcpMessageKind::Control => {
                debug!(
                    connection_id = envelope.connection_id,
                    "ignoring control frame from server"
                );
            }
        }
    }

    async fn run_substream(
        self: Arc<Self>,
        connection_id: String,
        mut chunk_rx: mpsc::Receiver<Bytes>,
    ) {
        let socket =
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&self.local_addr)).await
            {
                Ok(Ok(socket)) => socket,
                Ok(Err(err)) => {
                    warn!(connection_id, %err, "failed to dial {}", self.local_addr);
                    self.streams.remove(&connection_id);
                    let _ = self
                        .sender
                        .send(Frame::Tcp(TcpEnvelope::error(
                            &connection_id,
                            &format!("dial {} failed: {}", self.local_addr, err),
                        )))
                        .await;
                    return;
                }
                Err(_) => {
                    warn!(connection_id, "dial to {} timed out", self.local_addr);
                    self.streams.remove(&connection_id);
                    let _ = self
                        .sender
                        .send(Frame::Tcp(TcpEnvelope::error(
                            &connection_id,
                            &format!("dial {} timed out", self.local_addr),
                        )))
                        .await;
                    return;
                }
            };

        let (mut read_half, mut write_half) = socket.into_split();
        let cancel = self.session.clone();

        // Writer: queued data frames → local socket
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

        // Reader: local socket → data frames
        let mut buf = vec![0u8; TCP_CHUNK_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => {
                        let _ = self
                            .sender
                            .send(Frame::Tcp(TcpEnvelope::close(&connection_id)))
                            .await;
                        break;
                    }
                    Ok(n) => {
                        if self
                            .sender
                            .send(Frame::Tcp(TcpEnvelope::data(&connection_id, buf[..n].to_vec())))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(connection_id, %err, "local socket read error");
                        let _ = self
                            .sender
                            .send(Frame::Tcp(TcpEnvelope::close(&connection_id)))
                            .await;
                        break;
                    }
                }
            }
        }

        self.streams.remove(&connection_id);
        let _ = writer.await;
        debug!(connection_id, "sub-stream finished");
    }

    /// Drop every sub-stream (session draining)
    pub fn close_all(&self) {
        self.streams.clear();
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }
}
