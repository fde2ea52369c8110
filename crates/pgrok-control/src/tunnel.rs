//! Tunnel record and the serialized control-channel sender

use crate::pending::PendingRequests;
use chrono::{DateTime, Utc};
use pgrok_proto::Frame;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The control channel's peer went away
#[derive(Debug, Error)]
#[error("control channel closed")]
pub struct ChannelClosed;

/// Write half of a control channel.
///
/// All frames destined for the wire pass through one bounded queue drained by
/// a single writer task, so concurrent senders can never interleave frames.
/// The queue bound is the backpressure point for everything the tunnel sends.
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<Frame>,
}

impl ControlSender {
    /// Create a sender and the receiving end for the writer task
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, frame: Frame) -> Result<(), ChannelClosed> {
        self.tx.send(frame).await.map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// What a tunnel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    Http,
    Tcp,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Http => "http",
            TunnelKind::Tcp => "tcp",
        }
    }
}

/// One registered relay between the server and a client.
///
/// Owned by its processing loop; everything else holds `Arc`s and mutates
/// only through the concurrent members. Removal from the registry is
/// authoritative only when performed by the owning loop on exit.
pub struct Tunnel {
    id: String,
    kind: TunnelKind,
    sender: ControlSender,
    pending: PendingRequests,
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    request_count: AtomicU64,
    disposed: AtomicBool,
}

impl Tunnel {
    pub fn new(id: impl Into<String>, kind: TunnelKind, sender: ControlSender) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id: id.into(),
            kind,
            sender,
            pending: PendingRequests::new(),
            cancel: CancellationToken::new(),
            created_at: now,
            last_activity: Mutex::new(now),
            request_count: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    pub fn sender(&self) -> &ControlSender {
        &self.sender
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Token cancelled when the tunnel is disposed; child tasks select on it
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn send(&self, frame: Frame) -> Result<(), ChannelClosed> {
        self.sender.send(frame).await
    }

    /// Record activity (called for every frame received on the channel)
    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().expect("activity lock poisoned")
    }

    /// Seconds since the channel last carried a frame
    pub fn idle_secs(&self) -> i64 {
        (Utc::now() - self.last_activity()).num_seconds().max(0)
    }

    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Begin teardown: mark disposed and cancel every task anchored to the
    /// tunnel. Pending requests are drained by the owning loop.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> TunnelSummary {
        TunnelSummary {
            id: self.id.clone(),
            kind: self.kind,
            created_at: self.created_at,
            last_activity: self.last_activity(),
            request_count: self.request_count(),
            pending_requests: self.pending.len(),
        }
    }
}

/// Point-in-time view of one tunnel, for the status page and the reaper
#[derive(Debug, Clone)]
pub struct TunnelSummary {
    pub id: String,
    pub kind: TunnelKind,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub request_count: u64,
    pub pending_requests: usize,
}
