//! Send-and-await plumbing shared by public ingress and dispatch forwarding

use pgrok_control::Tunnel;
use pgrok_proto::{Frame, HttpRequestEnvelope, HttpResponseEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Outcome of relaying one envelope through a tunnel
pub(crate) enum RelayOutcome {
    /// The client answered within the deadline
    Response(HttpResponseEnvelope),
    /// No answer within the deadline
    TimedOut,
    /// The tunnel died before or while the request was in flight
    Disconnected,
    /// Correlator invariant violation; the tunnel has been disposed
    FatalCorrelation,
}

/// Register the envelope in the tunnel's pending table, put it on the wire
/// and await the correlated response.
pub(crate) async fn relay_envelope(
    tunnel: &Arc<Tunnel>,
    envelope: HttpRequestEnvelope,
    wrap: fn(HttpRequestEnvelope) -> Frame,
    deadline: Duration,
) -> RelayOutcome {
    let request_id = envelope.request_id.clone();

    let rx = match tunnel.pending().insert(&request_id) {
        Ok(rx) => rx,
        Err(err) => {
            // Request ids are random UUIDs; a collision means the id space
            // is corrupted and the tunnel cannot be trusted.
            error!(tunnel_id = tunnel.id(), %err, "correlator invariant violated, disposing tunnel");
            tunnel.dispose();
            return RelayOutcome::FatalCorrelation;
        }
    };

    if tunnel.send(wrap(envelope)).await.is_err() {
        tunnel.pending().cancel(&request_id);
        return RelayOutcome::Disconnected;
    }

    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(response)) => {
            tunnel.record_request();
            RelayOutcome::Response(response)
        }
        // Sender dropped without completing: the owning loop drained us
        Ok(Err(_)) => RelayOutcome::Disconnected,
        Err(_) => {
            tunnel.pending().cancel(&request_id);
            RelayOutcome::TimedOut
        }
    }
}
