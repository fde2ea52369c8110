//! Cross-service dispatch
//!
//! A `$dispatch$` frame carries a request that originated on a client's
//! reverse-proxy port. The server routes it to the sibling tunnel named by
//! the first URL path segment and replies `$dispatchresponse$` on the
//! originating channel. The sibling only ever sees request ids minted here,
//! so each tunnel's correlator stays collision-free; the reply's id is
//! rewritten back before it leaves.

use crate::relay::{relay_envelope, RelayOutcome};
use crate::server::AppState;
use pgrok_control::Tunnel;
use pgrok_proto::{Frame, HttpRequestEnvelope, HttpResponseEnvelope};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) async fn handle_dispatch(
    state: AppState,
    origin: Arc<Tunnel>,
    envelope: HttpRequestEnvelope,
) {
    let reply = forward_to_sibling(&state, &origin, envelope).await;
    if origin.send(Frame::DispatchResponse(reply)).await.is_err() {
        debug!(
            tunnel_id = origin.id(),
            "dispatch reply dropped, origin channel closed"
        );
    }
}

async fn forward_to_sibling(
    state: &AppState,
    origin: &Arc<Tunnel>,
    envelope: HttpRequestEnvelope,
) -> HttpResponseEnvelope {
    let caller_id = envelope.request_id.clone();

    let segment = envelope
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();
    // Dispatch failures always carry a 5xx status on this channel
    if segment.is_empty() {
        return HttpResponseEnvelope::error(
            &caller_id,
            502,
            "Bad Gateway",
            "dispatch URL does not name a tunnel",
        );
    }

    let sibling = match state.registry.route(&segment) {
        Ok(tunnel) => tunnel,
        Err(_) => {
            warn!(
                tunnel_id = origin.id(),
                sibling = segment,
                "dispatch to unknown tunnel"
            );
            return HttpResponseEnvelope::error(
                &caller_id,
                502,
                "Bad Gateway",
                &format!("no tunnel registered with id '{}'", segment),
            );
        }
    };

    // Fresh id inside the sibling's correlator
    let forwarded = HttpRequestEnvelope {
        request_id: Uuid::new_v4().to_string(),
        ..envelope
    };

    let outcome = relay_envelope(&sibling, forwarded, Frame::Dispatch, state.request_deadline).await;
    let mut reply = match outcome {
        RelayOutcome::Response(reply) => reply,
        RelayOutcome::TimedOut => HttpResponseEnvelope::error(
            &caller_id,
            504,
            "Gateway Timeout",
            &format!(
                "tunnel '{}' did not answer within {} seconds",
                segment,
                state.request_deadline.as_secs()
            ),
        ),
        RelayOutcome::Disconnected => HttpResponseEnvelope::error(
            &caller_id,
            503,
            "Tunnel Disconnected",
            &format!("tunnel '{}' disconnected during dispatch", segment),
        ),
        RelayOutcome::FatalCorrelation => HttpResponseEnvelope::error(
            &caller_id,
            500,
            "Internal Server Error",
            "request correlation failed",
        ),
    };

    reply.request_id = caller_id;
    reply
}
