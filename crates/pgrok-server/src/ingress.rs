//! Public HTTP ingress
//!
//! Every path except the reserved `/$status` and `/tunnel` routes to a
//! tunnel by its `/<tunnel-id>/` prefix (any path in single-tunnel mode).
//! Each request is marshalled into an envelope, correlated by a fresh
//! request id and answered from the control channel.

use crate::relay::{relay_envelope, RelayOutcome};
use crate::server::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING, UPGRADE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use pgrok_proto::{Frame, HttpRequestEnvelope, HttpResponseEnvelope, MAX_FRAME_SIZE};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub(crate) async fn proxy_request(State(state): State<AppState>, req: Request) -> Response {
    let started = Instant::now();

    if is_websocket_upgrade(req.headers()) {
        // Bidirectional WebSocket passthrough is not implemented
        return error_response(
            StatusCode::NOT_IMPLEMENTED,
            "Not Implemented",
            "WebSocket passthrough is not supported by this relay",
        );
    }

    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let segment = first_segment(&path);

    let tunnel = if state.registry.single_tunnel_mode() {
        match state.registry.route(segment.unwrap_or_default()) {
            Ok(tunnel) => tunnel,
            Err(_) => return unknown_tunnel_response(&state, segment.unwrap_or_default()),
        }
    } else {
        let Some(segment) = segment else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Bad Request",
                "request path does not name a tunnel",
            );
        };
        match state.registry.route(segment) {
            Ok(tunnel) => tunnel,
            Err(_) => return unknown_tunnel_response(&state, segment),
        }
    };

    let body = match axum::body::to_bytes(body, MAX_FRAME_SIZE).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%err, "failed to buffer request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "Bad Request",
                "request body could not be read",
            );
        }
    };

    let envelope = build_envelope(&parts, body.to_vec());
    let method = envelope.method.clone();
    let tunnel_id = tunnel.id().to_string();

    let outcome = relay_envelope(
        &tunnel,
        envelope,
        Frame::HttpRequest,
        state.request_deadline,
    )
    .await;
    let response = outcome_to_response(&state, outcome);

    info!(
        method,
        path,
        tunnel_id,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "relayed request"
    );
    response
}

pub(crate) fn outcome_to_response(state: &AppState, outcome: RelayOutcome) -> Response {
    match outcome {
        RelayOutcome::Response(envelope) => envelope_to_response(envelope),
        RelayOutcome::TimedOut => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "Gateway Timeout",
            &format!(
                "the tunnel client did not answer within {} seconds",
                state.request_deadline.as_secs()
            ),
        ),
        RelayOutcome::Disconnected => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Tunnel Disconnected",
            "the tunnel disconnected before a response was produced",
        ),
        RelayOutcome::FatalCorrelation => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
            "request correlation failed",
        ),
    }
}

/// First non-empty path segment, the routing prefix
fn first_segment(path: &str) -> Option<&str> {
    let segment = path.trim_start_matches('/').split('/').next()?;
    if segment.is_empty() {
        None
    } else {
        Some(segment)
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn build_envelope(parts: &http::request::Parts, body: Vec<u8>) -> HttpRequestEnvelope {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in parts.headers.iter() {
        if let Ok(text) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(text);
                })
                .or_insert_with(|| text.to_string());
        }
    }

    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.to_string());

    // A 0-byte body is only "no body" when nothing declared one
    let declares_body = parts.headers.contains_key(CONTENT_LENGTH)
        || parts.headers.contains_key(TRANSFER_ENCODING);
    let body = if body.is_empty() && !declares_body {
        None
    } else {
        Some(body)
    };

    HttpRequestEnvelope {
        request_id: Uuid::new_v4().to_string(),
        method: parts.method.to_string(),
        is_blazor_request: url.to_ascii_lowercase().contains("/_blazor"),
        is_web_socket_request: false,
        url,
        headers,
        body,
    }
}

/// Turn a response envelope back into a public HTTP response
pub(crate) fn envelope_to_response(envelope: HttpResponseEnvelope) -> Response {
    let status =
        StatusCode::from_u16(envelope.status_code).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut headers = HeaderMap::new();
    for (name, value) in &envelope.headers {
        // The body is re-buffered; framing headers are re-derived here
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.append(name, value);
        }
    }

    let body = envelope.body.unwrap_or_default();
    (status, headers, Body::from(body)).into_response()
}

pub(crate) fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    let body = serde_json::json!({ "error": error, "message": message });
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn unknown_tunnel_response(state: &AppState, tunnel_id: &str) -> Response {
    let body = serde_json::json!({
        "error": "Unknown Tunnel",
        "message": format!("no tunnel registered with id '{}'", tunnel_id),
        "availableTunnels": state.registry.ids(),
    });
    (
        StatusCode::NOT_FOUND,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
