//! Local reverse-proxy listener
//!
//! Optional HTTP-mode feature: requests arriving on a local port are wrapped
//! in `$dispatch$` envelopes and sent to the server, which forwards them to
//! the sibling tunnel named by the first path segment. Replies arrive as
//! `$dispatchresponse$` frames and are matched through the client's own
//! pending table.

use crate::ClientError;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use pgrok_control::{ControlSender, PendingRequests, REQUEST_DEADLINE};
use pgrok_proto::{Frame, HttpRequestEnvelope, MAX_FRAME_SIZE};
use std::collections::HashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct ProxyState {
    sender: ControlSender,
    pending: PendingRequests,
}

/// Serve the reverse-proxy listener until the session ends
pub async fn serve(
    port: u16,
    sender: ControlSender,
    pending: PendingRequests,
    session: CancellationToken,
) -> Result<(), ClientError> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| ClientError::Connection(format!("failed to bind proxy port {}: {}", port, e)))?;
    info!("reverse proxy listening on 127.0.0.1:{}", port);

    let app = Router::new()
        .fallback(dispatch_request)
        .with_state(ProxyState { sender, pending });

    axum::serve(listener, app)
        .with_graceful_shutdown(session.cancelled_owned())
        .await
        .map_err(|e| ClientError::Connection(format!("reverse proxy failed: {}", e)))
}

async fn dispatch_request(State(state): State<ProxyState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let body = match axum::body::to_bytes(body, MAX_FRAME_SIZE).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%err, "failed to buffer dispatch body");
            return plain_error(StatusCode::BAD_REQUEST, "request body could not be read");
        }
    };

    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in parts.headers.iter() {
        if let Ok(text) = value.to_str() {
            headers.insert(name.as_str().to_string(), text.to_string());
        }
    }

    let declares_body = parts.headers.contains_key(CONTENT_LENGTH)
        || parts.headers.contains_key(TRANSFER_ENCODING);
    let body = if body.is_empty() && !declares_body {
        None
    } else {
        Some(body.to_vec())
    };

    let envelope = HttpRequestEnvelope {
        request_id: Uuid::new_v4().to_string(),
        method: parts.method.to_string(),
        url: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.to_string()),
        headers,
        body,
        is_web_socket_request: false,
        is_blazor_request: false,
    };
    let request_id = envelope.request_id.clone();

    let rx = match state.pending.insert(&request_id) {
        Ok(rx) => rx,
        Err(err) => {
            warn!(%err, "dispatch correlation failed");
            return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "request correlation failed");
        }
    };

    if state.sender.send(Frame::Dispatch(envelope)).await.is_err() {
        state.pending.cancel(&request_id);
        return plain_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Tunnel Disconnected: control channel is down",
        );
    }

    match tokio::time::timeout(REQUEST_DEADLINE, rx).await {
        Ok(Ok(reply)) => {
            let status =
                StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut headers = HeaderMap::new();
            for (name, value) in &reply.headers {
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
            (status, headers, Body::from(reply.body.unwrap_or_default())).into_response()
        }
        Ok(Err(_)) => plain_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Tunnel Disconnected: dispatch abandoned",
        ),
        Err(_) => {
            state.pending.cancel(&request_id);
            plain_error(StatusCode::GATEWAY_TIMEOUT, "dispatch timed out")
        }
    }
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": message,
    });
    (
        status,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
