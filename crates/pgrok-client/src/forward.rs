//! Local HTTP forwarding
//!
//! Replays a forwarded request envelope against the configured local service
//! and marshals the reply back into a response envelope. Upstream failures
//! become 5xx envelopes with a diagnostic body; they never take down the
//! processing loop.

use crate::ClientError;
use pgrok_control::LOCAL_CALL_DEADLINE;
use pgrok_proto::{HttpRequestEnvelope, HttpResponseEnvelope};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::collections::HashMap;
use tracing::{debug, warn};
use url::Url;

pub struct LocalForwarder {
    client: reqwest::Client,
    base: Url,
    tunnel_id: String,
}

impl LocalForwarder {
    pub fn new(base: Url, tunnel_id: impl Into<String>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(LOCAL_CALL_DEADLINE)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base,
            tunnel_id: tunnel_id.into(),
        })
    }

    /// Perform the local call for one forwarded request
    pub async fn forward(&self, envelope: HttpRequestEnvelope) -> HttpResponseEnvelope {
        let request_id = envelope.request_id.clone();

        let local_url = match self.local_url(&envelope) {
            Ok(url) => url,
            Err(message) => {
                return HttpResponseEnvelope::error(&request_id, 502, "Bad Gateway", &message)
            }
        };

        let method = match Method::from_bytes(envelope.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return HttpResponseEnvelope::error(
                    &request_id,
                    502,
                    "Bad Gateway",
                    &format!("invalid method '{}'", envelope.method),
                )
            }
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &envelope.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(name, value);
            }
        }

        debug!(request_id, %local_url, "forwarding to local service");

        let mut request = self.client.request(method, local_url).headers(headers);
        if let Some(body) = envelope.body {
            request = request.body(body);
        }

        match request.send().await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                let mut headers: HashMap<String, String> = HashMap::new();
                for (name, value) in response.headers() {
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

                match response.bytes().await {
                    Ok(body) => HttpResponseEnvelope {
                        request_id,
                        status_code,
                        headers,
                        body: Some(body.to_vec()),
                        error_message: None,
                    },
                    Err(err) => {
                        warn!(request_id, %err, "failed to read local response body");
                        HttpResponseEnvelope::error(
                            &request_id,
                            502,
                            "Bad Gateway",
                            &format!("failed to read local response body: {}", err),
                        )
                    }
                }
            }
            Err(err) => {
                warn!(request_id, %err, "local service call failed");
                if err.is_timeout() {
                    HttpResponseEnvelope::error(
                        &request_id,
                        504,
                        "Gateway Timeout",
                        &format!(
                            "local service did not answer within {} seconds",
                            LOCAL_CALL_DEADLINE.as_secs()
                        ),
                    )
                } else {
                    HttpResponseEnvelope::error(
                        &request_id,
                        502,
                        "Bad Gateway",
                        &format!("local service call failed: {}", err),
                    )
                }
            }
        }
    }

    /// Join the derived local path and original query onto the base URL
    fn local_url(&self, envelope: &HttpRequestEnvelope) -> Result<Url, String> {
        let path = derive_local_path(&self.tunnel_id, envelope.path());
        let mut url = self.base.clone();
        let joined = format!("{}{}", self.base.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url.set_query(envelope.query());
        Ok(url)
    }
}

/// Strip the `/<tunnel-id>/` prefix when present, else use the path as-is
pub(crate) fn derive_local_path(tunnel_id: &str, path: &str) -> String {
    let prefix = format!("/{}/", tunnel_id);
    if let Some(rest) = path.strip_prefix(&prefix) {
        format!("/{}", rest)
    } else if path == format!("/{}", tunnel_id) {
        "/".to_string()
    } else {
        path.to_string()
    }
}

/// Headers never replayed against the local service
pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    name.starts_with(':')
        || name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("content-length")
}
