//! Protocol envelope types
//!
//! All envelopes are JSON objects with camelCase field names. Binary payloads
//! (HTTP bodies, TCP data chunks) travel base64-encoded inside the JSON. A
//! `null` body means "no body"; an empty string is a present, 0-byte body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Forwarded HTTP request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestEnvelope {
    pub request_id: String,
    pub method: String,
    /// Full original URL (path + query) as seen by the public listener
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    #[serde(default)]
    pub is_web_socket_request: bool,
    #[serde(default)]
    pub is_blazor_request: bool,
}

impl HttpRequestEnvelope {
    /// Path portion of the forwarded URL, without the query string
    pub fn path(&self) -> &str {
        let without_query = self.url.split('?').next().unwrap_or(&self.url);
        // Tolerate absolute-form URLs from older peers
        if let Some(rest) = without_query
            .strip_prefix("http://")
            .or_else(|| without_query.strip_prefix("https://"))
        {
            match rest.find('/') {
                Some(idx) => &rest[idx..],
                None => "/",
            }
        } else {
            without_query
        }
    }

    /// Query string of the forwarded URL, if any
    pub fn query(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, q)| q)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Reply to a forwarded HTTP request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseEnvelope {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl HttpResponseEnvelope {
    /// Build an error reply with a JSON diagnostic body
    pub fn error(request_id: &str, status_code: u16, error: &str, message: &str) -> Self {
        let body = serde_json::json!({ "error": error, "message": message });
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            request_id: request_id.to_string(),
            status_code,
            headers,
            body: Some(body.to_string().into_bytes()),
            error_message: Some(message.to_string()),
        }
    }
}

/// TCP mux frame kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TcpMessageKind {
    Init,
    Data,
    Close,
    Error,
    Control,
}

/// One frame of a multiplexed TCP sub-stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TcpEnvelope {
    #[serde(rename = "type")]
    pub kind: TcpMessageKind,
    pub connection_id: String,
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Advisory only; never used for ordering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TcpEnvelope {
    fn bare(kind: TcpMessageKind, connection_id: &str) -> Self {
        Self {
            kind,
            connection_id: connection_id.to_string(),
            data: None,
            host: None,
            port: None,
            error: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn init(connection_id: &str) -> Self {
        Self::bare(TcpMessageKind::Init, connection_id)
    }

    pub fn data(connection_id: &str, chunk: Vec<u8>) -> Self {
        Self {
            data: Some(chunk),
            ..Self::bare(TcpMessageKind::Data, connection_id)
        }
    }

    pub fn close(connection_id: &str) -> Self {
        Self::bare(TcpMessageKind::Close, connection_id)
    }

    pub fn error(connection_id: &str, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::bare(TcpMessageKind::Error, connection_id)
        }
    }

    /// Heartbeat control frame emitted by TCP clients
    pub fn heartbeat() -> Self {
        Self::bare(TcpMessageKind::Control, "heartbeat")
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == TcpMessageKind::Control && self.connection_id == "heartbeat"
    }
}

/// Relayed WebSocket data chunk
///
/// Kept for wire compatibility; bidirectional WebSocket passthrough is not
/// implemented and both processing loops discard these frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WsRelayEnvelope {
    pub connection_id: String,
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default)]
    pub is_close: bool,
}

mod base64_opt {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => BASE64
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
