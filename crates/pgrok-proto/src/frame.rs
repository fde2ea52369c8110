//! Frame codec for the control channel
//!
//! A frame is one UTF-8 text message: either a single-line tagged envelope
//! (`$ping$`, `$pong$`, `$dispatch$…`, `$dispatchresponse$…`, `$wsrelay$…`)
//! or a bare JSON object. Bare objects are disambiguated by key presence:
//! `type` marks a TCP envelope, `method` an HTTP request and `statusCode` an
//! HTTP response. The prefixes contain `$` so they can never collide with
//! JSON.

use crate::envelope::{
    HttpRequestEnvelope, HttpResponseEnvelope, TcpEnvelope, WsRelayEnvelope,
};
use crate::MAX_FRAME_SIZE;
use thiserror::Error;

const PING: &str = "$ping$";
const PONG: &str = "$pong$";
const DISPATCH: &str = "$dispatch$";
const DISPATCH_RESPONSE: &str = "$dispatchresponse$";
const WS_RELAY: &str = "$wsrelay$";

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("empty frame")]
    EmptyFrame,

    #[error("unknown envelope shape (no type/method/statusCode key)")]
    UnknownEnvelope,
}

/// Every message that can travel on a control channel
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ping,
    Pong,
    /// Request forwarded for cross-service dispatch
    Dispatch(HttpRequestEnvelope),
    /// Reply to a dispatch
    DispatchResponse(HttpResponseEnvelope),
    /// Relayed WebSocket chunk (wire compatibility only)
    WsRelay(WsRelayEnvelope),
    /// Public HTTP request forwarded to a client
    HttpRequest(HttpRequestEnvelope),
    /// Reply to a public HTTP request
    HttpResponse(HttpResponseEnvelope),
    /// TCP mux frame
    Tcp(TcpEnvelope),
}

impl Frame {
    /// Encode a frame into one text message
    pub fn encode(&self) -> Result<String, CodecError> {
        let text = match self {
            Frame::Ping => PING.to_string(),
            Frame::Pong => PONG.to_string(),
            Frame::Dispatch(env) => format!("{}{}", DISPATCH, serde_json::to_string(env)?),
            Frame::DispatchResponse(env) => {
                format!("{}{}", DISPATCH_RESPONSE, serde_json::to_string(env)?)
            }
            Frame::WsRelay(env) => format!("{}{}", WS_RELAY, serde_json::to_string(env)?),
            Frame::HttpRequest(env) => serde_json::to_string(env)?,
            Frame::HttpResponse(env) => serde_json::to_string(env)?,
            Frame::Tcp(env) => serde_json::to_string(env)?,
        };

        if text.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(text.len()));
        }
        Ok(text)
    }

    /// Decode one text message into a frame
    pub fn decode(text: &str) -> Result<Frame, CodecError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(text.len()));
        }
        if text.is_empty() {
            return Err(CodecError::EmptyFrame);
        }

        if text == PING {
            return Ok(Frame::Ping);
        }
        if text == PONG {
            return Ok(Frame::Pong);
        }
        if let Some(payload) = text.strip_prefix(DISPATCH_RESPONSE) {
            // Checked before $dispatch$: the two prefixes share a stem
            return Ok(Frame::DispatchResponse(serde_json::from_str(payload)?));
        }
        if let Some(payload) = text.strip_prefix(DISPATCH) {
            return Ok(Frame::Dispatch(serde_json::from_str(payload)?));
        }
        if let Some(payload) = text.strip_prefix(WS_RELAY) {
            return Ok(Frame::WsRelay(serde_json::from_str(payload)?));
        }

        let value: serde_json::Value = serde_json::from_str(text)?;
        let object = value.as_object().ok_or(CodecError::UnknownEnvelope)?;
        if object.contains_key("type") {
            Ok(Frame::Tcp(serde_json::from_value(value)?))
        } else if object.contains_key("method") {
            Ok(Frame::HttpRequest(serde_json::from_value(value)?))
        } else if object.contains_key("statusCode") {
            Ok(Frame::HttpResponse(serde_json::from_value(value)?))
        } else {
            Err(CodecError::UnknownEnvelope)
        }
    }
}
