//! Transmission RPC transport
//!
//! Requests are JSON objects `{"method", "arguments"}` posted to a single
//! endpoint. The daemon answers `{"result", "arguments"}`, where a result
//! other than `"success"` is a failure of that one call and not of the
//! connection. Connection level failures are reported as `RequestFailure`.

pub mod client;
pub mod tls;
pub mod transport;

pub use client::{HttpClient, HttpReply, HttpRequest, NetworkError, NetworkErrorKind, ReqwestClient};
pub use tls::{ExpectedTlsErrors, TlsError, TlsErrorKind};
pub use transport::{RequestId, RequestRouter, RouterOutput, TransportEvent};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::JsonObject;

/// Header carrying the session token in both directions.
pub const SESSION_ID_HEADER: &str = "X-Transmission-Session-Id";

/// Connection level failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcErrorKind {
    TimedOut,
    ConnectionError,
    AuthenticationError,
    ParseError,
    ServerTooOld,
    ServerTooNew,
}

impl RpcErrorKind {
    /// Short message used when the failure carries no text of its own.
    pub fn description(self) -> &'static str {
        match self {
            RpcErrorKind::TimedOut => "Timed out",
            RpcErrorKind::ConnectionError => "Connection error",
            RpcErrorKind::AuthenticationError => "Authentication error",
            RpcErrorKind::ParseError => "Parse error",
            RpcErrorKind::ServerTooOld => "Server is too old",
            RpcErrorKind::ServerTooNew => "Server is too new",
        }
    }
}

impl std::fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// A request that failed for good, after any retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RequestFailure {
    pub kind: RpcErrorKind,
    pub message: String,
    /// Diagnostic dump of the failed exchange
    pub detailed_message: String,
}

impl RequestFailure {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detailed_message: String::new(),
        }
    }
}

/// A parsed reply of the daemon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub arguments: JsonObject,
    /// Whether `result` was `"success"`
    pub success: bool,
    pub result: String,
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    method: &'a str,
    arguments: &'a JsonObject,
}

/// Serializes a request body.
pub fn encode_request(method: &str, arguments: &JsonObject) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&RequestEnvelope { method, arguments })
}

/// Parses a reply body. Fails only if it is not valid JSON.
///
/// A reply without a `result` string is an unsuccessful call, and
/// anything but an `arguments` object reads as no arguments.
pub fn parse_response(body: &[u8]) -> serde_json::Result<Response> {
    let reply = match serde_json::from_slice(body)? {
        Value::Object(reply) => reply,
        _ => JsonObject::new(),
    };
    let result = reply
        .get("result")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let arguments = match reply.get("arguments") {
        Some(Value::Object(arguments)) => arguments.clone(),
        _ => JsonObject::new(),
    };
    Ok(Response {
        success: result == "success",
        result,
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_envelope() {
        let arguments = json!({"ids": [1]}).as_object().cloned().unwrap();
        let body = encode_request("torrent-start", &arguments).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value, json!({"method": "torrent-start", "arguments": {"ids": [1]}}));
    }

    #[test]
    fn test_response_result_decides_success() {
        let ok = parse_response(br#"{"result": "success", "arguments": {"a": 1}}"#).unwrap();
        assert!(ok.success);
        assert_eq!(ok.arguments.get("a"), Some(&json!(1)));

        let failed = parse_response(br#"{"result": "invalid argument"}"#).unwrap();
        assert!(!failed.success);
        assert_eq!(failed.result, "invalid argument");
        assert!(failed.arguments.is_empty());
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        assert!(parse_response(b"<html>").is_err());
        assert!(parse_response(b"").is_err());
    }

    #[test]
    fn test_reply_without_result_is_unsuccessful() {
        let missing = parse_response(br#"{"arguments": {"a": 1}}"#).unwrap();
        assert!(!missing.success);
        assert_eq!(missing.result, "");
        assert_eq!(missing.arguments.get("a"), Some(&json!(1)));

        let null_arguments =
            parse_response(br#"{"result": "success", "arguments": null}"#).unwrap();
        assert!(null_arguments.success);
        assert!(null_arguments.arguments.is_empty());

        let not_an_object = parse_response(br#"[1, 2]"#).unwrap();
        assert!(!not_an_object.success);
    }
}
