use std::collections::BTreeMap;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};

pub const HTTP_REQUEST_KIND: &str = "tunnel:http_request";
pub const HTTP_RESPONSE_KIND: &str = "tunnel:http_response";

/// One HTTP request as it travels to the peer.
///
/// `body: None` means the inbound request carried no body at all, which the
/// peer must be able to tell apart from `Some("")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunneledRequest {
    pub method: String,
    /// Path including the query string, e.g. `/foo?x=1`.
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunneledResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Outbound frame. The envelope carries no request id: replies are
/// correlated by which request the socket is currently serving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEnvelope<T> {
    pub kind: String,
    pub payload: T,
}

impl ProtocolEnvelope<TunneledRequest> {
    pub fn http_request(payload: TunneledRequest) -> Self {
        Self {
            kind: HTTP_REQUEST_KIND.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboundResponseEnvelope {
    #[serde(default)]
    kind: Option<String>,
    payload: TunneledResponse,
}

/// A frame received on a tunnel socket, as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl From<String> for RawMessage {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for RawMessage {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

pub fn encode_request(request: &TunneledRequest) -> Result<String> {
    serde_json::to_string(&ProtocolEnvelope::http_request(request.clone())).map_err(|error| {
        TunnelError::ProtocolViolation(format!("failed to encode request envelope: {error}"))
    })
}

/// Decode a reply frame. Binary frames, malformed JSON, a foreign `kind` and
/// out-of-range status codes are all protocol violations.
pub fn decode_response(raw: &RawMessage) -> Result<TunneledResponse> {
    let text = match raw {
        RawMessage::Text(text) => text,
        RawMessage::Binary(bytes) => {
            return Err(TunnelError::ProtocolViolation(format!(
                "expected JSON text message, got {} binary bytes",
                bytes.len()
            )));
        }
    };

    let envelope: InboundResponseEnvelope = serde_json::from_str(text).map_err(|error| {
        TunnelError::ProtocolViolation(format!("malformed response envelope: {error}"))
    })?;

    if let Some(kind) = envelope.kind.as_deref() {
        if kind != HTTP_RESPONSE_KIND {
            return Err(TunnelError::ProtocolViolation(format!(
                "unexpected message kind `{kind}`"
            )));
        }
    }

    if StatusCode::from_u16(envelope.payload.status).is_err() {
        return Err(TunnelError::ProtocolViolation(format!(
            "invalid HTTP status {}",
            envelope.payload.status
        )));
    }

    Ok(envelope.payload)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn request_envelope_has_kind_and_null_body() {
        let request = TunneledRequest {
            method: "GET".into(),
            path: "/foo?x=1".into(),
            headers: BTreeMap::from([("a".to_string(), "1".to_string())]),
            body: None,
        };
        let encoded: Value = serde_json::from_str(&encode_request(&request).unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({
                "kind": "tunnel:http_request",
                "payload": {
                    "method": "GET",
                    "path": "/foo?x=1",
                    "headers": { "a": "1" },
                    "body": null,
                }
            })
        );
    }

    #[test]
    fn empty_body_is_kept_distinct_from_absent() {
        let request = TunneledRequest {
            method: "POST".into(),
            path: "/".into(),
            headers: BTreeMap::new(),
            body: Some(String::new()),
        };
        let encoded: Value = serde_json::from_str(&encode_request(&request).unwrap()).unwrap();
        assert_eq!(encoded["payload"]["body"], json!(""));
    }

    #[test]
    fn response_kind_is_optional() {
        let raw = RawMessage::from(r#"{"payload":{"status":200,"headers":{"b":"2"},"body":"ok"}}"#);
        let response = decode_response(&raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("b").map(String::as_str), Some("2"));
        assert_eq!(response.body.as_deref(), Some("ok"));
    }

    #[test]
    fn response_headers_and_body_default() {
        let raw = RawMessage::from(r#"{"kind":"tunnel:http_response","payload":{"status":204}}"#);
        let response = decode_response(&raw).unwrap();
        assert!(response.headers.is_empty());
        assert!(response.body.is_none());
    }

    #[test]
    fn binary_frame_is_protocol_violation() {
        let err = decode_response(&RawMessage::Binary(vec![1, 2, 3])).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn non_json_is_protocol_violation() {
        let err = decode_response(&RawMessage::from("not json")).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn wrong_kind_is_protocol_violation() {
        let raw = RawMessage::from(r#"{"kind":"tunnel:http_request","payload":{"status":200}}"#);
        assert!(decode_response(&raw).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn missing_status_is_protocol_violation() {
        let raw = RawMessage::from(r#"{"payload":{"headers":{}}}"#);
        assert!(decode_response(&raw).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn out_of_range_status_is_protocol_violation() {
        let raw = RawMessage::from(r#"{"payload":{"status":42}}"#);
        assert!(decode_response(&raw).unwrap_err().is_protocol_violation());
    }
}
