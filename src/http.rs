//! Conversion between axum HTTP types and tunnel envelopes.

use std::collections::BTreeMap;

use axum::{
    body::Body,
    http::{
        header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING},
        HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode,
    },
    response::IntoResponse,
};
use serde_json::json;

use crate::{
    error::{Result, TunnelError},
    protocol::{TunneledRequest, TunneledResponse},
};

/// Marks responses generated by the broker itself rather than the peer.
pub const TUNNEL_ERROR_HEADER: &str = "x-tunnel-broker-error";

/// Headers that describe the hop between broker and caller; hyper derives
/// them from the rebuilt body.
const HOP_HEADERS: [HeaderName; 3] = [CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING];

pub async fn read_request(request: Request<Body>, max_body_bytes: usize) -> Result<TunneledRequest> {
    let (parts, body) = request.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let declares_body = parts.headers.contains_key(CONTENT_LENGTH)
        || parts.headers.contains_key(TRANSFER_ENCODING);

    let bytes = axum::body::to_bytes(body, max_body_bytes)
        .await
        .map_err(|_| TunnelError::BodyTooLarge(max_body_bytes))?;
    let body = if bytes.is_empty() && !declares_body {
        None
    } else {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    };

    Ok(TunneledRequest {
        method: parts.method.as_str().to_string(),
        path,
        headers: flatten_headers(&parts.headers),
        body,
    })
}

/// Collapse a header map to one string per name; repeated headers are joined
/// with `", "`.
pub fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    flat
}

pub fn build_response(tunneled: TunneledResponse) -> Result<Response<Body>> {
    let status = StatusCode::from_u16(tunneled.status).map_err(|_| {
        TunnelError::ProtocolViolation(format!("invalid HTTP status {}", tunneled.status))
    })?;

    let mut response = Response::new(Body::from(tunneled.body.unwrap_or_default()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in tunneled.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            tracing::debug!(
                target = "tunnel_broker::http",
                header = %name,
                "dropping invalid response header from peer"
            );
            continue;
        };
        if HOP_HEADERS.contains(&name) {
            continue;
        }
        headers.append(name, value);
    }
    Ok(response)
}

/// JSON failure body for a request the tunnel could not complete.
pub fn error_response(error: &TunnelError) -> Response<Body> {
    let status = error.status();
    let body = json!({
        "error": {
            "code": error.code(),
            "message": error.to_string(),
            "retryable": error.is_retryable(),
            "statusCode": status.as_u16(),
        }
    });
    let mut response = (status, axum::Json(body)).into_response();
    response.headers_mut().insert(
        TUNNEL_ERROR_HEADER,
        HeaderValue::from_static(error.code()),
    );
    response
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;

    use super::*;

    #[tokio::test]
    async fn get_without_body_has_absent_body() {
        let request = Request::builder()
            .method("GET")
            .uri("/foo?x=1")
            .header("a", "1")
            .body(Body::empty())
            .unwrap();
        let tunneled = read_request(request, 1024).await.unwrap();
        assert_eq!(tunneled.method, "GET");
        assert_eq!(tunneled.path, "/foo?x=1");
        assert_eq!(tunneled.headers.get("a").map(String::as_str), Some("1"));
        assert_eq!(tunneled.body, None);
    }

    #[tokio::test]
    async fn declared_empty_body_is_present() {
        let request = Request::builder()
            .method("POST")
            .uri("/submit")
            .header("content-length", "0")
            .body(Body::empty())
            .unwrap();
        let tunneled = read_request(request, 1024).await.unwrap();
        assert_eq!(tunneled.body.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn body_over_limit_is_rejected() {
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Body::from("x".repeat(64)))
            .unwrap();
        let err = read_request(request, 16).await.unwrap_err();
        assert_eq!(err, TunnelError::BodyTooLarge(16));
    }

    #[test]
    fn repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        let flat = flatten_headers(&headers);
        assert_eq!(flat["accept"], "text/html, application/json");
    }

    #[tokio::test]
    async fn response_is_rebuilt_without_hop_headers() {
        let response = build_response(TunneledResponse {
            status: 404,
            headers: BTreeMap::from([
                ("b".to_string(), "2".to_string()),
                ("content-length".to_string(), "999".to_string()),
            ]),
            body: Some("missing".into()),
        })
        .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["b"], "2");
        assert!(response.headers().get("content-length").is_none());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"missing");
    }

    #[tokio::test]
    async fn error_response_is_marked_as_tunnel_failure() {
        let response = error_response(&TunnelError::PeerUnavailable("gone".into()));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[TUNNEL_ERROR_HEADER], "peer_unavailable");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["code"], "peer_unavailable");
        assert_eq!(body["error"]["statusCode"], 502);
        assert_eq!(body["error"]["retryable"], true);
    }
}
