//! Small HTTP helpers shared by the Agent, Accept, and Hub surfaces.
//! Grounded on `original_source/request/http.go`: `GetTraceID` (reuse an
//! incoming `X-Trace-Id` or mint one) and `ResponseJSON`.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{HeaderMap, Request, Response, StatusCode};
use serde::Serialize;
use uuid::Uuid;

pub type RespBody = Full<Bytes>;

const TRACE_ID: &str = "X-Trace-Id";

/// Reuse the incoming `X-Trace-Id` header, or mint a fresh UUID.
pub fn trace_id(headers: &HeaderMap) -> String {
    headers
        .get(TRACE_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn json_response(code: StatusCode, body: &impl Serialize, trace_id: &str) -> Response<RespBody> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{\"Error\":\"json encode failed\"}".to_vec());
    Response::builder()
        .status(code)
        .header("Content-Type", "application/json")
        .header(TRACE_ID, trace_id)
        .body(Full::new(Bytes::from(bytes)))
        .expect("valid response")
}

pub fn empty_response(code: StatusCode) -> Response<RespBody> {
    Response::builder()
        .status(code)
        .body(Full::new(Bytes::new()))
        .expect("valid response")
}

fn header_contains(headers: &HeaderMap, name: &str, value: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case(value))
}

/// `isWebsocket(r)` from `original_source/interact.go`: a GET request
/// carrying `Connection: Upgrade` and `Upgrade: websocket`.
pub fn is_websocket<B>(req: &Request<B>) -> bool {
    req.method() == hyper::Method::GET
        && header_contains(req.headers(), "Connection", "upgrade")
        && header_contains(req.headers(), "Upgrade", "websocket")
}

/// `HttpProxy.IsProxyRequest` from `original_source/proxy/http.go`: an
/// absolute-form request URI, or a `CONNECT` request.
pub fn is_proxy_request<B>(req: &Request<B>) -> bool {
    req.uri().scheme().is_some() || req.method() == hyper::Method::CONNECT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: hyper::Method, uri: &str, headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn trace_id_reuses_incoming_header() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_ID, "abc-123".parse().unwrap());
        assert_eq!(trace_id(&headers), "abc-123");
    }

    #[test]
    fn trace_id_mints_one_when_absent() {
        let headers = HeaderMap::new();
        assert_eq!(trace_id(&headers).len(), 36);
    }

    #[test]
    fn is_websocket_requires_get_and_both_headers() {
        let upgrade = request(
            hyper::Method::GET,
            "/",
            &[("Connection", "Upgrade"), ("Upgrade", "websocket")],
        );
        assert!(is_websocket(&upgrade));

        let post = request(
            hyper::Method::POST,
            "/",
            &[("Connection", "Upgrade"), ("Upgrade", "websocket")],
        );
        assert!(!is_websocket(&post));

        let no_upgrade = request(hyper::Method::GET, "/", &[("Connection", "keep-alive")]);
        assert!(!is_websocket(&no_upgrade));
    }

    #[test]
    fn is_proxy_request_detects_absolute_uri_and_connect() {
        let absolute = request(hyper::Method::GET, "http://example.com/", &[]);
        assert!(is_proxy_request(&absolute));

        let connect = request(hyper::Method::CONNECT, "example.com:443", &[]);
        assert!(is_proxy_request(&connect));

        let origin_form = request(hyper::Method::GET, "/path", &[]);
        assert!(!is_proxy_request(&origin_form));
    }
}
