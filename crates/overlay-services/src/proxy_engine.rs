//! The HTTP proxy engine shared by Agent, Accept, and Proxy: reverse-proxy
//! for plain requests, hijack-and-splice for `CONNECT`. Grounded on
//! `original_source/proxy/http.go`'s `HttpProxy` (`IsProxyRequest`,
//! `ServeHTTP`, `connectCopier`).
//!
//! The dial step is left abstract — each caller supplies a [`DialFn`]
//! that resolves `(network, address)` into a byte stream, whether that's
//! an Intranet pipe, a real TCP socket, or a tunnel-chained connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use overlay_core::error::OverlayResult;

use crate::http_util::{empty_response, RespBody};

pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub type BoxedStream = Pin<Box<dyn DuplexStream>>;
pub type DialFuture = Pin<Box<dyn Future<Output = OverlayResult<BoxedStream>> + Send>>;

/// Resolves a `(network, address)` dial target into an open byte stream.
pub type DialFn = Arc<dyn Fn(String, String) -> DialFuture + Send + Sync>;

pub fn boxed(stream: impl DuplexStream + 'static) -> BoxedStream {
    Box::pin(stream)
}

/// Serve one proxy request: `CONNECT` is hijacked and spliced, anything
/// else is forwarded as a reverse-proxied request over a freshly dialed
/// connection (one connection per request, matching `httputil.ReverseProxy`
/// used without connection pooling here).
pub async fn serve(req: Request<Incoming>, dial: DialFn) -> Response<RespBody> {
    if req.method() == hyper::Method::CONNECT {
        return serve_connect(req, dial).await;
    }
    serve_reverse_proxy(req, dial).await
}

async fn serve_connect(mut req: Request<Incoming>, dial: DialFn) -> Response<RespBody> {
    let Some(host) = req.uri().authority().map(|a| a.to_string()) else {
        return empty_response(StatusCode::BAD_REQUEST);
    };

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(&mut req).await {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "proxy CONNECT: hijack failed");
                return;
            }
        };

        let backend = match dial("tcp".to_string(), host.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, %host, "proxy CONNECT: dial failed");
                return;
            }
        };

        let mut client_io = TokioIo::new(upgraded);
        let mut backend = backend;
        if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
            debug!(error = %e, "proxy CONNECT: splice ended");
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::new()))
        .expect("valid response")
}

async fn serve_reverse_proxy(req: Request<Incoming>, dial: DialFn) -> Response<RespBody> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return empty_response(StatusCode::BAD_REQUEST);
    };

    let stream = match dial("tcp".to_string(), authority.clone()).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, host = %authority, "proxy: dial failed on reverse-proxy request");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };

    let io = TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "proxy: handshake with backend failed");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "proxy: backend connection ended");
        }
    });

    let (parts, body) = req.into_parts();
    let mut forwarded = Request::from_parts(parts, body);
    *forwarded.uri_mut() = match forwarded
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
    {
        Some(pq) => pq.parse().unwrap_or_else(|_| "/".parse().unwrap()),
        None => "/".parse().unwrap(),
    };

    let response = match sender.send_request(forwarded).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "proxy: backend request failed");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };

    let (parts, body) = response.into_parts();
    let collected = match body.collect().await {
        Ok(c) => c.to_bytes(),
        Err(e) => {
            warn!(error = %e, "proxy: reading backend response body failed");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };

    Response::from_parts(parts, Full::new(collected))
}
