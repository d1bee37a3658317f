//! The Accept service (§4.6 salient fields: `Listen`, `Agent`,
//! `Forward`). Grounded on `original_source/interact.go`'s `Accept`:
//! server-role complement of `Access` — a real TCP listener whose
//! websocket-upgrade requests become tunnel sessions bound at the
//! `Agent` address, and whose ordinary requests are reverse-proxied to
//! the fixed `Forward` target.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use yamux::Mode;

use overlay_core::error::{OverlayError, OverlayResult};
use overlay_core::registry::Capabilities;
use overlay_core::service::Service;
use overlay_core::SyntheticAddr;

use overlay_tunnel::bind::{bind, Policy};
use overlay_tunnel::ws::{from_raw_socket, wrap_as_byte_stream};

use crate::http_util::{empty_response, is_websocket, RespBody};

#[derive(Deserialize)]
struct AcceptDoc {
    #[serde(rename = "Type")]
    type_: String,
    #[serde(rename = "Listen")]
    listen: String,
    #[serde(rename = "Agent")]
    agent: String,
    #[serde(rename = "Forward")]
    forward: String,
}

struct Config {
    listen: String,
    agent: url::Url,
    forward: url::Url,
}

pub struct Accept {
    caps: Capabilities,
    logger: tracing::Span,
    type_name: String,
    config: Option<Config>,
    stop: Option<CancellationToken>,
}

impl Accept {
    pub fn new(type_name: impl Into<String>, caps: Capabilities) -> Self {
        let type_name = type_name.into();
        let logger = caps.logger(&type_name);
        Self {
            caps,
            logger,
            type_name,
            config: None,
            stop: None,
        }
    }

    async fn start(&mut self) -> OverlayResult<()> {
        let _guard = self.logger.enter();
        info!("start");

        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }

        let config = self
            .config
            .as_ref()
            .ok_or_else(|| OverlayError::Config("Accept not configured".into()))?;

        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(OverlayError::Io)?;

        let agent_addr = SyntheticAddr::new(config.agent.scheme(), host_with_port(&config.agent));
        let forward_scheme = config.forward.scheme().to_string();
        let forward_host = host_with_port(&config.forward);
        let intranet = self.caps.intranet.clone();
        let listen_label = config.listen.clone();

        let ctx = CancellationToken::new();
        let child = ctx.clone();
        let logger = self.logger.clone();

        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = child.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok(pair) => pair,
                        Err(e) => {
                            let _guard = logger.enter();
                            warn!(error = %e, "accept: accept failed");
                            continue;
                        }
                    },
                };

                let agent_addr = agent_addr.clone();
                let forward_scheme = forward_scheme.clone();
                let forward_host = forward_host.clone();
                let intranet = intranet.clone();
                let listen_label = listen_label.clone();
                let child = child.clone();
                let logger = logger.clone();

                tokio::spawn(async move {
                    let _guard = logger.enter();
                    info!(from = %peer, "new connection");

                    let io = TokioIo::new(stream);
                    let service = hyper::service::service_fn(move |req| {
                        let agent_addr = agent_addr.clone();
                        let forward_scheme = forward_scheme.clone();
                        let forward_host = forward_host.clone();
                        let intranet = intranet.clone();
                        let listen_label = listen_label.clone();
                        let child = child.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                handle(
                                    req,
                                    agent_addr,
                                    forward_scheme,
                                    forward_host,
                                    intranet,
                                    listen_label,
                                    child,
                                )
                                .await,
                            )
                        }
                    });

                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!(error = %e, "accept: connection ended");
                    }
                });
            }
        });

        self.stop = Some(ctx);
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle(
    mut req: Request<hyper::body::Incoming>,
    agent_addr: SyntheticAddr,
    forward_scheme: String,
    forward_host: String,
    intranet: overlay_core::Intranet,
    listen_label: String,
    ctx: CancellationToken,
) -> Response<RespBody> {
    if is_websocket(&req) {
        let Some(key) = req.headers().get("Sec-WebSocket-Key").cloned() else {
            return empty_response(StatusCode::BAD_REQUEST);
        };
        let accept_key = derive_accept_key(key.as_bytes());

        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(&mut req).await {
                Ok(u) => u,
                Err(e) => {
                    warn!(error = %e, "accept: websocket upgrade failed");
                    return;
                }
            };

            let io = TokioIo::new(upgraded);
            let ws = from_raw_socket(io, Role::Server).await;
            let (app_side, _pump) = wrap_as_byte_stream(ws);

            if let Err(e) = bind(
                &ctx,
                app_side,
                Mode::Server,
                intranet,
                agent_addr,
                Policy::default(),
            )
            .await
            {
                debug!(error = %e, "accept: tunnel session ended");
            }
        });

        return Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, "websocket")
            .header("Sec-WebSocket-Accept", accept_key)
            .body(Full::new(Bytes::new()))
            .expect("valid response");
    }

    forward_request(req, &forward_scheme, &forward_host, &intranet, &listen_label).await
}

async fn forward_request(
    req: Request<hyper::body::Incoming>,
    forward_scheme: &str,
    forward_host: &str,
    intranet: &overlay_core::Intranet,
    listen_label: &str,
) -> Response<RespBody> {
    let endpoint = intranet.assume("accept-forward", listen_label.to_string());
    let ctx = CancellationToken::new();
    let backend = match endpoint.dial(&ctx, forward_scheme.to_string(), forward_host.to_string()).await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "accept: dial to forward target failed");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };

    let io = TokioIo::new(backend);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "accept: handshake with forward target failed");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "accept: forward connection ended");
        }
    });

    let response = match sender.send_request(req).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "accept: forward request failed");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };

    let (parts, body) = response.into_parts();
    let collected = match body.collect().await {
        Ok(c) => c.to_bytes(),
        Err(e) => {
            warn!(error = %e, "accept: reading forward response body failed");
            return empty_response(StatusCode::BAD_GATEWAY);
        }
    };

    Response::from_parts(parts, Full::new(collected))
}

fn host_with_port(url: &url::Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_string(),
        (None, _) => String::new(),
    }
}

#[async_trait]
impl Service for Accept {
    fn to_json(&self) -> OverlayResult<Value> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| OverlayError::Config("Accept not configured".into()))?;
        Ok(json!({
            "Type": self.type_name,
            "Listen": config.listen,
            "Agent": config.agent.as_str(),
            "Forward": config.forward.as_str(),
        }))
    }

    async fn from_json(&mut self, data: &Value) -> OverlayResult<()> {
        let _guard = self.logger.enter();
        info!("UnmarshalJSON");

        let doc: AcceptDoc =
            serde_json::from_value(data.clone()).map_err(|e| OverlayError::Config(e.to_string()))?;

        if doc.type_ != self.type_name {
            return Err(OverlayError::ServiceType);
        }

        let agent = url::Url::parse(&doc.agent).map_err(|e| OverlayError::Config(e.to_string()))?;
        let forward = url::Url::parse(&doc.forward).map_err(|e| OverlayError::Config(e.to_string()))?;

        let need_restart = match &self.config {
            Some(current) => {
                current.listen != doc.listen || current.agent != agent || current.forward != forward
            }
            None => true,
        };

        self.config = Some(Config {
            listen: doc.listen,
            agent,
            forward,
        });

        if need_restart {
            self.start().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> OverlayResult<()> {
        let _guard = self.logger.enter();
        info!("Close");
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
        Ok(())
    }
}

impl Drop for Accept {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
    }
}

pub fn register(registry: &mut overlay_core::registry::Registry) {
    registry.register(
        "Accept",
        Arc::new(|caps: &Capabilities| Box::new(Accept::new("Accept", caps.clone())) as Box<dyn Service>),
    );
}
