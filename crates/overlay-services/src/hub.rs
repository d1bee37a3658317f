//! The Hub service (§4.6 salient fields: `Listen`). Grounded on
//! `original_source/hub/hub.go`: an authenticated server-role complement
//! of `Accept` — every websocket upgrade must carry a Notary-signed
//! bearer token whose decoded payload names the session's `Domain`
//! (parsed as a `network://address` pair, becoming the tunnel's
//! `agent_addr`) and which of dial/listen it's permitted to run.
//!
//! The payload schema (`{"Domain","Dial","Listen"}`) is not pinned down
//! by the distilled spec; this is the same shape `original_source`'s
//! `Access` struct carries as the Notary statement, kept flat here
//! rather than nested under a `Statement` wrapper (see DESIGN.md).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use yamux::Mode;

use overlay_core::error::{OverlayError, OverlayResult};
use overlay_core::notary::{InMemoryKeyStore, Notary};
use overlay_core::registry::Capabilities;
use overlay_core::service::Service;
use overlay_core::SyntheticAddr;

use overlay_tunnel::bind::{bind, Policy};
use overlay_tunnel::ws::{from_raw_socket, wrap_as_byte_stream};

use crate::http_util::{empty_response, is_websocket, RespBody};

#[derive(Deserialize)]
struct HubDoc {
    #[serde(rename = "Type")]
    type_: String,
    #[serde(rename = "Listen")]
    listen: String,
    #[serde(rename = "AllowNoneSign", default)]
    allow_none_sign: bool,
}

#[derive(Deserialize)]
struct AccessStatement {
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "Dial", default)]
    dial: bool,
    #[serde(rename = "Listen", default)]
    listen: bool,
}

struct Config {
    listen: String,
    allow_none_sign: bool,
}

pub struct Hub {
    caps: Capabilities,
    logger: tracing::Span,
    type_name: String,
    config: Option<Config>,
    stop: Option<CancellationToken>,
}

impl Hub {
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
            .ok_or_else(|| OverlayError::Config("Hub not configured".into()))?;

        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(OverlayError::Io)?;

        let notary = Arc::new(Notary::new(
            config.allow_none_sign,
            Some(Box::new(InMemoryKeyStore::new())),
        ));
        let intranet = self.caps.intranet.clone();

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
                            warn!(error = %e, "hub: accept failed");
                            continue;
                        }
                    },
                };

                let notary = notary.clone();
                let intranet = intranet.clone();
                let child = child.clone();
                let logger = logger.clone();

                tokio::spawn(async move {
                    let _guard = logger.enter();
                    info!(from = %peer, "new connection");

                    let io = TokioIo::new(stream);
                    let service = hyper::service::service_fn(move |req| {
                        let notary = notary.clone();
                        let intranet = intranet.clone();
                        let child = child.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(handle(req, notary, intranet, child).await)
                        }
                    });

                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!(error = %e, "hub: connection ended");
                    }
                });
            }
        });

        self.stop = Some(ctx);
        Ok(())
    }
}

fn bearer_token(req: &Request<hyper::body::Incoming>) -> Option<&str> {
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn handle(
    mut req: Request<hyper::body::Incoming>,
    notary: Arc<Notary>,
    intranet: overlay_core::Intranet,
    ctx: CancellationToken,
) -> Response<RespBody> {
    if !is_websocket(&req) {
        return empty_response(StatusCode::BAD_REQUEST);
    }

    let Some(token) = bearer_token(&req) else {
        return empty_response(StatusCode::UNAUTHORIZED);
    };

    let decoded = match notary.decode_token(token) {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "hub: token decode failed");
            return empty_response(StatusCode::UNAUTHORIZED);
        }
    };

    let statement: AccessStatement = match serde_json::from_slice(&decoded.payload) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "hub: malformed statement payload");
            return empty_response(StatusCode::UNAUTHORIZED);
        }
    };

    let Some((network, address)) = statement.domain.split_once("://") else {
        warn!(domain = %statement.domain, "hub: statement domain is not network://address");
        return empty_response(StatusCode::UNAUTHORIZED);
    };
    let agent_addr = SyntheticAddr::new(network.to_string(), address.to_string());
    let policy = Policy {
        dial: statement.dial,
        listen: statement.listen,
    };

    let Some(key) = req.headers().get("Sec-WebSocket-Key").cloned() else {
        return empty_response(StatusCode::BAD_REQUEST);
    };
    let accept_key = derive_accept_key(key.as_bytes());

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(&mut req).await {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "hub: websocket upgrade failed");
                return;
            }
        };

        let io = TokioIo::new(upgraded);
        let ws = from_raw_socket(io, Role::Server).await;
        let (app_side, _pump) = wrap_as_byte_stream(ws);

        if let Err(e) = bind(&ctx, app_side, Mode::Server, intranet, agent_addr, policy).await {
            debug!(error = %e, "hub: tunnel session ended");
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "websocket")
        .header("Sec-WebSocket-Accept", accept_key)
        .body(Full::new(Bytes::new()))
        .expect("valid response")
}

#[async_trait]
impl Service for Hub {
    fn to_json(&self) -> OverlayResult<Value> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| OverlayError::Config("Hub not configured".into()))?;
        Ok(json!({
            "Type": self.type_name,
            "Listen": config.listen,
            "AllowNoneSign": config.allow_none_sign,
        }))
    }

    async fn from_json(&mut self, data: &Value) -> OverlayResult<()> {
        let _guard = self.logger.enter();
        info!("UnmarshalJSON");

        let doc: HubDoc =
            serde_json::from_value(data.clone()).map_err(|e| OverlayError::Config(e.to_string()))?;

        if doc.type_ != self.type_name {
            return Err(OverlayError::ServiceType);
        }

        let need_restart = match &self.config {
            Some(current) => current.listen != doc.listen,
            None => true,
        };

        self.config = Some(Config {
            listen: doc.listen,
            allow_none_sign: doc.allow_none_sign,
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

impl Drop for Hub {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
    }
}

pub fn register(registry: &mut overlay_core::registry::Registry) {
    registry.register(
        "Hub",
        Arc::new(|caps: &Capabilities| Box::new(Hub::new("Hub", caps.clone())) as Box<dyn Service>),
    );
}
