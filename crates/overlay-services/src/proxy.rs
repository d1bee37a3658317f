//! The Proxy service (§4.6 salient fields: `Listen`, `Agent`). Grounded
//! on `original_source/proxy.go`'s `HttpProxy`: a real TCP listener
//! running the proxy engine, whose dialer first dials the Intranet at
//! the Agent address, then issues an HTTP CONNECT for whatever host the
//! inbound proxy request names, daisy-chaining exactly like `Forward`
//! but with a per-request target instead of a fixed one.

use std::sync::Arc;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use overlay_core::connect::http_connect;
use overlay_core::error::{OverlayError, OverlayResult};
use overlay_core::registry::Capabilities;
use overlay_core::service::Service;

use crate::http_util::empty_response;
use crate::proxy_engine::{self, boxed, DialFn};

#[derive(Deserialize)]
struct ProxyDoc {
    #[serde(rename = "Type")]
    type_: String,
    #[serde(rename = "Listen")]
    listen: String,
    #[serde(rename = "Agent")]
    agent: String,
    #[serde(rename = "BasicAuth", default)]
    basic_auth: Option<String>,
}

struct Config {
    listen: String,
    agent: url::Url,
    basic_auth: Option<String>,
}

pub struct Proxy {
    caps: Capabilities,
    logger: tracing::Span,
    type_name: String,
    config: Option<Config>,
    stop: Option<CancellationToken>,
}

impl Proxy {
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
            .ok_or_else(|| OverlayError::Config("Proxy not configured".into()))?;

        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(OverlayError::Io)?;

        let endpoint = Arc::new(self.caps.endpoint(config.agent.scheme(), host_with_port(&config.agent)));
        let agent_scheme = config.agent.scheme().to_string();
        let agent_host = host_with_port(&config.agent);
        let basic_auth = config.basic_auth.clone();

        let ctx = CancellationToken::new();
        let child = ctx.clone();
        let logger = self.logger.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _peer) = tokio::select! {
                    _ = child.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok(pair) => pair,
                        Err(e) => {
                            let _guard = logger.enter();
                            warn!(error = %e, "proxy accept failed");
                            continue;
                        }
                    },
                };

                let endpoint = endpoint.clone();
                let agent_scheme = agent_scheme.clone();
                let agent_host = agent_host.clone();
                let basic_auth = basic_auth.clone();
                tokio::spawn(async move {
                    let dial = build_dialer(endpoint, agent_scheme, agent_host);
                    let io = TokioIo::new(stream);
                    let service = hyper::service::service_fn(move |req| {
                        let dial = dial.clone();
                        let basic_auth = basic_auth.clone();
                        async move {
                            if let Some(expected) = &basic_auth {
                                let ok = req
                                    .headers()
                                    .get("Authorization")
                                    .and_then(|v| v.to_str().ok())
                                    .map(|v| v == expected)
                                    .unwrap_or(false);
                                if !ok {
                                    return Ok::<_, std::convert::Infallible>(empty_response(
                                        hyper::StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                                    ));
                                }
                            }
                            Ok(proxy_engine::serve(req, dial).await)
                        }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!(error = %e, "proxy connection ended");
                    }
                });
            }
            let _ = endpoint.close().await;
        });

        self.stop = Some(ctx);
        Ok(())
    }
}

fn build_dialer(
    endpoint: Arc<overlay_core::intranet::Endpoint>,
    agent_scheme: String,
    agent_host: String,
) -> DialFn {
    Arc::new(move |_network: String, address: String| {
        let endpoint = endpoint.clone();
        let agent_scheme = agent_scheme.clone();
        let agent_host = agent_host.clone();
        Box::pin(async move {
            let ctx = tokio_util::sync::CancellationToken::new();
            let mut conn = endpoint.dial(&ctx, agent_scheme, agent_host).await?;
            let trace_id = Uuid::new_v4().to_string();
            http_connect(
                &mut conn,
                &address,
                Some(&[("X-Trace-Id".to_string(), trace_id)]),
            )
            .await?;
            Ok(boxed(conn))
        })
    })
}

fn host_with_port(url: &url::Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_string(),
        (None, _) => String::new(),
    }
}

#[async_trait]
impl Service for Proxy {
    fn to_json(&self) -> OverlayResult<Value> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| OverlayError::Config("Proxy not configured".into()))?;
        Ok(json!({
            "Type": self.type_name,
            "Listen": config.listen,
            "Agent": config.agent.as_str(),
            "BasicAuth": config.basic_auth,
        }))
    }

    async fn from_json(&mut self, data: &Value) -> OverlayResult<()> {
        let _guard = self.logger.enter();
        info!("UnmarshalJSON");

        let doc: ProxyDoc =
            serde_json::from_value(data.clone()).map_err(|e| OverlayError::Config(e.to_string()))?;

        if doc.type_ != self.type_name {
            return Err(OverlayError::ServiceType);
        }

        let agent = url::Url::parse(&doc.agent).map_err(|e| OverlayError::Config(e.to_string()))?;

        let need_restart = match &self.config {
            Some(current) => current.listen != doc.listen || current.agent != agent,
            None => true,
        };

        self.config = Some(Config {
            listen: doc.listen,
            agent,
            basic_auth: doc.basic_auth,
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

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
    }
}

pub fn register(registry: &mut overlay_core::registry::Registry) {
    registry.register(
        "Proxy",
        Arc::new(|caps: &Capabilities| Box::new(Proxy::new("Proxy", caps.clone())) as Box<dyn Service>),
    );
}
