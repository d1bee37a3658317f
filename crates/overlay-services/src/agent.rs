//! The Agent service (§4.4). Grounded on `original_source/agent.go` in
//! full: an HTTP surface over an Intranet-obtained listener serving
//! `/api/address` and `/api/hardware`, with every other (proxy-shaped)
//! request handed to the proxy engine through a custom dialer that
//! rewrites dial targets via the configured [`Pattern`] list before
//! falling back to a real TCP dial.

use std::sync::Arc;

use async_trait::async_trait;
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use overlay_core::error::{OverlayError, OverlayResult};
use overlay_core::pattern::{default_patterns, resolve_dial_target, DialRoute, Pattern};
use overlay_core::registry::Capabilities;
use overlay_core::service::Service;

use crate::http_util::{empty_response, is_proxy_request, json_response, trace_id};
use crate::proxy_engine::{self, boxed, DialFn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PatternDoc {
    #[serde(rename = "Pattern")]
    pattern: String,
    #[serde(rename = "Replace", default)]
    replace: String,
}

#[derive(Serialize, Deserialize)]
struct AgentDoc {
    #[serde(rename = "Type")]
    type_: String,
    #[serde(rename = "Agent")]
    agent: String,
    #[serde(rename = "Patterns", default)]
    patterns: Vec<PatternDoc>,
    #[serde(rename = "Timeout", default)]
    timeout: Option<u64>,
}

struct Config {
    agent_url: String,
    patterns: Vec<Pattern>,
}

pub struct Agent {
    caps: Capabilities,
    logger: tracing::Span,
    type_name: String,
    config: Option<Config>,
    stop: Option<CancellationToken>,
}

impl Agent {
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

    fn parse_patterns(docs: &[PatternDoc]) -> OverlayResult<Vec<Pattern>> {
        docs.iter()
            .map(|d| {
                regex::Regex::new(&d.pattern)
                    .map(|re| Pattern::new(re, d.replace.clone()))
                    .map_err(|e| OverlayError::Config(e.to_string()))
            })
            .collect()
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
            .ok_or_else(|| OverlayError::Config("Agent not configured".into()))?;

        let agent_uri =
            url::Url::parse(&config.agent_url).map_err(|e| OverlayError::Config(e.to_string()))?;
        let endpoint = Arc::new(self.caps.endpoint(agent_uri.scheme(), host_with_port(&agent_uri)));

        let ctx = CancellationToken::new();
        let child = ctx.clone();
        let agent_url = config.agent_url.clone();
        let patterns = config.patterns.clone();
        let logger = self.logger.clone();

        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = child.cancelled() => break,
                    res = endpoint.accept() => match res {
                        Ok(c) => c,
                        Err(e) => {
                            let _guard = logger.enter();
                            debug!(error = %e, "agent accept loop ended");
                            break;
                        }
                    },
                };

                let agent_url = agent_url.clone();
                let patterns = patterns.clone();
                let endpoint = endpoint.clone();
                tokio::spawn(async move {
                    let dial = build_dialer(endpoint, patterns);
                    let io = TokioIo::new(conn);
                    let service = hyper::service::service_fn(move |req| {
                        let agent_url = agent_url.clone();
                        let dial = dial.clone();
                        async move { Ok::<_, std::convert::Infallible>(handle(req, agent_url, dial).await) }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!(error = %e, "agent connection ended");
                    }
                });
            }
            let _ = endpoint.close().await;
        });

        self.stop = Some(ctx);
        Ok(())
    }
}

fn host_with_port(url: &url::Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_string(),
        (None, _) => String::new(),
    }
}

fn build_dialer(endpoint: Arc<overlay_core::intranet::Endpoint>, patterns: Vec<Pattern>) -> DialFn {
    Arc::new(move |network: String, address: String| {
        let endpoint = endpoint.clone();
        let patterns = patterns.clone();
        Box::pin(async move {
            match resolve_dial_target(&patterns, &network, &address) {
                DialRoute::Intranet {
                    network: n,
                    address: a,
                } => {
                    let ctx = CancellationToken::new();
                    let conn = endpoint.dial(&ctx, n, a).await?;
                    Ok(boxed(conn))
                }
                DialRoute::Direct => {
                    let conn = tokio::net::TcpStream::connect(&address)
                        .await
                        .map_err(OverlayError::Io)?;
                    Ok(boxed(conn))
                }
            }
        })
    })
}

async fn handle(
    req: hyper::Request<hyper::body::Incoming>,
    agent_url: String,
    dial: DialFn,
) -> hyper::Response<crate::http_util::RespBody> {
    let tid = trace_id(req.headers());

    if is_proxy_request(&req) {
        return proxy_engine::serve(req, dial).await;
    }

    match (req.method(), req.uri().path()) {
        (&Method::GET, "/api/address") => {
            json_response(StatusCode::OK, &json!({"Data": {"Agent": agent_url}}), &tid)
        }
        (&Method::GET, "/api/hardware") => {
            json_response(StatusCode::OK, &json!({"Data": {"Hardware": "None"}}), &tid)
        }
        _ => empty_response(StatusCode::NOT_FOUND),
    }
}

#[async_trait]
impl Service for Agent {
    fn to_json(&self) -> OverlayResult<Value> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| OverlayError::Config("Agent not configured".into()))?;
        Ok(json!({
            "Type": self.type_name,
            "Agent": config.agent_url,
            "Patterns": config.patterns.iter().map(|p| json!({
                "Pattern": p.pattern.as_str(),
                "Replace": p.replace,
            })).collect::<Vec<_>>(),
        }))
    }

    async fn from_json(&mut self, data: &Value) -> OverlayResult<()> {
        let _guard = self.logger.enter();
        info!("UnmarshalJSON");

        let mut doc: AgentDoc =
            serde_json::from_value(data.clone()).map_err(|e| OverlayError::Config(e.to_string()))?;

        if doc.type_ != self.type_name {
            return Err(OverlayError::ServiceType);
        }

        let mut need_restart = self.config.is_none();

        if let Some(current) = &self.config {
            if current.agent_url != doc.agent {
                need_restart = true;
            }
        }

        let mut patterns = Self::parse_patterns(&doc.patterns)?;
        if let Some(current) = &self.config {
            if !Pattern::slice_eq(&current.patterns, &patterns) {
                need_restart = true;
            }
        }

        if doc.patterns.is_empty() {
            patterns = default_patterns();
            need_restart = true;
            doc.patterns = patterns
                .iter()
                .map(|p| PatternDoc {
                    pattern: p.pattern.as_str().to_string(),
                    replace: p.replace.clone(),
                })
                .collect();
        }

        self.config = Some(Config {
            agent_url: doc.agent,
            patterns,
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

impl Drop for Agent {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
    }
}

pub fn register(registry: &mut overlay_core::registry::Registry) {
    registry.register(
        "Agent",
        Arc::new(|caps: &Capabilities| Box::new(Agent::new("Agent", caps.clone())) as Box<dyn Service>),
    );
}
