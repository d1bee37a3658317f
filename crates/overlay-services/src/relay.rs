//! The Relay service (§4.7 salient field: `Route`, compared element-wise
//! by URL string). Grounded on `original_source/relay.go`: dial the
//! first hop of a fixed CONNECT chain (`Route`), fetch the far end's
//! declared agent URL, then listen locally on that address and forward
//! each accepted connection through a freshly dialed copy of the same
//! chain. The initial dial-and-fetch retries forever with the same
//! backoff [`Access`] uses; once the listener is up, later per-connection
//! dials are not retried — a failed relay hop just drops that connection.
//!
//! Per an open design question recorded in DESIGN.md, Relay does not
//! apply the Agent pattern-rewrite list to its route URLs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use overlay_core::connect::http_connect;
use overlay_core::error::{OverlayError, OverlayResult};
use overlay_core::intranet::Endpoint;
use overlay_core::pipe::PipeHalf;
use overlay_core::registry::Capabilities;
use overlay_core::service::Service;

use overlay_tunnel::agent_client::fetch_agent_url;
use overlay_tunnel::retry_forever;

#[derive(Deserialize)]
struct RelayDoc {
    #[serde(rename = "Type")]
    type_: String,
    #[serde(rename = "Route")]
    route: Vec<String>,
}

struct Config {
    route: Vec<url::Url>,
}

pub struct Relay {
    caps: Capabilities,
    logger: tracing::Span,
    type_name: String,
    config: Option<Config>,
    stop: Option<CancellationToken>,
}

impl Relay {
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
            .ok_or_else(|| OverlayError::Config("Relay not configured".into()))?;

        let route = config.route.clone();
        let endpoint = Arc::new(self.caps.endpoint("relay", "relay"));
        let intranet = self.caps.intranet.clone();

        let ctx = CancellationToken::new();
        let child = ctx.clone();
        let logger = self.logger.clone();

        tokio::spawn(async move {
            let fetch_route = route.clone();
            let fetch_endpoint = endpoint.clone();
            let child_for_fetch = child.clone();
            let remote = retry_forever(
                &child,
                move || {
                    let route = fetch_route.clone();
                    let endpoint = fetch_endpoint.clone();
                    let ctx = child_for_fetch.clone();
                    async move {
                        let stream = open(&ctx, &endpoint, &route).await?;
                        let host = route.last().map(host_with_port).unwrap_or_default();
                        let url = fetch_agent_url(stream, &host).await?;
                        url::Url::parse(&url).map_err(|e| OverlayError::Other(e.to_string()))
                    }
                },
                |err, delay| {
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "relay: fetch agent url failed, retrying");
                },
            )
            .await;

            let remote = match remote {
                Ok(r) => r,
                Err(e) => {
                    let _guard = logger.enter();
                    debug!(error = %e, "relay: stopped before establishing route");
                    return;
                }
            };

            let remote_host = host_with_port(&remote);
            let listener = intranet.assume(remote.scheme().to_string(), remote_host);

            loop {
                let conn = tokio::select! {
                    _ = child.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok(c) => c,
                        Err(e) => {
                            let _guard = logger.enter();
                            debug!(error = %e, "relay: listener accept loop ended");
                            break;
                        }
                    },
                };

                let route = route.clone();
                let endpoint = endpoint.clone();
                let child = child.clone();
                let logger = logger.clone();
                tokio::spawn(async move {
                    let mut conn = conn;
                    match open(&child, &endpoint, &route).await {
                        Ok(mut backend) => {
                            if let Err(e) = tokio::io::copy_bidirectional(&mut conn, &mut backend).await {
                                let _guard = logger.enter();
                                debug!(error = %e, "relay: splice ended");
                            }
                        }
                        Err(e) => {
                            let _guard = logger.enter();
                            warn!(error = %e, "relay: dial through route failed");
                        }
                    }
                });
            }

            let _ = listener.close().await;
        });

        self.stop = Some(ctx);
        Ok(())
    }
}

/// Dial `route[0]` then CONNECT through every remaining hop in order.
async fn open(
    ctx: &CancellationToken,
    endpoint: &Endpoint,
    route: &[url::Url],
) -> OverlayResult<PipeHalf> {
    let Some(first) = route.first() else {
        return Err(OverlayError::EmptyRoute);
    };

    let mut conn = endpoint
        .dial(ctx, first.scheme().to_string(), host_with_port(first))
        .await?;

    for hop in &route[1..] {
        http_connect(&mut conn, &host_with_port(hop), None).await?;
    }

    Ok(conn)
}

fn host_with_port(url: &url::Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_string(),
        (None, _) => String::new(),
    }
}

#[async_trait]
impl Service for Relay {
    fn to_json(&self) -> OverlayResult<Value> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| OverlayError::Config("Relay not configured".into()))?;
        Ok(json!({
            "Type": self.type_name,
            "Route": config.route.iter().map(|u| u.as_str()).collect::<Vec<_>>(),
        }))
    }

    async fn from_json(&mut self, data: &Value) -> OverlayResult<()> {
        let _guard = self.logger.enter();
        info!("UnmarshalJSON");

        let doc: RelayDoc =
            serde_json::from_value(data.clone()).map_err(|e| OverlayError::Config(e.to_string()))?;

        if doc.type_ != self.type_name {
            return Err(OverlayError::ServiceType);
        }

        let route: Vec<url::Url> = doc
            .route
            .iter()
            .map(|s| url::Url::parse(s).map_err(|e| OverlayError::Config(e.to_string())))
            .collect::<OverlayResult<_>>()?;

        let need_restart = match &self.config {
            Some(current) => current.route != route,
            None => true,
        };

        self.config = Some(Config { route });

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

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
    }
}

pub fn register(registry: &mut overlay_core::registry::Registry) {
    registry.register(
        "Relay",
        Arc::new(|caps: &Capabilities| Box::new(Relay::new("Relay", caps.clone())) as Box<dyn Service>),
    );
}
