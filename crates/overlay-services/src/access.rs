//! The Access service (§4.6 salient fields: `Entry`, `Agent`).
//! Grounded on `original_source/interact.go`'s `Access`: client-role
//! complement of `Accept` — forever-retry dial of a Hub/Accept's
//! websocket `Entry`, then the same `connect()` tunnel session bound at
//! the `Agent` address. A session ending (cleanly or otherwise) ends the
//! retry loop too, matching `backoff.RetryNotify`'s success-stops-retry
//! semantics — `Access` does not reconnect after an established session
//! tears down, only while still dialing in.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use yamux::Mode;

use overlay_core::error::{OverlayError, OverlayResult};
use overlay_core::registry::Capabilities;
use overlay_core::service::Service;
use overlay_core::SyntheticAddr;

use overlay_tunnel::bind::{bind, Policy};
use overlay_tunnel::retry_forever;
use overlay_tunnel::ws::{connect_client, wrap_as_byte_stream};

#[derive(Deserialize)]
struct AccessDoc {
    #[serde(rename = "Type")]
    type_: String,
    #[serde(rename = "Entry")]
    entry: String,
    #[serde(rename = "Agent")]
    agent: String,
}

struct Config {
    entry: String,
    agent: url::Url,
}

pub struct Access {
    caps: Capabilities,
    logger: tracing::Span,
    type_name: String,
    config: Option<Config>,
    stop: Option<CancellationToken>,
}

impl Access {
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
            .ok_or_else(|| OverlayError::Config("Access not configured".into()))?;

        let entry = config.entry.clone();
        let agent_addr = SyntheticAddr::new(config.agent.scheme(), host_with_port(&config.agent));
        let intranet = self.caps.intranet.clone();

        let ctx = CancellationToken::new();
        let child = ctx.clone();
        let logger = self.logger.clone();

        tokio::spawn(async move {
            let retry_ctx = child.clone();
            let result = retry_forever(
                &retry_ctx,
                move || {
                    let entry = entry.clone();
                    let intranet = intranet.clone();
                    let agent_addr = agent_addr.clone();
                    let child = child.clone();
                    async move {
                        let stream = connect_client(&entry).await?;
                        let (app_side, _pump) = wrap_as_byte_stream(stream);
                        bind(&child, app_side, Mode::Client, intranet, agent_addr, Policy::default()).await
                    }
                },
                |err, delay| {
                    warn!(error = %err, delay_ms = delay.as_millis() as u64, "access: dial failed, retrying");
                },
            )
            .await;

            let _guard = logger.enter();
            match result {
                Ok(()) => info!("session ended"),
                Err(e) => debug!(error = %e, "access loop stopped"),
            }
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

#[async_trait]
impl Service for Access {
    fn to_json(&self) -> OverlayResult<Value> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| OverlayError::Config("Access not configured".into()))?;
        Ok(json!({
            "Type": self.type_name,
            "Entry": config.entry,
            "Agent": config.agent.as_str(),
        }))
    }

    async fn from_json(&mut self, data: &Value) -> OverlayResult<()> {
        let _guard = self.logger.enter();
        info!("UnmarshalJSON");

        let doc: AccessDoc =
            serde_json::from_value(data.clone()).map_err(|e| OverlayError::Config(e.to_string()))?;

        if doc.type_ != self.type_name {
            return Err(OverlayError::ServiceType);
        }

        let agent = url::Url::parse(&doc.agent).map_err(|e| OverlayError::Config(e.to_string()))?;

        let need_restart = match &self.config {
            Some(current) => current.entry != doc.entry || current.agent != agent,
            None => true,
        };

        self.config = Some(Config {
            entry: doc.entry,
            agent,
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

impl Drop for Access {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
    }
}

pub fn register(registry: &mut overlay_core::registry::Registry) {
    registry.register(
        "Access",
        Arc::new(|caps: &Capabilities| Box::new(Access::new("Access", caps.clone())) as Box<dyn Service>),
    );
}
