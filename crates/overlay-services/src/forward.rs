//! The Forward service (§4.6 salient fields: `Listen`, `Agent`,
//! `Forward`). Grounded on `original_source/forward.go`'s `TcpForward`:
//! a real TCP listener; each accepted connection dials the Intranet at
//! the Agent address, then issues an HTTP CONNECT for the fixed
//! `Forward` target over that connection, then splices bytes.

use std::sync::Arc;

use async_trait::async_trait;
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

#[derive(Deserialize)]
struct ForwardDoc {
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

pub struct Forward {
    caps: Capabilities,
    logger: tracing::Span,
    type_name: String,
    config: Option<Config>,
    stop: Option<CancellationToken>,
}

impl Forward {
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
            .ok_or_else(|| OverlayError::Config("Forward not configured".into()))?;

        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(OverlayError::Io)?;

        let endpoint = Arc::new(self.caps.endpoint(config.agent.scheme(), host_with_port(&config.agent)));
        let forward_host = host_with_port(&config.forward);
        let agent_scheme = config.agent.scheme().to_string();
        let agent_host = host_with_port(&config.agent);

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
                            warn!(error = %e, "forward accept failed");
                            continue;
                        }
                    },
                };

                let endpoint = endpoint.clone();
                let forward_host = forward_host.clone();
                let agent_scheme = agent_scheme.clone();
                let agent_host = agent_host.clone();
                let child = child.clone();
                let logger = logger.clone();
                tokio::spawn(async move {
                    let _guard = logger.enter();
                    info!(from = %peer, "new connection");

                    let mut conn = match endpoint.dial(&child, agent_scheme, agent_host).await {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(error = %e, "dial to agent failed");
                            return;
                        }
                    };

                    let trace_id = Uuid::new_v4().to_string();
                    if let Err(e) = http_connect(
                        &mut conn,
                        &forward_host,
                        Some(&[("X-Trace-Id".to_string(), trace_id)]),
                    )
                    .await
                    {
                        warn!(error = %e, "forward CONNECT failed");
                        return;
                    }

                    let mut stream = stream;
                    if let Err(e) = tokio::io::copy_bidirectional(&mut stream, &mut conn).await {
                        debug!(error = %e, "forward splice ended");
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

#[async_trait]
impl Service for Forward {
    fn to_json(&self) -> OverlayResult<Value> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| OverlayError::Config("Forward not configured".into()))?;
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

        let doc: ForwardDoc =
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

impl Drop for Forward {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
    }
}

pub fn register(registry: &mut overlay_core::registry::Registry) {
    registry.register(
        "Forward",
        Arc::new(|caps: &Capabilities| Box::new(Forward::new("Forward", caps.clone())) as Box<dyn Service>),
    );
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use overlay_core::intranet::Intranet;
    use overlay_core::registry::Registry;

    fn caps() -> Capabilities {
        Capabilities::new(Intranet::new(), Arc::new(Registry::new()))
    }

    #[tokio::test]
    async fn type_mismatch_is_rejected() {
        let mut forward = Forward::new("Forward", caps());
        let err = forward
            .from_json(&json!({
                "Type": "NotForward",
                "Listen": "127.0.0.1:0",
                "Agent": "overlay://agent",
                "Forward": "tcp://target:80",
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::ServiceType));
    }

    #[tokio::test]
    async fn malformed_reconfigure_leaves_prior_config_untouched() {
        let mut forward = Forward::new("Forward", caps());
        forward
            .from_json(&json!({
                "Type": "Forward",
                "Listen": "127.0.0.1:0",
                "Agent": "overlay://agent",
                "Forward": "tcp://target:80",
            }))
            .await
            .unwrap();

        let before = forward.to_json().unwrap();

        let err = forward
            .from_json(&json!({
                "Type": "Forward",
                "Listen": "127.0.0.1:0",
                "Agent": "not a url",
                "Forward": "tcp://target:80",
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::Config(_)));

        let after = forward.to_json().unwrap();
        assert_eq!(before, after, "a malformed reconfigure must not alter live config");
    }
}
