//! Composite reconciler (§4.3). Grounded on `original_source/group.go`:
//! a `map[string]Service` diffed against a declared `map[string]json.RawMessage`
//! on every reconfigure.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::error;

use crate::error::{OverlayError, OverlayResult};
use crate::registry::Capabilities;
use crate::service::Service;

#[derive(Deserialize)]
struct GroupRecord {
    #[serde(rename = "Type")]
    type_: String,
    #[serde(rename = "Services", default)]
    services: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct TypeOnly {
    #[serde(rename = "Type")]
    type_: String,
}

pub struct Group {
    caps: Capabilities,
    logger: tracing::Span,
    type_name: String,
    services: HashMap<String, Box<dyn Service>>,
}

impl Group {
    pub fn new(type_name: impl Into<String>, caps: Capabilities) -> Self {
        let type_name = type_name.into();
        let logger = caps.logger(&type_name);
        Self {
            caps,
            logger,
            type_name,
            services: HashMap::new(),
        }
    }
}

#[async_trait]
impl Service for Group {
    fn to_json(&self) -> OverlayResult<Value> {
        let mut services = serde_json::Map::new();
        for (key, service) in &self.services {
            services.insert(key.clone(), service.to_json()?);
        }
        Ok(serde_json::json!({
            "Type": self.type_name,
            "Services": services,
        }))
    }

    async fn from_json(&mut self, data: &Value) -> OverlayResult<()> {
        let _guard = self.logger.enter();

        let record: GroupRecord =
            serde_json::from_value(data.clone()).map_err(|e| OverlayError::Config(e.to_string()))?;

        if self.type_name != record.type_ {
            return Err(OverlayError::ServiceType);
        }

        let declared: HashSet<&String> = record.services.keys().collect();
        let stale: Vec<String> = self
            .services
            .keys()
            .filter(|key| !declared.contains(key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(mut service) = self.services.remove(&key) {
                if let Err(err) = service.close().await {
                    error!(child = %key, %err, "service.close");
                }
            }
        }

        for (key, child_data) in record.services {
            if let Some(service) = self.services.get_mut(&key) {
                match service.from_json(&child_data).await {
                    Ok(()) => continue,
                    Err(OverlayError::ServiceType) => {
                        service.close().await?;
                    }
                    Err(err) => return Err(err),
                }
            }

            let type_only: TypeOnly = serde_json::from_value(child_data.clone())
                .map_err(|e| OverlayError::Config(e.to_string()))?;

            let mut service = self.caps.registry.build(&self.caps, &type_only.type_)?;
            service.from_json(&child_data).await?;
            self.services.insert(key, service);
        }

        Ok(())
    }

    async fn close(&mut self) -> OverlayResult<()> {
        let logger = self.logger.clone();
        let mut set = tokio::task::JoinSet::new();
        for (key, mut service) in self.services.drain() {
            let logger = logger.clone();
            set.spawn(async move {
                if let Err(err) = service.close().await {
                    let _guard = logger.enter();
                    error!(child = %key, %err, "service.close");
                }
            });
        }
        while set.join_next().await.is_some() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::intranet::Intranet;
    use crate::registry::{Capabilities, Registry};

    #[derive(Deserialize)]
    struct ProbeRecord {
        #[serde(rename = "Type")]
        type_: String,
        #[serde(rename = "Salient", default)]
        salient: String,
    }

    struct Probe {
        type_name: String,
        salient: Option<String>,
        starts: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Service for Probe {
        fn to_json(&self) -> OverlayResult<Value> {
            Ok(json!({"Type": self.type_name, "Salient": self.salient}))
        }

        async fn from_json(&mut self, data: &Value) -> OverlayResult<()> {
            let record: ProbeRecord = serde_json::from_value(data.clone())
                .map_err(|e| OverlayError::Config(e.to_string()))?;
            if record.type_ != self.type_name {
                return Err(OverlayError::ServiceType);
            }
            let need_restart = self.salient.as_deref() != Some(record.salient.as_str());
            self.salient = Some(record.salient);
            if need_restart {
                self.starts.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn close(&mut self) -> OverlayResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry_with_probe(
        type_name: &'static str,
        starts: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        registry: &mut Registry,
    ) {
        registry.register(
            type_name,
            Arc::new(move |_caps: &Capabilities| {
                Box::new(Probe {
                    type_name: type_name.to_string(),
                    salient: None,
                    starts: starts.clone(),
                    closes: closes.clone(),
                }) as Box<dyn Service>
            }),
        );
    }

    fn caps_for(registry: Registry) -> Capabilities {
        Capabilities::new(Intranet::new(), Arc::new(registry))
    }

    #[tokio::test]
    async fn reconcile_idempotence() {
        let starts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry_with_probe("Probe", starts.clone(), closes.clone(), &mut registry);

        let mut root = Group::new("Group", caps_for(registry));
        let doc = json!({"Type": "Group", "Services": {"x": {"Type": "Probe", "Salient": "a"}}});

        root.from_json(&doc).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        root.from_json(&doc).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1, "second apply of identical doc must not restart");
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn restart_only_on_salient_change() {
        let starts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry_with_probe("Probe", starts.clone(), closes.clone(), &mut registry);

        let mut root = Group::new("Group", caps_for(registry));

        root.from_json(&json!({"Type": "Group", "Services": {"x": {"Type": "Probe", "Salient": "a"}}}))
            .await
            .unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        root.from_json(&json!({"Type": "Group", "Services": {"x": {"Type": "Probe", "Salient": "b"}}}))
            .await
            .unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2, "changed salient field must restart");
    }

    #[tokio::test]
    async fn type_mismatch_rebuilds_child() {
        let starts_a = Arc::new(AtomicUsize::new(0));
        let closes_a = Arc::new(AtomicUsize::new(0));
        let starts_b = Arc::new(AtomicUsize::new(0));
        let closes_b = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry_with_probe("A", starts_a.clone(), closes_a.clone(), &mut registry);
        registry_with_probe("B", starts_b.clone(), closes_b.clone(), &mut registry);

        let mut root = Group::new("Group", caps_for(registry));

        root.from_json(&json!({"Type": "Group", "Services": {"x": {"Type": "A", "Salient": "a"}}}))
            .await
            .unwrap();
        assert_eq!(starts_a.load(Ordering::SeqCst), 1);
        assert_eq!(closes_a.load(Ordering::SeqCst), 0);

        root.from_json(&json!({"Type": "Group", "Services": {"x": {"Type": "B", "Salient": "a"}}}))
            .await
            .unwrap();

        assert_eq!(closes_a.load(Ordering::SeqCst), 1, "old child's Close must run before the rebuild");
        assert_eq!(starts_b.load(Ordering::SeqCst), 1, "new child must be built and started");
    }

    #[tokio::test]
    async fn removed_child_is_closed() {
        let starts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry_with_probe("Probe", starts.clone(), closes.clone(), &mut registry);

        let mut root = Group::new("Group", caps_for(registry));

        root.from_json(&json!({"Type": "Group", "Services": {"x": {"Type": "Probe", "Salient": "a"}}}))
            .await
            .unwrap();
        root.from_json(&json!({"Type": "Group", "Services": {}})).await.unwrap();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
