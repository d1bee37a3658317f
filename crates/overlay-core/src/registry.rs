//! Builder registry and capability injection (§4.3).
//!
//! `original_source/spine/builder.go` defines three narrow Go
//! interfaces (`LoggerBuilder`, `EndpointBuilder`, `ServiceBuilder`)
//! that a concrete server type satisfies and hands down to children
//! being built. Here the three collapse into one `Capabilities` value
//! that every service constructor receives, since Rust has no
//! "satisfies several interfaces" shorthand as convenient as a struct.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info_span;

use crate::error::{OverlayError, OverlayResult};
use crate::intranet::{Endpoint, Intranet};
use crate::service::Service;

/// Constructs a fresh, not-yet-configured `Service` of a given `Type`.
pub type BuildFn = Arc<dyn Fn(&Capabilities) -> Box<dyn Service> + Send + Sync>;

/// Maps declared `Type` strings to constructors. Populated once at
/// startup by whichever crate owns the concrete service types.
#[derive(Default, Clone)]
pub struct Registry {
    builders: HashMap<String, BuildFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_name: impl Into<String>, build: BuildFn) {
        self.builders.insert(type_name.into(), build);
    }

    pub fn build(&self, caps: &Capabilities, type_name: &str) -> OverlayResult<Box<dyn Service>> {
        let build = self
            .builders
            .get(type_name)
            .ok_or_else(|| OverlayError::UnknownServiceType(type_name.to_string()))?;
        Ok(build(caps))
    }
}

/// Injected into every service builder: the fabric to mint endpoints on,
/// and the registry to build further children (Group recurses through
/// this).
#[derive(Clone)]
pub struct Capabilities {
    pub intranet: Intranet,
    pub registry: Arc<Registry>,
}

impl Capabilities {
    pub fn new(intranet: Intranet, registry: Arc<Registry>) -> Self {
        Self { intranet, registry }
    }

    /// Per-service tracing scope, standing in for the teacher's
    /// `LoggerBuilder.Logger(name)`.
    pub fn logger(&self, name: &str) -> tracing::Span {
        info_span!("service", name = %name)
    }

    /// Standing in for the teacher's `EndpointBuilder.Endpoint`.
    pub fn endpoint(&self, network: impl Into<String>, address: impl Into<String>) -> Endpoint {
        self.intranet.assume(network, address)
    }
}
