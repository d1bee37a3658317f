//! overlay-services: the concrete `Service` implementations the root
//! `Group` builds from a service-tree document (§4.4-§4.7) — Agent,
//! Forward, Proxy, Accept, Access, Hub, Relay — plus the HTTP plumbing
//! ([`http_util`], [`proxy_engine`]) they share.

pub mod accept;
pub mod access;
pub mod agent;
pub mod forward;
pub mod http_util;
pub mod hub;
pub mod proxy;
pub mod proxy_engine;
pub mod relay;

use overlay_core::registry::Registry;

/// Register every concrete service type this crate provides. Callers
/// that need a subset can instead call each module's own `register`.
pub fn register_all(registry: &mut Registry) {
    agent::register(registry);
    forward::register(registry);
    proxy::register(registry);
    accept::register(registry);
    access::register(registry);
    hub::register(registry);
    relay::register(registry);
}
