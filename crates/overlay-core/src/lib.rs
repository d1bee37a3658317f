//! overlay-core: virtual network fabric, service lifecycle, and Notary
//! token envelope shared by every component of the overlay runtime.

pub mod addr;
pub mod connect;
pub mod error;
pub mod group;
pub mod intranet;
pub mod notary;
pub mod pattern;
pub mod pipe;
pub mod registry;
pub mod service;

pub use addr::SyntheticAddr;
pub use connect::http_connect;
pub use error::{OverlayError, OverlayResult};
pub use group::Group;
pub use intranet::{Endpoint, Intranet};
pub use notary::{Algorithm, DecodedToken, InMemoryKeyStore, KeyStore, Notary};
pub use pattern::{default_patterns, resolve_dial_target, DialRoute, Pattern};
pub use pipe::{pipe, PipeHalf};
pub use registry::{BuildFn, Capabilities, Registry};
pub use service::Service;
