//! The Service lifecycle contract (§4.2). Grounded on
//! `original_source/spine/service.go`: a Go `interface{ json.Marshaler;
//! json.Unmarshaler; io.Closer }` becomes an `async_trait` here since
//! `close` (and reconfigure, which may start/stop a background task)
//! needs to await.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::OverlayResult;

/// A reconcilable, closeable unit of the running tree. `from_json` is the
/// reconciliation entry point: parse, compare salient fields against the
/// live config, restart if needed, replace the config unconditionally.
#[async_trait]
pub trait Service: Send + Sync {
    /// Serialize current declared state (§4.3 Group composes this from
    /// its children).
    fn to_json(&self) -> OverlayResult<Value>;

    /// Reconcile against a freshly parsed declaration. Returns
    /// [`crate::error::OverlayError::ServiceType`] when `data`'s `Type`
    /// does not match this instance's — the caller (Group) interprets
    /// that as "rebuild from scratch".
    async fn from_json(&mut self, data: &Value) -> OverlayResult<()>;

    /// Stop the background task if running and release its resources.
    /// Must swallow benign "already closed" conditions but propagate
    /// genuine failures; safe to call more than once.
    async fn close(&mut self) -> OverlayResult<()>;
}
