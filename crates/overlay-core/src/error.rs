use thiserror::Error;

/// Errors produced by the fabric, service, and Notary layers.
///
/// Variants are grouped the way §7 of the design groups them: Config,
/// Route, Protocol, Token, I/O. `Io` is always a fatal, propagating kind;
/// retry-bearing services (Access, Relay) never let a `Route`/`Protocol`
/// error surface — they log and back off instead.
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("service type error")]
    ServiceType,

    #[error("unknown service type: {0}")]
    UnknownServiceType(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("no route")]
    NoRoute,

    #[error("dial cancelled: {0}")]
    DialCancelled(String),

    #[error("route closed")]
    RouteClosed,

    #[error("endpoint closed")]
    EndpointClosed,

    #[error("route is empty")]
    EmptyRoute,

    #[error("malformed CONNECT response: {0}")]
    MalformedConnect(String),

    #[error("HTTP CONNECT failed with status code \"{0}\"")]
    ConnectNonOk(String),

    #[error("websocket upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error("multiplexer handshake failed: {0}")]
    MuxHandshakeFailed(String),

    #[error("token format error: {0}")]
    TokenFormat(String),

    #[error("unknown algorithm")]
    UnknownAlgorithm,

    #[error("verify key not found")]
    VerifyKeyNotFound,

    #[error("verify sign failed")]
    VerifySignFailed,

    #[error("none sign not allowed")]
    NoneSignNotAllowed,

    #[error("should have no key")]
    ShouldHaveNoKey,

    #[error("sign key required")]
    SignKeyRequired,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type OverlayResult<T> = Result<T, OverlayError>;
