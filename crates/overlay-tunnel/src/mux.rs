//! Connection-multiplexer wrapper (§4.5, §9). No teacher counterpart —
//! `wsh-client` hand-rolled its own per-stream framing directly on top
//! of the WebSocket (see the removed `transport/websocket.rs`). The
//! original Go program this spec traces back to uses
//! `github.com/hashicorp/yamux` (`original_source/hub/hub.go`,
//! `interact.go`); `yamux` is the protocol-compatible Rust port used
//! throughout the libp2p/Substrate ecosystem for the identical role.
//!
//! yamux is executor-agnostic and built on the `futures` I/O traits, so
//! the byte stream handed in here (a plain `tokio::io::DuplexStream`
//! from [`crate::ws::wrap_as_byte_stream`]) is bridged with
//! `tokio_util::compat`.
//!
//! `yamux::Connection` has no split accept/control handles in this
//! version of the crate — accepting inbound streams and opening
//! outbound ones are both `&mut Connection` operations, so exactly one
//! task (`drive`) owns it. [`SessionAccept`] and [`SessionControl`]
//! reach that task over channels.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::task::Poll;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt as _, TokioAsyncReadCompatExt as _};
use yamux::{Config, Connection, ConnectionError, Mode};

use overlay_core::error::{OverlayError, OverlayResult};

/// A yamux stream wrapped back into tokio's `AsyncRead`/`AsyncWrite` so
/// it can be spliced with Intranet pipes using `tokio::io::copy_bidirectional`.
pub type MuxStream = Compat<yamux::Stream>;

type OpenWaiter = oneshot::Sender<Result<yamux::Stream, ConnectionError>>;

enum Request {
    Open(OpenWaiter),
    Shutdown(oneshot::Sender<()>),
}

/// Accepts inbound logical streams. Owned by exactly one task — the
/// toLocal handler.
pub struct SessionAccept {
    inbound_rx: mpsc::Receiver<yamux::Stream>,
    driver: tokio::task::JoinHandle<()>,
}

/// Opens outbound logical streams. Cheap to clone; the toRemote handler
/// and the peer-agent HTTP client each hold their own clone.
#[derive(Clone)]
pub struct SessionControl {
    request_tx: mpsc::Sender<Request>,
}

/// Layer yamux over `io` in the given role. `Mode::Client` for Access,
/// `Mode::Server` for Accept/Hub (§4.5).
pub fn new_session<S>(io: S, mode: Mode) -> (SessionAccept, SessionControl)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection = Connection::new(io.compat(), Config::default(), mode);
    let (inbound_tx, inbound_rx) = mpsc::channel(32);
    let (request_tx, request_rx) = mpsc::channel(32);

    let driver = tokio::spawn(drive(connection, inbound_tx, request_rx));

    (SessionAccept { inbound_rx, driver }, SessionControl { request_tx })
}

/// Drives the connection's I/O to completion. Both accepting inbound
/// streams and opening outbound ones need `&mut Connection`, so this is
/// the only place either happens; [`SessionAccept::accept`] and
/// [`SessionControl::open`] just forward requests here over channels.
async fn drive<T>(
    mut connection: Connection<T>,
    inbound_tx: mpsc::Sender<yamux::Stream>,
    mut request_rx: mpsc::Receiver<Request>,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    enum Event {
        Inbound(Option<Result<yamux::Stream, ConnectionError>>),
        Opened(Result<yamux::Stream, ConnectionError>),
        OpenRequested(OpenWaiter),
        Shutdown(oneshot::Sender<()>),
    }

    let mut pending_opens: VecDeque<OpenWaiter> = VecDeque::new();
    let mut shutdown_done = None;

    'drive: loop {
        let event = poll_fn(|cx| {
            if !pending_opens.is_empty() {
                if let Poll::Ready(result) = connection.poll_new_outbound(cx) {
                    return Poll::Ready(Event::Opened(result));
                }
            }
            if let Poll::Ready(Some(request)) = request_rx.poll_recv(cx) {
                return Poll::Ready(match request {
                    Request::Open(waiter) => Event::OpenRequested(waiter),
                    Request::Shutdown(done) => Event::Shutdown(done),
                });
            }
            if let Poll::Ready(item) = connection.poll_next_inbound(cx) {
                return Poll::Ready(Event::Inbound(item));
            }
            Poll::Pending
        })
        .await;

        match event {
            Event::OpenRequested(waiter) => pending_opens.push_back(waiter),
            Event::Opened(result) => {
                if let Some(waiter) = pending_opens.pop_front() {
                    let _ = waiter.send(result);
                }
            }
            Event::Inbound(Some(Ok(stream))) => {
                if inbound_tx.send(stream).await.is_err() {
                    break 'drive;
                }
            }
            Event::Inbound(Some(Err(e))) => {
                tracing::debug!(error = %e, "yamux connection closed");
                break 'drive;
            }
            Event::Inbound(None) => break 'drive,
            Event::Shutdown(done) => {
                shutdown_done = Some(done);
                break 'drive;
            }
        }
    }

    let _ = poll_fn(|cx| connection.poll_close(cx)).await;
    if let Some(done) = shutdown_done {
        let _ = done.send(());
    }
}

impl SessionAccept {
    pub async fn accept(&mut self) -> OverlayResult<MuxStream> {
        self.inbound_rx
            .recv()
            .await
            .map(FuturesAsyncReadCompatExt::compat)
            .ok_or_else(|| OverlayError::MuxHandshakeFailed("session closed".into()))
    }

    pub fn close(&mut self) {
        self.driver.abort();
    }
}

impl SessionControl {
    pub async fn open(&mut self) -> OverlayResult<MuxStream> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(Request::Open(tx))
            .await
            .map_err(|_| OverlayError::MuxHandshakeFailed("session closed".into()))?;
        let stream = rx
            .await
            .map_err(|_| OverlayError::MuxHandshakeFailed("session closed".into()))?
            .map_err(|e| OverlayError::MuxHandshakeFailed(e.to_string()))?;
        Ok(stream.compat())
    }

    /// Asks the driver to stop accepting new requests and run
    /// `poll_close` on the underlying connection. No-op if the driver
    /// has already exited.
    pub async fn close(&mut self) {
        let (tx, rx) = oneshot::channel();
        if self.request_tx.send(Request::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}
