//! The virtual network fabric (§4.1). A process-wide mapping from
//! synthetic `(network, address)` to a single-slot rendezvous channel,
//! exposing dial/listen/accept like a real network but entirely
//! in-process.
//!
//! Grounded on `original_source/intranet/intranet.go`: a `sync.Map` of
//! routes keyed by `Addr`, an atomic listener refcount per route, and an
//! unbuffered Go channel used as the rendezvous point between `Dial` and
//! `Accept`. Rust has no zero-capacity channel, so rendezvous here is
//! modeled as a capacity-1 `mpsc` channel carrying the pipe half plus a
//! one-shot acknowledgement: `Dial` only completes once `Accept` has
//! actually taken the item and signalled the ack, which reproduces the
//! blocking handoff an unbuffered channel gives for free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::addr::SyntheticAddr;
use crate::error::{OverlayError, OverlayResult};
use crate::pipe::{pipe, PipeHalf};

type RendezvousItem = (PipeHalf, oneshot::Sender<()>);

struct Route {
    tx: AsyncMutex<Option<tokio::sync::mpsc::Sender<RendezvousItem>>>,
    rx: AsyncMutex<tokio::sync::mpsc::Receiver<RendezvousItem>>,
    listens: AtomicI64,
}

impl Route {
    fn new() -> Arc<Self> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        Arc::new(Self {
            tx: AsyncMutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            listens: AtomicI64::new(0),
        })
    }

    /// Close this route's channel exactly once. Safe to call more than
    /// once; only the first call has an effect (§4.1 edge cases: double
    /// close is a no-op).
    async fn close(&self) {
        let mut guard = self.tx.lock().await;
        guard.take();
    }
}

struct Inner {
    routes: AsyncMutex<HashMap<SyntheticAddr, Arc<Route>>>,
    singularity: Option<SyntheticAddr>,
    closed: AtomicBool,
}

/// Process-wide synthetic-address fabric. Cheap to clone (an `Arc`
/// handle), as every other service holds one.
#[derive(Clone)]
pub struct Intranet {
    inner: Arc<Inner>,
}

impl Default for Intranet {
    fn default() -> Self {
        Self::new()
    }
}

impl Intranet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                routes: AsyncMutex::new(HashMap::new()),
                singularity: None,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Configure an optional default route. When a dial targets an
    /// address with no listener, it is redirected here instead of
    /// failing with *no route* (§3 Singularity).
    pub fn with_singularity(addr: SyntheticAddr) -> Self {
        Self {
            inner: Arc::new(Inner {
                routes: AsyncMutex::new(HashMap::new()),
                singularity: Some(addr),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The identity the Intranet's own `dial`/`accept` convenience
    /// methods use: the configured singularity, or a fixed pseudo
    /// address when none is set.
    fn identity(&self) -> SyntheticAddr {
        self.inner
            .singularity
            .clone()
            .unwrap_or_else(|| SyntheticAddr::new("intranet", "intranet"))
    }

    /// `Assume(network, address) → Endpoint` (§4.1 contract).
    pub fn assume(&self, network: impl Into<String>, address: impl Into<String>) -> Endpoint {
        Endpoint {
            intranet: self.clone(),
            addr: SyntheticAddr::new(network, address),
            route: AsyncMutex::new(None),
        }
    }

    async fn get_route(&self, addr: &SyntheticAddr) -> Option<Arc<Route>> {
        self.inner.routes.lock().await.get(addr).cloned()
    }

    async fn get_or_create_route(&self, addr: &SyntheticAddr) -> Arc<Route> {
        let mut routes = self.inner.routes.lock().await;
        routes
            .entry(addr.clone())
            .or_insert_with(Route::new)
            .clone()
    }

    /// The Intranet's own `Dial`, treated as originating from the
    /// singularity's identity (§3).
    pub async fn dial(
        &self,
        ctx: &CancellationToken,
        network: impl Into<String>,
        address: impl Into<String>,
    ) -> OverlayResult<PipeHalf> {
        let identity = self.identity();
        self.assume(identity.network().to_string(), identity.address().to_string())
            .dial(ctx, network, address)
            .await
    }

    /// The Intranet's own `Accept`, listening on the singularity's
    /// identity address.
    pub async fn accept(&self) -> OverlayResult<PipeHalf> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(OverlayError::EndpointClosed);
        }
        let identity = self.identity();
        let route = self.get_or_create_route(&identity).await;
        route.listens.fetch_add(1, Ordering::AcqRel);
        let mut rx = route.rx.lock().await;
        match rx.recv().await {
            Some((conn, ack)) => {
                let _ = ack.send(());
                Ok(conn)
            }
            None => Err(OverlayError::RouteClosed),
        }
    }

    /// Close every route's channel exactly once and release the mapping
    /// (§4.1 contract). Any dial issued after this synchronously fails.
    pub async fn close(&self) -> OverlayResult<()> {
        self.inner.closed.store(true, Ordering::Release);
        let mut routes = self.inner.routes.lock().await;
        let drained: Vec<_> = routes.drain().collect();
        drop(routes);
        for (addr, route) in drained {
            debug!(address = %addr, "intranet: closing route");
            route.close().await;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// A handle bound to one synthetic address, returned by
/// [`Intranet::assume`]. Supports dial/accept/close exactly as spec.md's
/// `Endpoint` contract describes.
pub struct Endpoint {
    intranet: Intranet,
    addr: SyntheticAddr,
    route: AsyncMutex<Option<Arc<Route>>>,
}

impl Endpoint {
    pub fn addr(&self) -> &SyntheticAddr {
        &self.addr
    }

    /// `Dial` blocks until either a matching listener accepts the
    /// rendezvous, or `ctx` is cancelled.
    pub async fn dial(
        &self,
        ctx: &CancellationToken,
        network: impl Into<String>,
        address: impl Into<String>,
    ) -> OverlayResult<PipeHalf> {
        if self.intranet.is_closed() {
            return Err(OverlayError::EndpointClosed);
        }

        let dst_addr = SyntheticAddr::new(network, address);

        let route = match self.intranet.get_route(&dst_addr).await {
            Some(r) => r,
            None => match &self.intranet.inner.singularity {
                Some(s) => match self.intranet.get_route(s).await {
                    Some(r) => r,
                    None => return Err(OverlayError::NoRoute),
                },
                None => return Err(OverlayError::NoRoute),
            },
        };

        let (src, dst) = pipe(self.addr.clone(), dst_addr);
        let (ack_tx, ack_rx) = oneshot::channel();

        let sender = {
            let guard = route.tx.lock().await;
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(OverlayError::RouteClosed);
        };

        tokio::select! {
            _ = ctx.cancelled() => return Err(OverlayError::DialCancelled("context cancelled".into())),
            res = sender.send((dst, ack_tx)) => {
                if res.is_err() {
                    return Err(OverlayError::RouteClosed);
                }
            }
        }

        tokio::select! {
            _ = ctx.cancelled() => Err(OverlayError::DialCancelled("context cancelled".into())),
            ack = ack_rx => match ack {
                Ok(()) => Ok(src),
                Err(_) => Err(OverlayError::RouteClosed),
            },
        }
    }

    /// `Accept` blocks until a dial arrives; returns end-of-stream error
    /// iff the route was closed. The route is created (and the listener
    /// refcount incremented) lazily on first call.
    pub async fn accept(&self) -> OverlayResult<PipeHalf> {
        if self.intranet.is_closed() {
            return Err(OverlayError::EndpointClosed);
        }

        let route = {
            let mut guard = self.route.lock().await;
            if guard.is_none() {
                let route = self.intranet.get_or_create_route(&self.addr).await;
                route.listens.fetch_add(1, Ordering::AcqRel);
                *guard = Some(route);
            }
            guard.as_ref().unwrap().clone()
        };

        let mut rx = route.rx.lock().await;
        match rx.recv().await {
            Some((conn, ack)) => {
                let _ = ack.send(());
                Ok(conn)
            }
            None => Err(OverlayError::RouteClosed),
        }
    }

    /// Double-close is a no-op (§4.1 edge cases).
    pub async fn close(&self) -> OverlayResult<()> {
        let route = self.route.lock().await.take();
        if let Some(route) = route {
            let remaining = route.listens.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining <= 0 {
                self.intranet.inner.routes.lock().await.remove(&self.addr);
                route.close().await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn dial_matches_exactly_one_accept_with_correct_addrs() {
        let net = Intranet::new();
        let listener = net.assume("h", "i");

        let accept_task = tokio::spawn(async move { listener.accept().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ctx = CancellationToken::new();
        let dialer = net.assume("caller", "caller-addr");
        let dial_conn = dialer.dial(&ctx, "h", "i").await.unwrap();

        let accept_conn = accept_task.await.unwrap().unwrap();

        assert_eq!(dial_conn.local_addr(), &SyntheticAddr::new("caller", "caller-addr"));
        assert_eq!(dial_conn.remote_addr(), &SyntheticAddr::new("h", "i"));
        assert_eq!(accept_conn.local_addr(), &SyntheticAddr::new("h", "i"));
        assert_eq!(accept_conn.remote_addr(), &SyntheticAddr::new("caller", "caller-addr"));
    }

    #[tokio::test]
    async fn second_dial_without_matching_accept_times_out() {
        let net = Intranet::new();
        let listener = net.assume("h", "i");
        let accept_task = tokio::spawn(async move { listener.accept().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ctx = CancellationToken::new();
        let dialer = net.assume("caller", "x");
        dialer.dial(&ctx, "h", "i").await.unwrap();
        accept_task.await.unwrap().unwrap();

        let result = tokio::time::timeout(Duration::from_millis(100), dialer.dial(&ctx, "h", "i")).await;
        assert!(result.is_err(), "second dial should not complete without another accept");
    }

    #[tokio::test]
    async fn singularity_fallback_routes_unlisted_dial() {
        let net = Intranet::with_singularity(SyntheticAddr::new("s", "s"));
        let listener = net.assume("s", "s");
        let accept_task = tokio::spawn(async move { listener.accept().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ctx = CancellationToken::new();
        let dialer = net.assume("client", "client");
        let dial_conn = dialer.dial(&ctx, "unlisted", "addr").await.unwrap();
        let accept_conn = accept_task.await.unwrap().unwrap();

        assert_eq!(dial_conn.remote_addr(), &SyntheticAddr::new("unlisted", "addr"));
        assert_eq!(accept_conn.remote_addr(), &SyntheticAddr::new("client", "client"));
    }

    #[tokio::test]
    async fn dial_with_no_route_and_no_singularity_fails() {
        let net = Intranet::new();
        let ctx = CancellationToken::new();
        let dialer = net.assume("client", "client");
        let err = dialer.dial(&ctx, "nowhere", "nowhere").await.unwrap_err();
        assert!(matches!(err, OverlayError::NoRoute));
    }

    #[tokio::test]
    async fn closing_intranet_unblocks_pending_accept() {
        let net = Intranet::new();
        let listener = net.assume("h", "i");
        let net2 = net.clone();
        let accept_task = tokio::spawn(async move { listener.accept().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        net2.close().await.unwrap();

        let result = accept_task.await.unwrap();
        assert!(matches!(result, Err(OverlayError::RouteClosed)));
    }

    #[tokio::test]
    async fn double_close_is_a_no_op() {
        let net = Intranet::new();
        let endpoint = net.assume("h", "i");
        endpoint.close().await.unwrap();
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn dial_cancelled_context_fails_with_dial_cancelled() {
        let net = Intranet::new();
        let listener = net.assume("h", "i");
        // No accept loop running — the rendezvous never completes.
        tokio::spawn(async move {
            let _ = listener;
            std::future::pending::<()>().await;
        });

        let ctx = CancellationToken::new();
        let dialer = net.assume("caller", "caller");
        let ctx2 = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx2.cancel();
        });

        let err = dialer.dial(&ctx, "h", "i").await.unwrap_err();
        assert!(matches!(err, OverlayError::DialCancelled(_)));
    }
}
