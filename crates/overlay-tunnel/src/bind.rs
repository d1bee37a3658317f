//! `bind(session)` — the symmetric core of the tunnel plane (§4.5).
//! Grounded line-for-line on `original_source/interact.go`'s `connect()`:
//! mint a synthetic address for the session, run a toLocal handler
//! (serve inbound mux streams by dialing the local Intranet at the
//! agent address) and a toRemote handler (fetch the peer's agent URL,
//! listen on that synthetic address locally, forward each connection
//! through a fresh outbound mux stream) concurrently; whichever exits
//! first tears down the other. A third heartbeat task (§4.5, §9) opens
//! a throwaway mux stream every 30s as a liveness round trip — opening
//! a yamux stream requires the peer to ack a window update, so success
//! means the session is alive; `interact.go`'s own `connect()` left this
//! as a TODO ("yamux has internal loop, so follow yamux.accept and
//! close all"), which this task now actually does.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use yamux::Mode;

use overlay_core::error::OverlayResult;
use overlay_core::{Intranet, SyntheticAddr};

use crate::agent_client::fetch_agent_url;
use crate::mux::new_session;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Which of the two handlers a Hub-authenticated session is allowed to
/// run, carried by the decoded Notary token payload (§4.5 Hub, §9).
/// Plain Access/Accept always run with both permitted.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    /// Permits the toLocal handler: the peer may cause dials into this
    /// side's local Intranet.
    pub dial: bool,
    /// Permits the toRemote handler: the peer's agent becomes
    /// addressable by other local services.
    pub listen: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            dial: true,
            listen: true,
        }
    }
}

/// Run the tunnel over an already-upgraded byte stream until either
/// handler exits or `parent_ctx` is cancelled. Returns once both
/// handlers and the session have been torn down.
pub async fn bind<S>(
    parent_ctx: &CancellationToken,
    io: S,
    mode: Mode,
    intranet: Intranet,
    agent_addr: SyntheticAddr,
    policy: Policy,
) -> OverlayResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut accept, mut control) = new_session(io, mode);

    let session_addr = SyntheticAddr::new("tunnel", format!("session-{}", Uuid::new_v4()));
    let remote = intranet.assume(
        session_addr.network().to_string(),
        session_addr.address().to_string(),
    );

    let ctx = parent_ctx.child_token();

    let mut tasks = tokio::task::JoinSet::new();

    {
        let ctx = ctx.clone();
        let mut control = control.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => {
                        let probe = tokio::time::timeout(HEARTBEAT_INTERVAL, control.open());
                        match probe.await {
                            Ok(Ok(_stream)) => continue,
                            Ok(Err(e)) => {
                                tracing::warn!(error = %e, "heartbeat round trip failed, tearing down session");
                                break;
                            }
                            Err(_) => {
                                tracing::warn!("heartbeat round trip timed out, tearing down session");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    if policy.dial {
        let ctx = ctx.clone();
        let intranet = intranet.clone();
        let session_addr = session_addr.clone();
        let agent_addr = agent_addr.clone();
        tasks.spawn(async move {
            loop {
                let mut stream = tokio::select! {
                    _ = ctx.cancelled() => break,
                    res = accept.accept() => match res {
                        Ok(s) => s,
                        Err(_) => break,
                    },
                };

                let ctx = ctx.clone();
                let intranet = intranet.clone();
                let session_addr = session_addr.clone();
                let agent_addr = agent_addr.clone();
                tokio::spawn(async move {
                    let dialer = intranet.assume(
                        session_addr.network().to_string(),
                        session_addr.address().to_string(),
                    );
                    match dialer
                        .dial(&ctx, agent_addr.network().to_string(), agent_addr.address().to_string())
                        .await
                    {
                        Ok(mut conn) => {
                            let _ = tokio::io::copy_bidirectional(&mut stream, &mut conn).await;
                        }
                        Err(e) => tracing::debug!(error = %e, "toLocal dial failed"),
                    }
                });
            }
            accept.close();
        });
    }

    if policy.listen {
        let ctx = ctx.clone();
        let mut control = control.clone();
        let intranet = intranet.clone();
        let agent_addr = agent_addr.clone();
        tasks.spawn(async move {
            let stream = tokio::select! {
                _ = ctx.cancelled() => return,
                res = control.open() => match res {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(error = %e, "toRemote: open address-fetch stream failed");
                        return;
                    }
                },
            };

            let peer_agent_url = match fetch_agent_url(stream, agent_addr.address()).await {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!(error = %e, "toRemote: fetch peer agent url failed");
                    return;
                }
            };

            let Ok(parsed) = url::Url::parse(&peer_agent_url) else {
                tracing::warn!(url = %peer_agent_url, "toRemote: peer agent url is not a valid URL");
                return;
            };
            let host = match (parsed.host_str(), parsed.port()) {
                (Some(h), Some(p)) => format!("{h}:{p}"),
                (Some(h), None) => h.to_string(),
                (None, _) => return,
            };

            let local = intranet.assume(parsed.scheme().to_string(), host);

            loop {
                let mut conn = tokio::select! {
                    _ = ctx.cancelled() => break,
                    res = local.accept() => match res {
                        Ok(c) => c,
                        Err(_) => break,
                    },
                };

                let mut control = control.clone();
                tokio::spawn(async move {
                    match control.open().await {
                        Ok(mut stream) => {
                            let _ = tokio::io::copy_bidirectional(&mut conn, &mut stream).await;
                        }
                        Err(e) => tracing::debug!(error = %e, "toRemote open failed"),
                    }
                });
            }

            let _ = local.close().await;
        });
    }

    // Whichever of the heartbeat/dial/listen tasks finishes first cancels the rest.
    tasks.join_next().await;
    ctx.cancel();
    while tasks.join_next().await.is_some() {}

    control.close().await;
    let _ = remote.close().await;

    Ok(())
}
