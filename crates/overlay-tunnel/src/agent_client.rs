//! Fetches the peer's declared agent URL over an already-open byte
//! stream (§4.5 step 3). Grounded on `original_source/agent.go`'s
//! `AgentClient`/`GetAgentURL` (a `sling.Sling` wrapper doing
//! `GET /api/address`), and reused verbatim by
//! `original_source/relay.go`'s chain-resolution step.
//!
//! Each call performs a fresh single-shot HTTP/1.1 handshake over the
//! stream it's given — mux logical streams and Intranet pipes are both
//! cheap to open, so there's no connection pool to manage here.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};

use overlay_core::error::{OverlayError, OverlayResult};

#[derive(Deserialize)]
struct AddressResponse {
    #[serde(rename = "Data")]
    data: AddressData,
}

#[derive(Deserialize)]
struct AddressData {
    #[serde(rename = "Agent")]
    agent: String,
}

/// `GET /api/address` over `stream`, returning the peer's declared
/// agent URL string.
pub async fn fetch_agent_url<S>(stream: S, host: &str) -> OverlayResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| OverlayError::Other(format!("agent.GetAgentURL handshake: {e}")))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "agent client connection ended");
        }
    });

    let request = Request::builder()
        .method("GET")
        .uri("/api/address")
        .header("Host", host)
        .body(Empty::<Bytes>::new())
        .map_err(|e| OverlayError::Other(format!("agent.GetAgentURL request: {e}")))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| OverlayError::Other(format!("agent.GetAgentURL: {e}")))?;

    if response.status().as_u16() > 299 {
        return Err(OverlayError::Other(format!(
            "agent.GetAgentURL code: {}",
            response.status()
        )));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| OverlayError::Other(format!("agent.GetAgentURL body: {e}")))?
        .to_bytes();

    let parsed: AddressResponse = serde_json::from_slice(&body)
        .map_err(|e| OverlayError::Other(format!("agent.GetAgentURL: {e}")))?;

    Ok(parsed.data.agent)
}
