//! overlay-node: loads a declared service tree and runs it until
//! shutdown.
//!
//! The declared tree (Agent/Accept/Access/Forward/Proxy/Relay, nested
//! under one root `Group`) does all of the interesting listening; this
//! binary additionally exposes a minimal diagnostics listener on `$PORT`
//! — grounded directly on the original program's top-level `main`,
//! which was nothing more than `hello`/`headers` handlers bound to
//! `os.Getenv("PORT")`.

mod config;

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use config::NodeConfig;
use http_body_util::Full;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use overlay_core::error::{OverlayError, OverlayResult};
use overlay_core::registry::{Capabilities, Registry};
use overlay_core::service::Service;
use overlay_core::{Group, Intranet};
use tokio::net::TcpListener;
use tracing::{error, info};

/// overlay-node — runs a declared overlay service tree
#[derive(Parser, Debug)]
#[command(name = "overlay-node", version, about = "Programmable overlay networking runtime")]
struct Cli {
    /// Path to the JSON service-tree document (overrides `[node] config_path`)
    #[arg(long)]
    service_doc: Option<String>,

    /// Config file path (TOML)
    #[arg(long, default_value = "~/.overlay/node.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let node_config = match NodeConfig::load(
        Some(&PathBuf::from(&cli.config)),
        cli.service_doc.as_deref(),
        cli.log_level.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&node_config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let port = match std::env::var("PORT") {
        Ok(p) => p,
        Err(_) => {
            error!("PORT is not set");
            std::process::exit(1);
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), %port, "starting overlay-node");

    if let Err(e) = run(node_config, &port).await {
        error!(error = %e, "overlay-node exited with error");
        std::process::exit(1);
    }

    info!("overlay-node stopped");
}

async fn run(node_config: NodeConfig, port: &str) -> OverlayResult<()> {
    let document = load_service_document(&node_config.service_doc_path)?;

    let mut registry = Registry::new();
    overlay_services::register_all(&mut registry);
    let caps = Capabilities::new(Intranet::new(), Arc::new(registry));

    let mut root = Group::new("Group", caps);
    root.from_json(&document).await?;

    let diagnostics = TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(OverlayError::Io)?;

    tokio::select! {
        _ = serve_diagnostics(diagnostics) => {}
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    root.close().await
}

fn load_service_document(path: &std::path::Path) -> OverlayResult<serde_json::Value> {
    if !path.exists() {
        info!(path = %path.display(), "service document not found, starting an empty Group");
        return Ok(serde_json::json!({"Type": "Group", "Services": {}}));
    }
    let content = std::fs::read_to_string(path).map_err(OverlayError::Io)?;
    serde_json::from_str(&content).map_err(|e| OverlayError::Config(e.to_string()))
}

async fn serve_diagnostics(listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "diagnostics accept failed");
                continue;
            }
        };

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(move |req| diagnostics_handler(req, peer));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(error = %e, "diagnostics connection ended");
            }
        });
    }
}

async fn diagnostics_handler(
    req: Request<hyper::body::Incoming>,
    peer: std::net::SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = if req.uri().path() == "/headers" {
        let mut out = String::new();
        for (name, value) in req.headers() {
            out.push_str(&format!("{name}: {}\n", value.to_str().unwrap_or("")));
        }
        out
    } else {
        format!("hello {peer}, URL:{}\n", req.uri())
    };
    Ok(Response::new(Full::new(Bytes::from(body))))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
