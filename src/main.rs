// Server-side session core: accepts WebSocket upgrades on /ws/terminal and
// drives PTY-backed terminal sessions through it.

use anyhow::{Context, Result};
use std::sync::Arc;
use termcore::config::Config;
use termcore::manager::ConnectionManager;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("termcore={level}").parse()?),
        )
        .with_target(false)
        .with_line_number(true)
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let local_addr = listener.local_addr()?;
    info!("terminal session core listening on ws://{}/ws/terminal", local_addr);

    let manager = ConnectionManager::new(config);

    let shutdown_manager = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, draining sessions");
            shutdown_manager.shutdown().await;
            std::process::exit(0);
        }
    });

    let mut connection_count: u64 = 0;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                connection_count += 1;
                info!(peer = %peer, "new connection #{}", connection_count);
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, manager).await {
                        warn!(peer = %peer, error = %e, "connection ended with error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "failed to accept connection");
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, manager: Arc<ConnectionManager>) -> Result<()> {
    let callback = |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                    response: tokio_tungstenite::tungstenite::handshake::server::Response| {
        if req.uri().path() != "/ws/terminal" {
            return Err(tokio_tungstenite::tungstenite::http::Response::builder()
                .status(404)
                .body(None::<String>)
                .unwrap());
        }
        Ok(response)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .context("websocket handshake failed")?;

    let id = manager.accept(ws_stream);
    info!(session = %id, "accepted new terminal session");
    Ok(())
}
