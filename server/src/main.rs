use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpSocket;
use tracing::{info, warn};

// Use jemalloc on Linux for reduced fragmentation on long-running server
// processes; other platforms keep the system allocator.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use parley_server::config::ServerConfig;
use parley_server::connection;
use parley_server::state::ServerState;

/// How often idle sessions are swept in the background, on top of the lazy
/// reaping every registry operation performs anyway.
const SESSION_SWEEP_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("parley_server=debug".parse()?),
        )
        .init();

    info!("Starting Parley server");

    let config = ServerConfig::from_env()?.apply_args(std::env::args().skip(1))?;
    info!(
        "Configuration loaded (data_dir={}, session_timeout={}s)",
        config.data_dir.display(),
        config.session_timeout_secs
    );

    let state = Arc::new(ServerState::new(config.clone())?);
    state.activity.event("server started");

    // Periodic session sweep, so idle sessions expire even on a quiet server
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(SESSION_SWEEP_SECS));
            interval.tick().await; // skip the immediate first tick
            loop {
                interval.tick().await;
                let reaped = state.sessions.reap_expired();
                if reaped > 0 {
                    info!("Session sweep: {} idle sessions expired", reaped);
                }
            }
        });
    }

    let addr: std::net::SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid listen address")?;
    let socket = TcpSocket::new_v4().context("creating listen socket")?;
    socket.set_reuseaddr(true).ok();
    socket
        .bind(addr)
        .with_context(|| format!("binding {addr}"))?;
    let listener = socket
        .listen(config.listen_backlog)
        .with_context(|| format!("listening on {addr}"))?;

    info!(
        "Server listening on {} (session_timeout={}s)",
        addr, config.session_timeout_secs
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(connection::serve_connection(state.clone(), stream, peer));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    state.activity.event("server stopped");
    info!("Server stopped cleanly");
    Ok(())
}
