//! The TCP server: accept loop, connection accounting, graceful shutdown.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::cluster::Cluster;
use crate::config::ServerConfig;
use crate::connection::{handle_client, Session};
use crate::db::engine::DbEngine;
use crate::resp::{CmdLine, RespValue};

/// Live client connections, process-wide.
pub static CLIENT_COUNTER: AtomicUsize = AtomicUsize::new(0);

const GRACEFUL_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The command executor behind every connection: the plain engine in
/// standalone mode, the routing cluster node in cluster mode.
#[derive(Clone)]
pub enum Backend {
    Standalone(Arc<DbEngine>),
    Cluster(Arc<Cluster>),
}

impl Backend {
    pub async fn exec(&self, session: &mut Session, cmdline: &CmdLine) -> RespValue {
        match self {
            Backend::Standalone(engine) => engine.exec(session, cmdline),
            Backend::Cluster(cluster) => cluster.exec(session, cmdline).await,
        }
    }

    pub fn close(&self) {
        match self {
            Backend::Standalone(engine) => engine.close(),
            Backend::Cluster(cluster) => cluster.close(),
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut quit = signal(SignalKind::quit()).expect("install SIGQUIT handler");
    tokio::select! {
        _ = hangup.recv() => {},
        _ = interrupt.recv() => {},
        _ = terminate.recv() => {},
        _ = quit.recv() => {},
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Binds the listener and serves until a shutdown signal arrives, then
/// drains live connections with a bounded wait and closes the backend.
pub async fn listen_and_serve(config: Arc<ServerConfig>, backend: Backend) -> io::Result<()> {
    let listener = TcpListener::bind(config.address()).await?;
    info!(address = %config.address(), "bind ok, start listening");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((mut stream, addr)) => {
                        let current = CLIENT_COUNTER.load(Ordering::Relaxed);
                        if config.max_clients > 0 && current >= config.max_clients {
                            warn!(%addr, "connection limit reached");
                            let reply = RespValue::Error("ERR max number of clients reached".to_string());
                            let _ = stream.write_all(reply.encode().as_bytes()).await;
                            continue;
                        }
                        CLIENT_COUNTER.fetch_add(1, Ordering::Relaxed);
                        let backend = backend.clone();
                        tokio::spawn(async move {
                            handle_client(stream, addr.to_string(), backend).await;
                            CLIENT_COUNTER.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::ConnectionAborted
                        || err.kind() == io::ErrorKind::Interrupted => {
                        // Transient accept failure; back off briefly.
                        warn!(%err, "accept temporary error, retry in 5ms");
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Err(err) => {
                        error!(%err, "accept failed");
                        break;
                    }
                }
            }
        }
    }

    // Stop accepting, then give live connections a bounded window.
    drop(listener);
    info!("shutting down");
    let deadline = tokio::time::Instant::now() + GRACEFUL_DRAIN_TIMEOUT;
    while CLIENT_COUNTER.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    backend.close();
    Ok(())
}
