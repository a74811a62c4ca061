use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{info, warn};
use tokio::net::TcpListener;

use crate::cache::LruCache;
use crate::config::Config;
use crate::http::session::Session;

/// Accepts connections and hands each one to a new `Session` task.
pub struct HttpServer {
    listener: TcpListener,
    cfg: Arc<Config>,
    cache: Arc<LruCache>,
}

impl HttpServer {
    pub async fn bind(cfg: Arc<Config>, cache: Arc<LruCache>) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", cfg.port)).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            cfg,
            cache,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; never returns. Callers race it against a shutdown
    /// future.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    info!("Accepted {}", peer);
                    let session = Session::new(stream, self.cfg.clone(), self.cache.clone());
                    tokio::spawn(session.run());
                }
                Err(e) => {
                    warn!("accept error: {}", e);
                }
            }
        }
    }
}

/// Resolves once a shutdown signal arrives, logging which one. Both
/// transports stop after this: the caller drops the accept loop and then
/// stops the RDMA server so completions drain before verbs teardown.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    let caught = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    };
    info!("Caught {}, shutting down...", caught);
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Caught Ctrl+C, shutting down...");
}
