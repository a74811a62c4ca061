use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use ember::cache::LruCache;
use ember::config::Config;
use ember::http::{shutdown_signal, HttpServer};
use ember::metrics::metrics;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = Arc::new(Config::parse());
    let threads = cfg.effective_threads();

    info!(
        "Starting webserver port={}, threads={}, doc_root='{}', mem_cache={} MB, timeouts: read={}ms write={}ms keepalive={}ms",
        cfg.port,
        threads,
        cfg.doc_root.display(),
        cfg.cache_mem_mb,
        cfg.read_timeout_ms,
        cfg.write_timeout_ms,
        cfg.keepalive_timeout_ms
    );
    #[cfg(feature = "rdma")]
    info!(
        "RDMA: enabled={}, bind={}, port={}, pollers={}",
        cfg.rdma_enable, cfg.rdma_bind, cfg.rdma_port, cfg.rdma_pollers
    );

    let cache = Arc::new(LruCache::new(cfg.cache_capacity_bytes()));
    metrics().reset();

    #[cfg(feature = "rdma")]
    let mut rdma_srv = if cfg.rdma_enable {
        Some(
            ember::rdma::RdmaServer::start(cfg.clone(), cache.clone())
                .context("RDMA startup failed")?,
        )
    } else {
        None
    };
    #[cfg(not(feature = "rdma"))]
    if cfg.rdma_enable {
        log::warn!("--rdma-enable ignored: built without the 'rdma' feature");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    rt.block_on(async {
        let server = HttpServer::bind(cfg.clone(), cache.clone())
            .await
            .context("HTTP bind failed")?;
        tokio::select! {
            _ = server.run() => {}
            _ = shutdown_signal() => {}
        }
        Ok::<(), anyhow::Error>(())
    })?;

    #[cfg(feature = "rdma")]
    if let Some(srv) = rdma_srv.as_mut() {
        srv.stop();
    }

    info!("Webserver stopped");
    Ok(())
}
