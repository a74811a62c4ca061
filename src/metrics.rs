use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;

/// Process-wide counters shared by both transports.
///
/// All updates are relaxed; readers are not promised a consistent snapshot.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub responses_2xx: AtomicU64,
    pub responses_4xx: AtomicU64,
    pub responses_5xx: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub bytes_served: AtomicU64,

    // RDMA counters
    pub rdma_requests: AtomicU64,
    pub rdma_ok: AtomicU64,
    pub rdma_err: AtomicU64,
    pub rdma_bytes: AtomicU64,
}

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::default);

/// The process-wide metrics singleton.
pub fn metrics() -> &'static Metrics {
    &METRICS
}

impl Metrics {
    pub fn reset(&self) {
        self.requests_total.store(0, Ordering::Relaxed);
        self.responses_2xx.store(0, Ordering::Relaxed);
        self.responses_4xx.store(0, Ordering::Relaxed);
        self.responses_5xx.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.bytes_served.store(0, Ordering::Relaxed);
        self.rdma_requests.store(0, Ordering::Relaxed);
        self.rdma_ok.store(0, Ordering::Relaxed);
        self.rdma_err.store(0, Ordering::Relaxed);
        self.rdma_bytes.store(0, Ordering::Relaxed);
    }

    /// One `name value\n` line per counter, in a fixed order.
    pub fn render_text(&self) -> String {
        let mut out = String::with_capacity(256);
        for (name, counter) in [
            ("requests_total", &self.requests_total),
            ("responses_2xx", &self.responses_2xx),
            ("responses_4xx", &self.responses_4xx),
            ("responses_5xx", &self.responses_5xx),
            ("cache_hits", &self.cache_hits),
            ("cache_misses", &self.cache_misses),
            ("bytes_served", &self.bytes_served),
            ("rdma_requests", &self.rdma_requests),
            ("rdma_ok", &self.rdma_ok),
            ("rdma_err", &self.rdma_err),
            ("rdma_bytes", &self.rdma_bytes),
        ] {
            out.push_str(name);
            out.push(' ');
            out.push_str(&counter.load(Ordering::Relaxed).to_string());
            out.push('\n');
        }
        out
    }
}
