use std::path::PathBuf;

use clap::Parser;

/// Runtime configuration for both transports and the shared cache.
///
/// Every option is recognized on the command line; defaults match the
/// values the server was tuned with.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ember",
    about = "Static file server with a shared in-memory cache and an optional RDMA transport"
)]
pub struct Config {
    /// HTTP listen port
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// HTTP reactor worker count (0 = hardware concurrency)
    #[arg(long, default_value_t = 0)]
    pub threads: usize,

    /// Document root directory
    #[arg(long, default_value = "./public")]
    pub doc_root: PathBuf,

    /// LRU cache capacity in MiB
    #[arg(long = "cache-mem-mb", default_value_t = 128)]
    pub cache_mem_mb: usize,

    /// Maximum request line length in bytes
    #[arg(long = "max-request-line", default_value_t = 8192)]
    pub max_request_line: usize,

    /// Maximum accumulated header bytes
    #[arg(long = "max-header-bytes", default_value_t = 32 * 1024)]
    pub max_header_bytes: usize,

    /// Per-read timeout in milliseconds
    #[arg(long = "read-timeout-ms", default_value_t = 5000)]
    pub read_timeout_ms: u64,

    /// Per-write timeout in milliseconds
    #[arg(long = "write-timeout-ms", default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Keep-alive idle timeout in milliseconds
    #[arg(long = "keepalive-timeout-ms", default_value_t = 10000)]
    pub keepalive_timeout_ms: u64,

    /// Start the RDMA transport
    #[arg(long = "rdma-enable")]
    pub rdma_enable: bool,

    /// RDMA bind address
    #[arg(long = "rdma-bind", default_value = "0.0.0.0")]
    pub rdma_bind: String,

    /// RDMA listen port
    #[arg(long = "rdma-port", default_value_t = 7471)]
    pub rdma_port: u16,

    /// RDMA completion-queue poller thread count
    #[arg(long = "rdma-pollers", default_value_t = 1)]
    pub rdma_pollers: usize,

    /// Posted RECV buffers per connection
    #[arg(long = "rdma-recv-bufs", default_value_t = 64)]
    pub rdma_recv_bufs_per_conn: usize,

    /// Bytes per posted RECV buffer
    #[arg(long = "rdma-recv-size", default_value_t = 4096)]
    pub rdma_recv_buf_size: usize,

    /// Body SEND chunk cap in bytes
    #[arg(long = "rdma-send-chunk", default_value_t = 32768)]
    pub rdma_send_chunk: usize,

    /// Per-connection outstanding SEND ceiling
    #[arg(long = "rdma-max-sends", default_value_t = 64)]
    pub rdma_max_outstanding_sends: usize,
}

impl Config {
    /// Worker count with the `0 = hardware concurrency` rule applied.
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.threads
        }
    }

    /// Cache capacity in bytes.
    pub fn cache_capacity_bytes(&self) -> usize {
        self.cache_mem_mb * 1024 * 1024
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            threads: 0,
            doc_root: PathBuf::from("./public"),
            cache_mem_mb: 128,
            max_request_line: 8192,
            max_header_bytes: 32 * 1024,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
            keepalive_timeout_ms: 10000,
            rdma_enable: false,
            rdma_bind: "0.0.0.0".to_string(),
            rdma_port: 7471,
            rdma_pollers: 1,
            rdma_recv_bufs_per_conn: 64,
            rdma_recv_buf_size: 4096,
            rdma_send_chunk: 32768,
            rdma_max_outstanding_sends: 64,
        }
    }
}
