pub mod cache;
pub mod config;
pub mod fs;
pub mod http;
pub mod metrics;
pub mod mime;
pub mod rdma;

pub use cache::{CacheEntry, LruCache};
pub use config::Config;
pub use metrics::{metrics, Metrics};
pub use mime::{mime_type, mime_type_for};
