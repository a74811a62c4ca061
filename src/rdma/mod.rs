pub mod protocol;

#[cfg(feature = "rdma")]
pub mod buffer;
#[cfg(feature = "rdma")]
pub mod connection;
#[cfg(feature = "rdma")]
pub mod server;

#[cfg(feature = "rdma")]
pub use server::RdmaServer;

#[cfg(feature = "rdma")]
#[derive(Debug, thiserror::Error)]
pub enum RdmaError {
    #[error("buffer allocation failed")]
    Alloc,
    #[error("ibv_reg_mr failed")]
    RegMr,
    #[error("invalid RDMA bind address")]
    BadAddr,
    #[error("connection closed")]
    Closed,
    #[error("{0} failed")]
    Sys(&'static str),
}
