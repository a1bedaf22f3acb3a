//! The full node the index follows.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use novoindex_consensus::Hash256;
use novoindex_log::log_info;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DaemonError {
    /// Connection refused, timed out or otherwise unreachable.
    Unavailable(String),
    /// The daemon answered with an error.
    Rpc { code: i64, message: String },
    /// The daemon answered with something that does not fit the request.
    BadResponse(String),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::Unavailable(message) => write!(f, "daemon unavailable: {message}"),
            DaemonError::Rpc { code, message } => write!(f, "daemon error {code}: {message}"),
            DaemonError::BadResponse(message) => write!(f, "bad daemon response: {message}"),
        }
    }
}

impl std::error::Error for DaemonError {}

#[async_trait]
pub trait Daemon: Send + Sync + 'static {
    /// Query the current chain height and remember it.
    async fn height(&self) -> Result<i32, DaemonError>;

    /// Height from the last successful `height` call.
    fn cached_height(&self) -> i32;

    /// Hashes of blocks `first..first + count`.
    async fn block_hashes(&self, first: i32, count: usize) -> Result<Vec<Hash256>, DaemonError>;

    /// Raw blocks, in the order of `hashes`.
    async fn raw_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Vec<u8>>, DaemonError>;
}

/// Repeat `call` until the daemon answers, logging each fault and sleeping
/// `delay` in between.
pub async fn retry_daemon<T, F, Fut>(what: &str, delay: Duration, mut call: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DaemonError>>,
{
    loop {
        match call().await {
            Ok(value) => return value,
            Err(err) => {
                log_info!("{} failed, retrying: {}", what, err);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
