//! Block prefetching and the asynchronous driver of the UTXO index.

pub mod config;
pub mod daemon;
pub mod notifications;
pub mod prefetcher;
pub mod processor;

pub use config::{ConfigError, IndexConfig};
pub use daemon::{Daemon, DaemonError};
pub use notifications::Notifications;
pub use prefetcher::{PrefetchError, Prefetcher};
pub use processor::{natural_reorg_start, BlockProcessor, SyncError};
