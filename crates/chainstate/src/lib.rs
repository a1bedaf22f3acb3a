//! UTXO index: block application, backups and the flush boundary.

pub mod db;
pub mod flush;
pub mod history;
pub mod state;
pub mod undo;
pub mod utxo;

pub use db::{DbError, DbState, HistoryEntry, IndexDb, UtxoRecord, DB_VERSION};
pub use flush::{ChainCursor, FlushData};
pub use history::HistoryCache;
pub use state::{is_indexed_output, ChainState, ChainStateError};
