//! Block and transaction codec, hashing and script helpers.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod script;
pub mod transaction;

pub use block::{
    header_hash, header_prev_hash, serialize_block, verify_genesis_block, Block,
    BlockDecodeError, RawHeader, HEADER_SIZE,
};
pub use hash::{sha256, sha256d};
pub use outpoint::OutPoint;
pub use script::{hashx_from_script, is_unspendable, HashX, HASHX_LEN};
pub use transaction::{state_offset, Transaction, TransactionDecodeError, TxIn, TxOut};
