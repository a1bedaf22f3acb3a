//! Coin parameters consumed by the indexer.

pub mod params;

pub use params::{
    coin_params, hash256_from_hex, hash256_to_hex, CoinParams, HexError, Network,
};

/// 32-byte hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];
