//! Per-network coin parameter tables.

use std::fmt;

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Self::Mainnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoinParams {
    pub name: &'static str,
    pub network: Network,
    pub genesis_hash: Hash256,
    /// First height at which only `OP_FALSE OP_RETURN` outputs are unspendable.
    pub genesis_activation: i32,
    pub reorg_limit: i32,
    /// Rough chain size used to damp the sync ETA.
    pub tx_count: u64,
    pub tx_count_height: i32,
    pub tx_per_block: u64,
    /// Blocks below this height are small enough to fetch in large batches.
    pub small_block_height: i32,
    pub max_fetch_small: usize,
    pub max_fetch: usize,
}

impl CoinParams {
    /// Largest number of blocks to request from the daemon in one round
    /// starting at `height`.
    pub fn max_fetch_blocks(&self, height: i32) -> usize {
        if height < self.small_block_height {
            self.max_fetch_small
        } else {
            self.max_fetch
        }
    }

    /// Lowest height for which undo information is kept when the chain tip
    /// is at `max_height`.
    pub fn min_undo_height(&self, max_height: i32) -> i32 {
        max_height - self.reorg_limit + 1
    }

    /// Estimated number of transactions left to index, used for the ETA line
    /// printed after each flush while syncing.
    pub fn estimate_txs_remaining(&self, height: i32, tx_count: u64, daemon_height: i32) -> f64 {
        let tail_count = daemon_height - height.max(self.tx_count_height);
        let ratio = f64::from(height) / f64::from(self.tx_count_height.max(1));
        let realism = (2.0 - 0.9 * ratio).max(1.0);
        let known = self.tx_count.saturating_sub(tx_count) as f64;
        (f64::from(tail_count) * self.tx_per_block as f64 + known) * realism
    }
}

pub fn coin_params(network: Network) -> CoinParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Regtest => regtest_params(),
    }
}

fn mainnet_params() -> CoinParams {
    CoinParams {
        name: "Novo",
        network: Network::Mainnet,
        genesis_hash: hash_const("000000b97664fd7f0486b8fd6f2131ffed2a7b689f67b1728fa7a0b6cacf6196"),
        genesis_activation: 100_000_000,
        reorg_limit: 800,
        tx_count: 1,
        tx_count_height: 1,
        tx_per_block: 1,
        small_block_height: 130_000,
        max_fetch_small: 1000,
        max_fetch: 100,
    }
}

// Regtest chains are local; the genesis hash comes from the operator's
// configuration.
fn regtest_params() -> CoinParams {
    CoinParams {
        name: "Novo",
        network: Network::Regtest,
        genesis_hash: [0u8; 32],
        reorg_limit: 100,
        ..mainnet_params()
    }
}

fn hash_const(hex: &str) -> Hash256 {
    match hash256_from_hex(hex) {
        Ok(hash) => hash,
        Err(_) => [0u8; 32],
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex must be 64 characters"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parse a hash in display order (big-endian hex) into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let bytes = hex.as_bytes();
    let mut out = [0u8; 32];
    for (i, chunk) in bytes.chunks(2).enumerate() {
        let hi = hex_val(chunk[0]).ok_or(HexError::InvalidHex)?;
        let lo = hex_val(chunk[1]).ok_or(HexError::InvalidHex)?;
        out[31 - i] = (hi << 4) | lo;
    }
    Ok(out)
}

/// Render a hash in display order.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_val(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
