//! Raw blocks as delivered by the daemon.

use novoindex_consensus::{hash256_to_hex, CoinParams, Hash256};

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::transaction::{Transaction, TransactionDecodeError};

pub const HEADER_SIZE: usize = 80;

pub type RawHeader = [u8; HEADER_SIZE];

#[derive(Clone, Debug)]
pub struct Block {
    pub raw: Vec<u8>,
    pub header: RawHeader,
    pub transactions: Vec<(Transaction, Hash256)>,
}

impl Block {
    /// Split a raw block into its header and `(transaction, txid)` pairs.
    /// Bytes after the last transaction are ignored.
    pub fn from_raw(raw: Vec<u8>) -> Result<Self, BlockDecodeError> {
        let mut decoder = Decoder::new(&raw);
        let header: RawHeader = decoder.read_fixed()?;
        let transactions = read_tx_block(&mut decoder)?;
        Ok(Self {
            raw,
            header,
            transactions,
        })
    }

    pub fn hash(&self) -> Hash256 {
        header_hash(&self.header)
    }

    pub fn prev_hash(&self) -> Hash256 {
        header_prev_hash(&self.header)
    }
}

/// Decode a varint transaction count followed by that many transactions.
pub fn read_tx_block(
    decoder: &mut Decoder,
) -> Result<Vec<(Transaction, Hash256)>, TransactionDecodeError> {
    let count = decoder.read_varint()?;
    let mut txs = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        txs.push(Transaction::decode_with_txid(decoder)?);
    }
    Ok(txs)
}

pub fn header_hash(header: &RawHeader) -> Hash256 {
    sha256d(header)
}

pub fn header_prev_hash(header: &RawHeader) -> Hash256 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&header[4..36]);
    out
}

/// Serialize a header and transactions into the daemon's raw block layout.
pub fn serialize_block(header: &RawHeader, transactions: &[Transaction]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_bytes(header);
    encoder.write_varint(transactions.len() as u64);
    for tx in transactions {
        encoder.write_bytes(&tx.consensus_encode());
    }
    encoder.into_inner()
}

/// Check that a raw block fetched at height 0 is the coin's genesis block.
pub fn verify_genesis_block(raw: &[u8], params: &CoinParams) -> Result<(), BlockDecodeError> {
    let header: RawHeader = Decoder::new(raw).read_fixed()?;
    let hash = header_hash(&header);
    if hash != params.genesis_hash {
        return Err(BlockDecodeError::GenesisMismatch {
            expected: params.genesis_hash,
            found: hash,
        });
    }
    Ok(())
}

#[derive(Debug)]
pub enum BlockDecodeError {
    Decode(DecodeError),
    Transaction(TransactionDecodeError),
    GenesisMismatch { expected: Hash256, found: Hash256 },
}

impl From<DecodeError> for BlockDecodeError {
    fn from(error: DecodeError) -> Self {
        BlockDecodeError::Decode(error)
    }
}

impl From<TransactionDecodeError> for BlockDecodeError {
    fn from(error: TransactionDecodeError) -> Self {
        BlockDecodeError::Transaction(error)
    }
}

impl std::fmt::Display for BlockDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockDecodeError::Decode(error) => write!(f, "block decode: {error}"),
            BlockDecodeError::Transaction(error) => write!(f, "{error}"),
            BlockDecodeError::GenesisMismatch { expected, found } => write!(
                f,
                "genesis block has hash {} expected {}",
                hash256_to_hex(found),
                hash256_to_hex(expected)
            ),
        }
    }
}

impl std::error::Error for BlockDecodeError {}
