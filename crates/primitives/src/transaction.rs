//! Transaction types, lenient decoding and identifier computation.

use novoindex_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::{sha256, sha256d};
use crate::outpoint::OutPoint;
use crate::script::OP_RETURN;

/// Transactions of this version are identified by [`Transaction::rich_txid`].
pub const RICH_TX_VERSION: i32 = 2;

#[derive(Clone, Debug, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn is_generation(&self) -> bool {
        self.prevout.is_null()
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        write_vec(&mut encoder, &self.vin);
        write_vec(&mut encoder, &self.vout);
        encoder.write_u32_le(self.lock_time);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, TransactionDecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes.into());
        }
        Ok(tx)
    }

    /// Decode one transaction at the decoder's cursor.
    ///
    /// An input or output that fails to parse is dropped and the cursor is
    /// put back where that entry began. When fewer than four bytes are left
    /// for the lock time, the last four bytes of the buffer are used.
    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, TransactionDecodeError> {
        let version = decoder.read_i32_le()?;
        let vin = read_vec_lenient(decoder)?;
        let vout = read_vec_lenient(decoder)?;
        if decoder.remaining() < 4 {
            let len = decoder.input().len();
            if len < 4 {
                return Err(DecodeError::UnexpectedEof.into());
            }
            decoder.set_position(len - 4);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }

    /// Decode one transaction and compute its identifier.
    ///
    /// Rich transactions hash their parsed fields; everything else hashes
    /// the exact byte range the decoder consumed.
    pub fn decode_with_txid(
        decoder: &mut Decoder,
    ) -> Result<(Self, Hash256), TransactionDecodeError> {
        let start = decoder.position();
        let tx = Self::decode_from(decoder)?;
        let txid = if tx.version == RICH_TX_VERSION {
            tx.rich_txid()
        } else {
            let consumed = decoder.input().get(start..decoder.position()).unwrap_or(&[]);
            sha256d(consumed)
        };
        Ok((tx, txid))
    }

    pub fn txid(&self) -> Hash256 {
        if self.version == RICH_TX_VERSION {
            self.rich_txid()
        } else {
            sha256d(&self.consensus_encode())
        }
    }

    /// Identifier of a version-2 transaction.
    ///
    /// `sha256d(version ++ n_in ++ hash_inputs ++ n_out ++ hash_outputs ++ lock_time)`
    /// with the counts packed as 32-bit little-endian integers.
    pub fn rich_txid(&self) -> Hash256 {
        let mut encoder = Encoder::with_capacity(80);
        encoder.write_u32_le(self.version as u32);
        encoder.write_i32_le(self.vin.len() as i32);
        encoder.write_hash_le(&self.hash_inputs());
        encoder.write_i32_le(self.vout.len() as i32);
        encoder.write_hash_le(&self.hash_outputs());
        encoder.write_u32_le(self.lock_time);
        sha256d(&encoder.into_inner())
    }

    fn hash_inputs(&self) -> Hash256 {
        let mut acc = Vec::with_capacity(self.vin.len() * 32);
        for input in &self.vin {
            let mut encoder = Encoder::with_capacity(72);
            encoder.write_hash_le(&input.prevout.hash);
            encoder.write_u32_le(input.prevout.index);
            encoder.write_hash_le(&sha256(&input.script_sig));
            encoder.write_u32_le(input.sequence);
            acc.extend_from_slice(&sha256(&encoder.into_inner()));
        }
        sha256(&acc)
    }

    fn hash_outputs(&self) -> Hash256 {
        let mut acc = Vec::with_capacity(self.vout.len() * 32);
        for output in &self.vout {
            let script = output.script_pubkey.as_slice();
            let mut encoder = Encoder::with_capacity(104);
            encoder.write_u64_le(output.value as u64);
            encoder.write_hash_le(&sha256(script));
            if let Some(pc) = state_offset(script) {
                encoder.write_hash_le(&sha256(&script[..pc]));
                encoder.write_hash_le(&sha256(&script[pc..]));
            }
            acc.extend_from_slice(&sha256(&encoder.into_inner()));
        }
        sha256(&acc)
    }
}

/// Offset of the embedded state carried at the end of an output script.
///
/// The trailer is laid out as `OP_RETURN <state> <state_len: u32 LE> <version: u8>`;
/// the returned offset is the first state byte.
pub fn state_offset(script: &[u8]) -> Option<usize> {
    let len = script.len();
    if len < 6 {
        return None;
    }
    let len_pos = len - 5;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&script[len_pos..len_pos + 4]);
    let state_len = u32::from_le_bytes(raw) as usize;
    if len < state_len.checked_add(6)? {
        return None;
    }
    let pc = len_pos - state_len;
    if script[pc - 1] != OP_RETURN {
        return None;
    }
    Some(pc)
}

fn write_vec<T: Encodable>(encoder: &mut Encoder, values: &[T]) {
    encoder.write_varint(values.len() as u64);
    for value in values {
        value.consensus_encode(encoder);
    }
}

fn read_vec_lenient<T: Decodable>(decoder: &mut Decoder) -> Result<Vec<T>, DecodeError> {
    let count = decoder.read_varint()?;
    let mut values = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let start = decoder.position();
        match T::consensus_decode(decoder) {
            Ok(value) => values.push(value),
            Err(_) => {
                decoder.set_position(start);
                // every later entry starts at this offset and fails the same way
                break;
            }
        }
    }
    Ok(values)
}

#[derive(Debug)]
pub enum TransactionDecodeError {
    Decode(DecodeError),
}

impl From<DecodeError> for TransactionDecodeError {
    fn from(error: DecodeError) -> Self {
        TransactionDecodeError::Decode(error)
    }
}

impl std::fmt::Display for TransactionDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionDecodeError::Decode(error) => write!(f, "transaction decode: {error}"),
        }
    }
}

impl std::error::Error for TransactionDecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_trailer_offsets() {
        // OP_DUP ... OP_RETURN <2 state bytes> len=2 version=1
        let script = [0x76, 0xa9, OP_RETURN, 0xde, 0xad, 0x02, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(state_offset(&script), Some(3));

        // empty state directly after OP_RETURN
        let script = [OP_RETURN, 0x00, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(state_offset(&script), Some(1));

        // marker missing
        let script = [0x51, 0xde, 0xad, 0x02, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(state_offset(&script), None);

        // declared length longer than the script
        let script = [OP_RETURN, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(state_offset(&script), None);

        assert_eq!(state_offset(&[OP_RETURN, 0, 0, 0, 0]), None);
    }
}
