//! Output script classification and address fingerprints.

use crate::hash::sha256;

pub const OP_FALSE: u8 = 0x00;
pub const OP_RETURN: u8 = 0x6a;

pub const HASHX_LEN: usize = 11;

/// Truncated script hash used as the address key of the index.
pub type HashX = [u8; HASHX_LEN];

pub fn hashx_from_script(script: &[u8]) -> HashX {
    let digest = sha256(script);
    let mut out = [0u8; HASHX_LEN];
    out.copy_from_slice(&digest[..HASHX_LEN]);
    out
}

pub fn is_unspendable_legacy(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN) || is_unspendable_genesis(script)
}

pub fn is_unspendable_genesis(script: &[u8]) -> bool {
    script.starts_with(&[OP_FALSE, OP_RETURN])
}

/// Whether an output paying to `script` can never be spent at `height`.
pub fn is_unspendable(script: &[u8], height: i32, genesis_activation: i32) -> bool {
    if height >= genesis_activation {
        is_unspendable_genesis(script)
    } else {
        is_unspendable_legacy(script)
    }
}
