//! Block encryption with a keyed keystream and an authentication tag.
//!
//! The cipher itself is a collaborator of the pipeline; this one is a simple
//! xxh3-driven keystream so that encrypted round trips and authentication
//! failures can be exercised without a cryptography stack.

use std::collections::HashMap;

use parking_lot::RwLock;
use xxhash_rust::xxh3::{xxh3_64_with_seed, xxh3_64};

use crate::common::exception::ZioError;
use crate::storage::blkptr::CryptParams;

/// Wrapping keys known to the pool, by key id.
#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<u64, u64>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_key(&self, key_id: u64, material: &[u8]) {
        self.keys.write().insert(key_id, xxh3_64(material));
    }

    pub fn unload_key(&self, key_id: u64) {
        self.keys.write().remove(&key_id);
    }

    pub fn key(&self, key_id: u64) -> Result<u64, ZioError> {
        self.keys.read().get(&key_id).copied().ok_or(ZioError::Authentication)
    }
}

fn apply_keystream(key: u64, iv: u64, data: &mut [u8]) {
    for (block, chunk) in data.chunks_mut(8).enumerate() {
        let counter = (block as u64).to_le_bytes();
        let pad = xxh3_64_with_seed(&counter, key ^ iv.rotate_left(17)).to_le_bytes();
        for (b, p) in chunk.iter_mut().zip(pad.iter()) {
            *b ^= p;
        }
    }
}

fn mac(key: u64, iv: u64, ciphertext: &[u8]) -> u64 {
    xxh3_64_with_seed(ciphertext, key.wrapping_mul(0x100_0000_01b3) ^ iv)
}

/// Encrypts `data` under `key`, returning the ciphertext and its parameters.
pub fn encrypt(key_id: u64, key: u64, iv: u64, data: &[u8]) -> (Vec<u8>, CryptParams) {
    let mut out = data.to_vec();
    apply_keystream(key, iv, &mut out);
    let tag = mac(key, iv, &out);
    (out, CryptParams { key_id, iv, mac: tag })
}

/// Authenticates and decrypts `src` into `dst`.
pub fn decrypt(key: u64, params: &CryptParams, src: &[u8], dst: &mut [u8]) -> Result<(), ZioError> {
    let len = dst.len().min(src.len());
    if mac(key, params.iv, &src[..len]) != params.mac {
        return Err(ZioError::Authentication);
    }
    dst[..len].copy_from_slice(&src[..len]);
    apply_keystream(key, params.iv, &mut dst[..len]);
    Ok(())
}
