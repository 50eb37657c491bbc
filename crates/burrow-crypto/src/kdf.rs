//! Per-object data-key derivation
//!
//! `derive_data_key` is a pure function of (master key, object id): HKDF over
//! SHA-256 with the object id as salt and `"burrow/data"` as the info string.
//! Because the object id is unique per upload, every object gets its own
//! 256-bit key without any additional state.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use burrow_core::{BurrowError, BurrowResult};

use crate::KEY_SIZE;

const HKDF_INFO: &[u8] = b"burrow/data";

/// A per-object 256-bit encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive the data key for one object from the master key.
pub fn derive_data_key(master_key: &[u8], object_id: &str) -> BurrowResult<DataKey> {
    if master_key.is_empty() {
        return Err(BurrowError::InvalidInput("master key is empty".into()));
    }
    if object_id.is_empty() {
        return Err(BurrowError::InvalidInput("object id is empty".into()));
    }

    let hkdf = Hkdf::<Sha256>::new(Some(object_id.as_bytes()), master_key);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(HKDF_INFO, &mut okm)
        .map_err(|e| BurrowError::Crypto(format!("HKDF expand failed: {e}")))?;

    Ok(DataKey::from_bytes(okm))
}
