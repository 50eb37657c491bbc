//! burrow-crypto: the cryptographic core of burrow
//!
//! Pipeline position: tar → compress → **AEAD encrypt** → upload.
//!
//! Key hierarchy:
//! ```text
//! Master Key (64 random bytes, stored only inside the sealed config)
//!   └── Data Key (per-object, HKDF-SHA256, salt=object id, info="burrow/data")
//!         └── Chunk AEAD: XChaCha20-Poly1305
//!               nonce = nbase[..16] || chunk index (LE)
//!               AAD   = "burrow.v1" || object id || index (LE) || pt len (LE)
//! Envelope (JSON: params, data key, compression mode, plaintext SHA-256)
//!   sealed to age X25519 recipients; config sealed to the age scrypt
//!   (passphrase) recipient.
//! ```

pub mod aead;
pub mod age_io;
pub mod envelope;
pub mod kdf;

pub use aead::{AeadParams, AeadSummary, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use age_io::{generate_keypair, OpenConfig, SealConfig};
pub use envelope::Envelope;
pub use kdf::{derive_data_key, DataKey};

/// Size of a data key in bytes (256-bit).
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce base.
pub const NBASE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag.
pub const TAG_SIZE: usize = 16;

/// Serde helpers for byte fields encoded as standard base64 strings.
pub(crate) mod serde_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub mod vec {
        use super::*;

        pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
            ser.serialize_str(&STANDARD.encode(bytes))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
            let s = String::deserialize(de)?;
            STANDARD.decode(s).map_err(serde::de::Error::custom)
        }
    }

    pub mod array {
        use super::*;

        pub fn serialize<S: Serializer, const N: usize>(
            bytes: &[u8; N],
            ser: S,
        ) -> Result<S::Ok, S::Error> {
            ser.serialize_str(&STANDARD.encode(bytes))
        }

        pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
            de: D,
        ) -> Result<[u8; N], D::Error> {
            let s = String::deserialize(de)?;
            let decoded = STANDARD.decode(s).map_err(serde::de::Error::custom)?;
            decoded.try_into().map_err(|v: Vec<u8>| {
                serde::de::Error::custom(format!("expected {N} bytes, got {}", v.len()))
            })
        }
    }
}
