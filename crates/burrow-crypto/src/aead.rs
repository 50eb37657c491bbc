//! Chunked XChaCha20-Poly1305 stream codec
//!
//! Wire format (bit-exact, no outer header or trailer):
//! ```text
//! [4 bytes: u32 LE ciphertext length][length bytes: ciphertext + 16-byte tag] ...
//! ```
//! End of stream is a clean EOF where the next length header would start.
//!
//! Per-chunk nonce: the first 16 bytes of the session nonce base, followed by
//! the u64 LE chunk index. The last 8 bytes of the nonce base do not enter
//! the nonce in version 1; they are still carried in the envelope.
//!
//! AAD = `"burrow.v1"` || object id || index (u64 LE) || plaintext length
//! (u64 LE). This binds object identity, chunk position, and chunk length
//! into the tag, so reordering, truncation, duplication, and cross-object
//! splicing all fail authentication.

use std::io::{Read, Write};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use burrow_core::{BurrowError, BurrowResult};

use crate::kdf::DataKey;
use crate::{NBASE_SIZE, TAG_SIZE};

/// ASCII tag mixed into every chunk's AAD. Bump only with a format change.
const VERSION_TAG: &[u8] = b"burrow.v1";

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 << 20;

/// Smallest permitted chunk size: 32 KiB.
pub const MIN_CHUNK_SIZE: usize = 32 << 10;

/// Largest permitted chunk size: 64 MiB.
pub const MAX_CHUNK_SIZE: usize = 64 << 20;

/// Parameters of one AEAD stream.
///
/// `generate` is the only way to obtain params for encryption: the nonce
/// base is sampled fresh from the OS RNG per upload session, and params read
/// back from an envelope must only ever be fed to [`decrypt`]. Reusing a
/// nonce base with the same data key breaks the AEAD entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AeadParams {
    pub object_id: String,
    pub chunk_size: usize,
    #[serde(with = "crate::serde_b64::array")]
    pub nbase: [u8; NBASE_SIZE],
}

impl AeadParams {
    /// Create fresh params for an upload session.
    ///
    /// A `chunk_size` of 0 selects the 4 MiB default; anything else must be
    /// within `[32 KiB, 64 MiB]`.
    pub fn generate(object_id: &str, chunk_size: usize) -> BurrowResult<Self> {
        if object_id.is_empty() {
            return Err(BurrowError::InvalidInput("object id required".into()));
        }
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(BurrowError::InvalidInput(format!(
                "chunk size {chunk_size} outside [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]"
            )));
        }

        let mut nbase = [0u8; NBASE_SIZE];
        OsRng.fill_bytes(&mut nbase);
        Ok(Self {
            object_id: object_id.to_owned(),
            chunk_size,
            nbase,
        })
    }

    fn validate(&self) -> BurrowResult<()> {
        if self.object_id.is_empty() {
            return Err(BurrowError::InvalidInput("object id required".into()));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(BurrowError::InvalidInput(format!(
                "chunk size {} outside [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]",
                self.chunk_size
            )));
        }
        Ok(())
    }

    fn nonce_for(&self, index: u64) -> [u8; NBASE_SIZE] {
        let mut nonce = [0u8; NBASE_SIZE];
        nonce[..16].copy_from_slice(&self.nbase[..16]);
        nonce[16..].copy_from_slice(&index.to_le_bytes());
        nonce
    }

    fn aad_for(&self, index: u64, plain_len: u64) -> Vec<u8> {
        let mut aad =
            Vec::with_capacity(VERSION_TAG.len() + self.object_id.len() + 16);
        aad.extend_from_slice(VERSION_TAG);
        aad.extend_from_slice(self.object_id.as_bytes());
        aad.extend_from_slice(&index.to_le_bytes());
        aad.extend_from_slice(&plain_len.to_le_bytes());
        aad
    }
}

/// What a completed encrypt or decrypt pass reports.
#[derive(Debug, Clone)]
pub struct AeadSummary {
    pub params: AeadParams,
    pub data_key: DataKey,
    pub plain_sha: [u8; 32],
    pub total_plain: u64,
}

/// Encrypt `src` into `dst` as a stream of sealed chunks.
///
/// Reads up to `chunk_size` plaintext bytes at a time; every chunk except
/// possibly the last is full. The running SHA-256 over the plaintext is
/// returned in the summary.
pub fn encrypt(
    dst: &mut dyn Write,
    src: &mut dyn Read,
    data_key: &DataKey,
    params: &AeadParams,
) -> BurrowResult<AeadSummary> {
    params.validate()?;
    let cipher = XChaCha20Poly1305::new(data_key.as_bytes().into());

    let mut buf = vec![0u8; params.chunk_size];
    let mut hasher = Sha256::new();
    let mut total_plain: u64 = 0;
    let mut index: u64 = 0;

    loop {
        let n = read_full(src, &mut buf)?;
        if n == 0 {
            break;
        }

        let nonce = params.nonce_for(index);
        let aad = params.aad_for(index, n as u64);
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &buf[..n],
                    aad: &aad,
                },
            )
            .map_err(|_| BurrowError::Crypto(format!("chunk {index}: encryption failed")))?;

        dst.write_all(&(ciphertext.len() as u32).to_le_bytes())?;
        dst.write_all(&ciphertext)?;

        hasher.update(&buf[..n]);
        total_plain += n as u64;
        index += 1;
    }
    dst.flush()?;

    Ok(AeadSummary {
        params: params.clone(),
        data_key: data_key.clone(),
        plain_sha: hasher.finalize().into(),
        total_plain,
    })
}

/// Decrypt a stream of sealed chunks from `src` into `dst`.
///
/// Authentication failure on any chunk is fatal and names the chunk index.
/// A clean EOF where a length header would start terminates the stream.
pub fn decrypt(
    dst: &mut dyn Write,
    src: &mut dyn Read,
    data_key: &DataKey,
    params: &AeadParams,
) -> BurrowResult<AeadSummary> {
    params.validate()?;
    let cipher = XChaCha20Poly1305::new(data_key.as_bytes().into());

    let mut hasher = Sha256::new();
    let mut total_plain: u64 = 0;
    let mut index: u64 = 0;

    loop {
        let mut hdr = [0u8; 4];
        match read_full(src, &mut hdr)? {
            0 => break,
            4 => {}
            n => {
                return Err(BurrowError::Crypto(format!(
                    "chunk {index}: truncated length header ({n} of 4 bytes)"
                )))
            }
        }

        let ct_len = u32::from_le_bytes(hdr) as usize;
        if ct_len < TAG_SIZE {
            return Err(BurrowError::Crypto(format!(
                "chunk {index}: ciphertext too short ({ct_len} bytes)"
            )));
        }
        if ct_len > params.chunk_size + TAG_SIZE {
            return Err(BurrowError::Crypto(format!(
                "chunk {index}: ciphertext length {ct_len} exceeds chunk size"
            )));
        }

        let mut ciphertext = vec![0u8; ct_len];
        let n = read_full(src, &mut ciphertext)?;
        if n != ct_len {
            return Err(BurrowError::Crypto(format!(
                "chunk {index}: truncated ciphertext ({n} of {ct_len} bytes)"
            )));
        }

        let nonce = params.nonce_for(index);
        let aad = params.aad_for(index, (ct_len - TAG_SIZE) as u64);
        let plaintext = cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                BurrowError::Crypto(format!("chunk {index}: authentication failed"))
            })?;

        dst.write_all(&plaintext)?;
        hasher.update(&plaintext);
        total_plain += plaintext.len() as u64;
        index += 1;
    }
    dst.flush()?;

    Ok(AeadSummary {
        params: params.clone(),
        data_key: data_key.clone(),
        plain_sha: hasher.finalize().into(),
        total_plain,
    })
}

/// Constant-time comparison of two plaintext digests.
pub fn digests_equal(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.ct_eq(b).into()
}

/// Read until `buf` is full or EOF. Returns the number of bytes read; a
/// return shorter than `buf` means EOF was reached.
fn read_full(src: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::derive_data_key;
    use proptest::prelude::*;

    fn test_key(object_id: &str) -> DataKey {
        derive_data_key(&[9u8; 64], object_id).unwrap()
    }

    fn roundtrip(plaintext: &[u8], chunk_size: usize) -> (Vec<u8>, AeadSummary, AeadSummary) {
        let key = test_key("test-obj");
        let params = AeadParams::generate("test-obj", chunk_size).unwrap();

        let mut encrypted = Vec::new();
        let enc = encrypt(&mut encrypted, &mut &plaintext[..], &key, &params).unwrap();

        let mut decrypted = Vec::new();
        let dec = decrypt(&mut decrypted, &mut &encrypted[..], &key, &params).unwrap();

        assert_eq!(decrypted, plaintext);
        (encrypted, enc, dec)
    }

    #[test]
    fn test_params_validation() {
        let cases: &[(&str, usize, bool)] = &[
            ("obj", 0, true),
            ("obj", 1 << 20, true),
            ("obj", MIN_CHUNK_SIZE, true),
            ("obj", MAX_CHUNK_SIZE, true),
            ("", 0, false),
            ("obj", 1024, false),
            ("obj", MAX_CHUNK_SIZE + 1, false),
        ];
        for &(id, chunk, ok) in cases {
            let result = AeadParams::generate(id, chunk);
            assert_eq!(result.is_ok(), ok, "id={id:?} chunk={chunk}");
            if let Ok(params) = result {
                let expected = if chunk == 0 { DEFAULT_CHUNK_SIZE } else { chunk };
                assert_eq!(params.chunk_size, expected);
                assert_ne!(params.nbase, [0u8; NBASE_SIZE], "nbase must be sampled");
            }
        }
    }

    #[test]
    fn test_fresh_params_differ() {
        let a = AeadParams::generate("obj", 0).unwrap();
        let b = AeadParams::generate("obj", 0).unwrap();
        assert_ne!(a.nbase, b.nbase, "every session needs a fresh nonce base");
    }

    #[test]
    fn test_roundtrip_shapes() {
        roundtrip(b"hello world", MIN_CHUNK_SIZE);
        roundtrip(&[], MIN_CHUNK_SIZE);
        roundtrip(&vec![0xA5u8; MIN_CHUNK_SIZE], MIN_CHUNK_SIZE);
        roundtrip(&vec![0x5Au8; MIN_CHUNK_SIZE * 3 + 17], MIN_CHUNK_SIZE);
    }

    #[test]
    fn test_digest_matches_both_directions() {
        let plaintext = b"hello world";
        let (_, enc, dec) = roundtrip(plaintext, MIN_CHUNK_SIZE);

        let expected: [u8; 32] = Sha256::digest(plaintext).into();
        assert_eq!(enc.plain_sha, expected);
        assert!(digests_equal(&enc.plain_sha, &dec.plain_sha));
        assert_eq!(enc.total_plain, plaintext.len() as u64);
        assert_eq!(dec.total_plain, plaintext.len() as u64);
    }

    #[test]
    fn test_framing_overhead() {
        let plaintext = vec![1u8; MIN_CHUNK_SIZE + 100];
        let (encrypted, _, _) = roundtrip(&plaintext, MIN_CHUNK_SIZE);
        // full chunk + remainder, each framed as 4-byte header + ct + tag
        assert_eq!(
            encrypted.len(),
            (4 + MIN_CHUNK_SIZE + TAG_SIZE) + (4 + 100 + TAG_SIZE)
        );
    }

    #[test]
    fn test_bit_flip_fails_with_chunk_index() {
        let key = test_key("obj");
        let params = AeadParams::generate("obj", MIN_CHUNK_SIZE).unwrap();
        let plaintext = vec![7u8; MIN_CHUNK_SIZE * 2];

        let mut encrypted = Vec::new();
        encrypt(&mut encrypted, &mut &plaintext[..], &key, &params).unwrap();

        // flip one bit inside chunk 1's ciphertext
        let chunk1_payload = 4 + MIN_CHUNK_SIZE + TAG_SIZE + 4 + 10;
        encrypted[chunk1_payload] ^= 0x01;

        let mut out = Vec::new();
        let err = decrypt(&mut out, &mut &encrypted[..], &key, &params).unwrap_err();
        match err {
            BurrowError::Crypto(msg) => assert!(msg.contains("chunk 1"), "got: {msg}"),
            other => panic!("expected crypto error, got {other:?}"),
        }
    }

    #[test]
    fn test_chunk_swap_fails() {
        let key = test_key("obj");
        let params = AeadParams::generate("obj", MIN_CHUNK_SIZE).unwrap();
        let plaintext = vec![3u8; MIN_CHUNK_SIZE * 2];

        let mut encrypted = Vec::new();
        encrypt(&mut encrypted, &mut &plaintext[..], &key, &params).unwrap();

        // swap the two (identically sized) framed chunks
        let frame = 4 + MIN_CHUNK_SIZE + TAG_SIZE;
        let mut swapped = Vec::with_capacity(encrypted.len());
        swapped.extend_from_slice(&encrypted[frame..]);
        swapped.extend_from_slice(&encrypted[..frame]);

        let mut out = Vec::new();
        assert!(decrypt(&mut out, &mut &swapped[..], &key, &params).is_err());
    }

    #[test]
    fn test_truncation_fails() {
        let key = test_key("obj");
        let params = AeadParams::generate("obj", MIN_CHUNK_SIZE).unwrap();
        let plaintext = vec![4u8; MIN_CHUNK_SIZE];

        let mut encrypted = Vec::new();
        encrypt(&mut encrypted, &mut &plaintext[..], &key, &params).unwrap();
        encrypted.truncate(encrypted.len() - 7);

        let mut out = Vec::new();
        assert!(decrypt(&mut out, &mut &encrypted[..], &key, &params).is_err());
    }

    #[test]
    fn test_cross_object_splice_fails() {
        let master = [9u8; 64];
        let plaintext = vec![8u8; MIN_CHUNK_SIZE];

        let key_a = derive_data_key(&master, "object-a").unwrap();
        let params_a = AeadParams::generate("object-a", MIN_CHUNK_SIZE).unwrap();
        let mut blob_a = Vec::new();
        encrypt(&mut blob_a, &mut &plaintext[..], &key_a, &params_a).unwrap();

        let key_b = derive_data_key(&master, "object-b").unwrap();
        let params_b = AeadParams::generate("object-b", MIN_CHUNK_SIZE).unwrap();
        let mut blob_b = Vec::new();
        encrypt(&mut blob_b, &mut &plaintext[..], &key_b, &params_b).unwrap();

        // same index, same length, wrong object
        let mut out = Vec::new();
        assert!(
            decrypt(&mut out, &mut &blob_b[..], &key_a, &params_a).is_err(),
            "AAD must bind the object id"
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let params = AeadParams::generate("obj", MIN_CHUNK_SIZE).unwrap();
        let mut encrypted = Vec::new();
        encrypt(
            &mut encrypted,
            &mut &b"secret data"[..],
            &test_key("obj"),
            &params,
        )
        .unwrap();

        let other = DataKey::from_bytes([0xEE; 32]);
        let mut out = Vec::new();
        assert!(decrypt(&mut out, &mut &encrypted[..], &other, &params).is_err());
    }

    #[test]
    fn test_corrupt_header_table() {
        let key = test_key("obj");
        let params = AeadParams::generate("obj", MIN_CHUNK_SIZE).unwrap();

        let cases: &[&[u8]] = &[
            &[0, 0, 0],                // truncated header
            &[15, 0, 0, 0],            // length below tag size
            &[32, 0, 0, 0, 1, 2, 3],   // incomplete ciphertext
            &[0xFF, 0xFF, 0xFF, 0xFF], // absurd length
        ];
        for data in cases {
            let mut out = Vec::new();
            assert!(
                decrypt(&mut out, &mut &data[..], &key, &params).is_err(),
                "input {data:?} must fail"
            );
        }
    }

    #[test]
    fn test_params_serde_roundtrip() {
        let params = AeadParams::generate("obj", MIN_CHUNK_SIZE).unwrap();
        let json = serde_json::to_string(&params).unwrap();
        let back: AeadParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params, back);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_roundtrip_random(
            plaintext in proptest::collection::vec(any::<u8>(), 0..=256 * 1024),
            chunk_kib in 32usize..=256usize,
        ) {
            let key = test_key("prop-obj");
            let params = AeadParams::generate("prop-obj", chunk_kib << 10).unwrap();

            let mut encrypted = Vec::new();
            let enc = encrypt(&mut encrypted, &mut &plaintext[..], &key, &params).unwrap();

            let mut decrypted = Vec::new();
            let dec = decrypt(&mut decrypted, &mut &encrypted[..], &key, &params).unwrap();

            prop_assert_eq!(decrypted, plaintext);
            prop_assert!(digests_equal(&enc.plain_sha, &dec.plain_sha));
        }
    }
}
