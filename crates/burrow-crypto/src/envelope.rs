//! Sealed metadata envelope
//!
//! The envelope binds an object id to everything needed to restore it: the
//! AEAD parameters, the per-object data key, the compression mode, and the
//! plaintext digest. It is serialized as JSON, sealed to the configured age
//! recipients, and stored under `keys/<object id>.envelope` next to the data
//! blob. Carrying the data key is deliberate: the envelope itself is sealed,
//! and this decouples restore from possession of the master key.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use burrow_core::{BurrowError, BurrowResult};

use crate::aead::AeadParams;
use crate::age_io::{self, OpenConfig, SealConfig};

/// Current envelope version. Unknown versions fail closed on open.
pub const VERSION: &str = "burrow.1.1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encryption {
    pub params: AeadParams,
    #[serde(with = "crate::serde_b64::vec")]
    pub data_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compression {
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub object_id: String,
    pub encryption: Encryption,
    pub compression: Compression,
    #[serde(with = "crate::serde_b64::array")]
    pub plain_sha: [u8; 32],
    pub original_file_name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    /// Build a complete envelope from the outputs of a finished upload
    /// pipeline.
    pub fn new(
        object_id: impl Into<String>,
        original_file_name: impl Into<String>,
        params: AeadParams,
        data_key: Vec<u8>,
        compression_mode: impl Into<String>,
        plain_sha: [u8; 32],
    ) -> Self {
        Self {
            version: VERSION.to_owned(),
            object_id: object_id.into(),
            encryption: Encryption {
                params,
                data_key,
            },
            compression: Compression {
                mode: compression_mode.into(),
            },
            plain_sha,
            original_file_name: original_file_name.into(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Serialize and seal to the given age recipients.
    pub fn seal(&self, recipients: &[String], armor: bool) -> BurrowResult<Vec<u8>> {
        let raw = serde_json::to_vec(self)
            .map_err(|e| BurrowError::Format(format!("serializing envelope: {e}")))?;
        age_io::seal_bytes(
            &raw,
            &SealConfig::with_recipients(recipients.to_vec(), armor),
        )
    }

    /// Open a sealed envelope. The version gate runs before anything else
    /// trusts the contents.
    pub fn open(sealed: &[u8], cfg: &OpenConfig) -> BurrowResult<Envelope> {
        let raw = age_io::open_bytes(sealed, cfg)?;
        let envelope: Envelope = serde_json::from_slice(&raw)
            .map_err(|e| BurrowError::Format(format!("parsing envelope: {e}")))?;
        if envelope.version != VERSION {
            return Err(BurrowError::Format(format!(
                "unsupported envelope version {:?}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::age_io::generate_keypair;

    fn test_envelope() -> Envelope {
        let params = AeadParams::generate("01TESTOBJECT00000000000000", 0).unwrap();
        let mut envelope = Envelope::new(
            "01TESTOBJECT00000000000000",
            "photos",
            params,
            vec![0xAB; 32],
            "zstd",
            [7u8; 32],
        );
        envelope
            .metadata
            .insert("host".into(), "workstation".into());
        envelope
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (public, private) = generate_keypair();
        let envelope = test_envelope();

        let sealed = envelope.seal(&[public], true).unwrap();
        let opened =
            Envelope::open(&sealed, &OpenConfig::with_identities(vec![private])).unwrap();

        assert_eq!(opened.version, envelope.version);
        assert_eq!(opened.object_id, envelope.object_id);
        assert_eq!(opened.encryption.params, envelope.encryption.params);
        assert_eq!(opened.encryption.data_key, envelope.encryption.data_key);
        assert_eq!(opened.compression.mode, "zstd");
        assert_eq!(opened.plain_sha, envelope.plain_sha);
        assert_eq!(opened.original_file_name, "photos");
        assert_eq!(opened.metadata, envelope.metadata);
        assert_eq!(opened.created_at, envelope.created_at);
    }

    #[test]
    fn test_unknown_version_fails_closed() {
        let (public, private) = generate_keypair();
        let mut envelope = test_envelope();
        envelope.version = "burrow.9.9".into();

        let sealed = envelope.seal(&[public], false).unwrap();
        let err =
            Envelope::open(&sealed, &OpenConfig::with_identities(vec![private])).unwrap_err();
        match err {
            BurrowError::Format(msg) => assert!(msg.contains("burrow.9.9"), "got: {msg}"),
            other => panic!("expected format error, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_identity_cannot_open() {
        let (public, _) = generate_keypair();
        let (_, other_private) = generate_keypair();

        let sealed = test_envelope().seal(&[public], false).unwrap();
        let result = Envelope::open(&sealed, &OpenConfig::with_identities(vec![other_private]));
        assert!(result.is_err());
    }

    #[test]
    fn test_json_field_names() {
        let envelope = test_envelope();
        let json: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&envelope).unwrap()).unwrap();

        assert!(json.get("version").is_some());
        assert!(json.get("object_id").is_some());
        assert!(json["encryption"]["params"].get("nbase").is_some());
        assert!(json["encryption"].get("data_key").is_some());
        assert!(json["compression"].get("mode").is_some());
        assert!(json.get("plain_sha").is_some());
        assert!(json.get("original_file_name").is_some());
        assert!(json.get("created_at").is_some());
    }
}
