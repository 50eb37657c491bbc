//! age encryption for small payloads (envelopes, config, auxiliary files)
//!
//! Two mutually exclusive modes per call:
//! - passphrase: the age scrypt recipient (single-party)
//! - recipients: one or more X25519 public keys; any matching identity opens
//!
//! Armor is optional on write. On read it is auto-detected from the
//! `-----BEGIN AGE ENCRYPTED FILE-----` first line; binary input passes
//! through untouched.

use std::io::{BufReader, Read, Write};

use age::armor::{ArmoredReader, ArmoredWriter, Format};
use secrecy::{ExposeSecret, SecretString};

use burrow_core::{BurrowError, BurrowResult};

/// Generate a new X25519 keypair as (public, private) strings.
pub fn generate_keypair() -> (String, String) {
    let identity = age::x25519::Identity::generate();
    let public = identity.to_public().to_string();
    let private = identity.to_string().expose_secret().to_owned();
    (public, private)
}

/// Selects passphrase- or key-based sealing. Exactly one of `passphrase` or
/// `recipients` must be set.
#[derive(Clone, Default)]
pub struct SealConfig {
    pub passphrase: Option<SecretString>,
    /// age public keys: `age1...` (X25519)
    pub recipients: Vec<String>,
    /// wrap the ciphertext in ASCII armor
    pub armor: bool,
}

impl SealConfig {
    pub fn with_passphrase(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: Some(SecretString::from(passphrase.into())),
            ..Self::default()
        }
    }

    pub fn with_recipients(recipients: Vec<String>, armor: bool) -> Self {
        Self {
            passphrase: None,
            recipients,
            armor,
        }
    }

    fn validate(&self) -> BurrowResult<()> {
        if self.passphrase.is_some() == !self.recipients.is_empty() {
            return Err(BurrowError::InvalidInput(
                "exactly one of passphrase or recipients must be set".into(),
            ));
        }
        Ok(())
    }
}

/// Selects passphrase- or key-based opening. Exactly one of `passphrase` or
/// `identities` must be set.
#[derive(Clone, Default)]
pub struct OpenConfig {
    pub passphrase: Option<SecretString>,
    /// age secret keys (`AGE-SECRET-KEY-1...`) or paths to identity files
    pub identities: Vec<String>,
}

impl OpenConfig {
    pub fn with_passphrase(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: Some(SecretString::from(passphrase.into())),
            identities: Vec::new(),
        }
    }

    pub fn with_identities(identities: Vec<String>) -> Self {
        Self {
            passphrase: None,
            identities,
        }
    }

    fn validate(&self) -> BurrowResult<()> {
        if self.passphrase.is_some() == !self.identities.is_empty() {
            return Err(BurrowError::InvalidInput(
                "exactly one of passphrase or identities must be set".into(),
            ));
        }
        Ok(())
    }
}

/// Seal everything from `src` into `dst`. Returns the plaintext byte count.
pub fn seal(dst: &mut dyn Write, src: &mut dyn Read, cfg: &SealConfig) -> BurrowResult<u64> {
    cfg.validate()?;
    let recipients = build_recipients(cfg)?;
    let encryptor =
        age::Encryptor::with_recipients(recipients.iter().map(|r| r.as_ref()))
            .map_err(|e| BurrowError::Crypto(format!("age encrypt: {e}")))?;

    // The inner age stream must be finished before the armor wrapper; both
    // finish() calls below run in that order.
    if cfg.armor {
        let armored = ArmoredWriter::wrap_output(dst, Format::AsciiArmor)
            .map_err(|e| BurrowError::Crypto(format!("age armor: {e}")))?;
        let mut writer = encryptor
            .wrap_output(armored)
            .map_err(|e| BurrowError::Crypto(format!("age encrypt: {e}")))?;
        let n = std::io::copy(src, &mut writer)?;
        let armored = writer
            .finish()
            .map_err(|e| BurrowError::Crypto(format!("age finalize: {e}")))?;
        armored
            .finish()
            .map_err(|e| BurrowError::Crypto(format!("age armor finalize: {e}")))?;
        Ok(n)
    } else {
        let mut writer = encryptor
            .wrap_output(dst)
            .map_err(|e| BurrowError::Crypto(format!("age encrypt: {e}")))?;
        let n = std::io::copy(src, &mut writer)?;
        writer
            .finish()
            .map_err(|e| BurrowError::Crypto(format!("age finalize: {e}")))?;
        Ok(n)
    }
}

/// Open an age ciphertext from `src` into `dst`. Returns the plaintext byte
/// count. Armored and binary inputs are both accepted.
pub fn open(dst: &mut dyn Write, src: &mut dyn Read, cfg: &OpenConfig) -> BurrowResult<u64> {
    cfg.validate()?;
    let identities = build_identities(cfg)?;

    let armored = ArmoredReader::new(BufReader::new(src));
    let decryptor = age::Decryptor::new(armored)
        .map_err(|e| BurrowError::Crypto(format!("age header: {e}")))?;
    let mut reader = decryptor
        .decrypt(identities.iter().map(|i| i.as_ref()))
        .map_err(|e| BurrowError::Crypto(format!("age decrypt: {e}")))?;

    let n = std::io::copy(&mut reader, dst)?;
    Ok(n)
}

/// Seal an in-memory payload.
pub fn seal_bytes(plaintext: &[u8], cfg: &SealConfig) -> BurrowResult<Vec<u8>> {
    let mut sealed = Vec::new();
    seal(&mut sealed, &mut &plaintext[..], cfg)?;
    Ok(sealed)
}

/// Open an in-memory payload.
pub fn open_bytes(sealed: &[u8], cfg: &OpenConfig) -> BurrowResult<Vec<u8>> {
    let mut plaintext = Vec::new();
    open(&mut plaintext, &mut &sealed[..], cfg)?;
    Ok(plaintext)
}

fn build_recipients(cfg: &SealConfig) -> BurrowResult<Vec<Box<dyn age::Recipient>>> {
    if let Some(passphrase) = &cfg.passphrase {
        return Ok(vec![Box::new(age::scrypt::Recipient::new(
            passphrase.clone(),
        ))]);
    }

    let mut recipients: Vec<Box<dyn age::Recipient>> = Vec::new();
    for key in &cfg.recipients {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let recipient = key
            .parse::<age::x25519::Recipient>()
            .map_err(|e| BurrowError::InvalidInput(format!("recipient {key:?}: {e}")))?;
        recipients.push(Box::new(recipient));
    }
    if recipients.is_empty() {
        return Err(BurrowError::InvalidInput("no valid recipients provided".into()));
    }
    Ok(recipients)
}

fn build_identities(cfg: &OpenConfig) -> BurrowResult<Vec<Box<dyn age::Identity>>> {
    if let Some(passphrase) = &cfg.passphrase {
        return Ok(vec![Box::new(age::scrypt::Identity::new(
            passphrase.clone(),
        ))]);
    }

    let mut identities: Vec<Box<dyn age::Identity>> = Vec::new();
    for entry in &cfg.identities {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if entry.starts_with("AGE-SECRET-KEY-") {
            let identity = entry
                .parse::<age::x25519::Identity>()
                .map_err(|e| BurrowError::InvalidInput(format!("identity: {e}")))?;
            identities.push(Box::new(identity));
            continue;
        }
        // Otherwise treat as a path to an identity file.
        let content = std::fs::read_to_string(entry)
            .map_err(|e| BurrowError::InvalidInput(format!("identity file {entry:?}: {e}")))?;
        let mut found = false;
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with("AGE-SECRET-KEY-") {
                let identity = line
                    .parse::<age::x25519::Identity>()
                    .map_err(|e| {
                        BurrowError::InvalidInput(format!("identity in {entry:?}: {e}"))
                    })?;
                identities.push(Box::new(identity));
                found = true;
            }
        }
        if !found {
            return Err(BurrowError::InvalidInput(format!(
                "no AGE-SECRET-KEY found in {entry:?}"
            )));
        }
    }
    if identities.is_empty() {
        return Err(BurrowError::InvalidInput("no valid identities provided".into()));
    }
    Ok(identities)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipient_roundtrip() {
        let (public, private) = generate_keypair();
        let plaintext = b"envelope contents";

        let sealed =
            seal_bytes(plaintext, &SealConfig::with_recipients(vec![public], false)).unwrap();
        let opened = open_bytes(&sealed, &OpenConfig::with_identities(vec![private])).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_recipient_roundtrip_armored() {
        let (public, private) = generate_keypair();
        let plaintext = b"armored envelope";

        let sealed =
            seal_bytes(plaintext, &SealConfig::with_recipients(vec![public], true)).unwrap();
        assert!(sealed.starts_with(b"-----BEGIN AGE ENCRYPTED FILE-----"));

        let opened = open_bytes(&sealed, &OpenConfig::with_identities(vec![private])).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_passphrase_roundtrip() {
        let plaintext = b"config contents";
        let sealed = seal_bytes(plaintext, &SealConfig::with_passphrase("hunter2")).unwrap();
        let opened = open_bytes(&sealed, &OpenConfig::with_passphrase("hunter2")).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let sealed = seal_bytes(b"data", &SealConfig::with_passphrase("p1")).unwrap();
        let result = open_bytes(&sealed, &OpenConfig::with_passphrase("p2"));
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_identity_fails() {
        let (public, _) = generate_keypair();
        let (_, other_private) = generate_keypair();

        let sealed = seal_bytes(b"data", &SealConfig::with_recipients(vec![public], false)).unwrap();
        let result = open_bytes(&sealed, &OpenConfig::with_identities(vec![other_private]));
        assert!(result.is_err());
    }

    #[test]
    fn test_multiple_recipients_any_opens() {
        let (pub_a, priv_a) = generate_keypair();
        let (pub_b, priv_b) = generate_keypair();

        let sealed = seal_bytes(
            b"shared",
            &SealConfig::with_recipients(vec![pub_a, pub_b], false),
        )
        .unwrap();

        for private in [priv_a, priv_b] {
            let opened =
                open_bytes(&sealed, &OpenConfig::with_identities(vec![private])).unwrap();
            assert_eq!(opened, b"shared");
        }
    }

    #[test]
    fn test_identity_from_file() {
        let (public, private) = generate_keypair();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("keys.txt");
        std::fs::write(&key_path, format!("# created today\n{private}\n")).unwrap();

        let sealed = seal_bytes(b"data", &SealConfig::with_recipients(vec![public], false)).unwrap();
        let opened = open_bytes(
            &sealed,
            &OpenConfig::with_identities(vec![key_path.to_string_lossy().into_owned()]),
        )
        .unwrap();
        assert_eq!(opened, b"data");
    }

    #[test]
    fn test_seal_config_exactly_one_of() {
        let both = SealConfig {
            passphrase: Some(SecretString::from("p".to_owned())),
            recipients: vec!["age1...".into()],
            armor: false,
        };
        assert!(seal_bytes(b"x", &both).is_err());

        let neither = SealConfig::default();
        assert!(seal_bytes(b"x", &neither).is_err());
    }

    #[test]
    fn test_open_config_exactly_one_of() {
        let neither = OpenConfig::default();
        assert!(open_bytes(b"x", &neither).is_err());
    }

    #[test]
    fn test_invalid_recipient_rejected() {
        let cfg = SealConfig::with_recipients(vec!["not-a-key".into()], false);
        assert!(matches!(
            seal_bytes(b"x", &cfg),
            Err(BurrowError::InvalidInput(_))
        ));
    }
}
