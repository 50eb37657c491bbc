//! Encrypted configuration store
//!
//! The config file holds everything needed to talk to the bucket and to
//! decrypt envelopes: S3 credentials, the 64-byte master key, and the age
//! keypair. At rest it is a single age ciphertext sealed to the user's
//! passphrase (scrypt recipient), written to
//! `<user-config-dir>/burrow/config.enc` with mode 0600.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{BurrowError, BurrowResult};
use crate::MASTER_KEY_SIZE;

const CONFIG_DIR: &str = "burrow";
const CONFIG_FILE: &str = "config.enc";

#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    pub key_id: String,
    pub app_key: String,
    pub bucket_name: String,
    pub region: String,
    #[serde(with = "base64_bytes")]
    pub master_key: Vec<u8>,
    pub age_public_key: String,
    pub age_private_key: String,
}

impl Config {
    /// Check that the config is complete enough to upload and download.
    pub fn validate(&self) -> BurrowResult<()> {
        if self.key_id.is_empty() || self.app_key.is_empty() {
            return Err(BurrowError::Config("storage credentials missing".into()));
        }
        if self.bucket_name.is_empty() || self.region.is_empty() {
            return Err(BurrowError::Config("bucket name and region required".into()));
        }
        if self.master_key.len() != MASTER_KEY_SIZE {
            return Err(BurrowError::InvalidInput(format!(
                "master key must be {MASTER_KEY_SIZE} bytes, got {}",
                self.master_key.len()
            )));
        }
        self.age_public_key
            .parse::<age::x25519::Recipient>()
            .map_err(|e| BurrowError::Config(format!("invalid age public key: {e}")))?;
        self.age_private_key
            .parse::<age::x25519::Identity>()
            .map_err(|_| BurrowError::Config("invalid age private key".into()))?;
        Ok(())
    }

    /// Default on-disk location: `<user-config-dir>/burrow/config.enc`.
    pub fn default_path() -> BurrowResult<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| BurrowError::Config("cannot determine user config directory".into()))?;
        Ok(base.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn exists() -> bool {
        Self::default_path().map(|p| p.exists()).unwrap_or(false)
    }

    /// Seal with the passphrase and write to the default location.
    pub fn save(&self, passphrase: &str) -> BurrowResult<()> {
        self.save_to(&Self::default_path()?, passphrase)
    }

    pub fn save_to(&self, path: &Path, passphrase: &str) -> BurrowResult<()> {
        let json = serde_json::to_vec(self)
            .map_err(|e| BurrowError::Config(format!("serializing config: {e}")))?;
        let sealed = seal_with_passphrase(&json, passphrase)?;

        let dir = path
            .parent()
            .ok_or_else(|| BurrowError::Config("config path has no parent".into()))?;
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }

        // Write-then-rename keeps a half-written config from shadowing a good one.
        let tmp = path.with_extension("enc.tmp");
        std::fs::write(&tmp, &sealed)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load and unseal from the default location.
    pub fn load(passphrase: &str) -> BurrowResult<Config> {
        Self::load_from(&Self::default_path()?, passphrase)
    }

    pub fn load_from(path: &Path, passphrase: &str) -> BurrowResult<Config> {
        let sealed = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BurrowError::Config(format!(
                    "config not found at {} (run setup first)",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let json = open_with_passphrase(&sealed, passphrase)
            .map_err(|_| BurrowError::Config("failed to decrypt config (wrong passphrase?)".into()))?;

        serde_json::from_slice(&json)
            .map_err(|e| BurrowError::Config(format!("malformed config: {e}")))
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        self.master_key.zeroize();
        self.app_key.zeroize();
        self.age_private_key.zeroize();
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("key_id", &self.key_id)
            .field("app_key", &"[REDACTED]")
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .field("master_key", &"[REDACTED]")
            .field("age_public_key", &self.age_public_key)
            .field("age_private_key", &"[REDACTED]")
            .finish()
    }
}

fn seal_with_passphrase(plaintext: &[u8], passphrase: &str) -> BurrowResult<Vec<u8>> {
    let recipient = age::scrypt::Recipient::new(SecretString::from(passphrase.to_owned()));
    let encryptor = age::Encryptor::with_recipients(std::iter::once(&recipient as &dyn age::Recipient))
        .map_err(|e| BurrowError::Crypto(format!("age scrypt: {e}")))?;

    let mut sealed = Vec::new();
    let mut writer = encryptor
        .wrap_output(&mut sealed)
        .map_err(|e| BurrowError::Crypto(format!("age encrypt: {e}")))?;
    writer.write_all(plaintext)?;
    writer
        .finish()
        .map_err(|e| BurrowError::Crypto(format!("age finalize: {e}")))?;
    Ok(sealed)
}

fn open_with_passphrase(sealed: &[u8], passphrase: &str) -> BurrowResult<Vec<u8>> {
    let identity = age::scrypt::Identity::new(SecretString::from(passphrase.to_owned()));
    let decryptor = age::Decryptor::new(sealed)
        .map_err(|e| BurrowError::Crypto(format!("age header: {e}")))?;
    let mut reader = decryptor
        .decrypt(std::iter::once(&identity as &dyn age::Identity))
        .map_err(|e| BurrowError::Crypto(format!("age decrypt: {e}")))?;
    let mut plaintext = Vec::new();
    reader.read_to_end(&mut plaintext)?;
    Ok(plaintext)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
