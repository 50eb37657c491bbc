//! Download orchestration
//!
//! Fetch and open the envelope first — the version gate and key check run
//! before a single data byte moves. Then `fetch → decrypt → decompress →
//! (extract | write-file)`, with the plaintext digest verified inside the
//! decrypt stage.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use burrow_archive::compress::decompress;
use burrow_archive::tar::extract_tar;
use burrow_core::{BurrowError, BurrowResult, Config};
use burrow_crypto::aead::{self, AeadSummary};
use burrow_crypto::age_io::OpenConfig;
use burrow_crypto::envelope::Envelope;
use burrow_crypto::kdf::derive_data_key;
use burrow_storage::Storage;

use crate::pipeline::{run_pipeline, Stage};
use crate::progress::{ProgressFn, ProgressWriter};
use crate::{data_key_for, envelope_key_for};

#[derive(Debug)]
pub struct DownloadOutcome {
    pub object_id: String,
    /// Where the restored bytes landed (the archive file, or the extraction
    /// root in extract mode).
    pub dest: PathBuf,
    pub total_plain: u64,
    pub extracted: bool,
}

/// Download, decrypt, and restore one object.
pub fn download(
    config: &Config,
    storage: &dyn Storage,
    object_id: &str,
    dest: &Path,
    extract: bool,
    progress: Option<&ProgressFn>,
) -> BurrowResult<DownloadOutcome> {
    config.validate()?;
    if object_id.is_empty() {
        return Err(BurrowError::InvalidInput("object id required".into()));
    }

    let envelope = fetch_envelope(config, storage, object_id)?;
    tracing::info!(
        object_id,
        mode = %envelope.compression.mode,
        original = %envelope.original_file_name,
        "envelope opened"
    );

    let out_path = if extract {
        dest.to_path_buf()
    } else {
        resolve_archive_path(dest, &envelope.original_file_name)
    };

    let aead_slot: Mutex<Option<AeadSummary>> = Mutex::new(None);

    let stages = vec![
        fetch_stage(storage, object_id),
        decrypt_stage(config, &envelope, &aead_slot),
        decompress_stage(&envelope),
        if extract {
            extract_stage(&out_path)
        } else {
            write_file_stage(&out_path, progress)
        },
    ];
    run_pipeline(stages)?;

    let summary = aead_slot
        .into_inner()
        .expect("slot lock")
        .ok_or_else(|| BurrowError::Other(anyhow::anyhow!("decrypt stage reported nothing")))?;

    tracing::info!(
        object_id,
        total_plain = summary.total_plain,
        dest = %out_path.display(),
        "download complete"
    );

    Ok(DownloadOutcome {
        object_id: object_id.to_owned(),
        dest: out_path,
        total_plain: summary.total_plain,
        extracted: extract,
    })
}

fn fetch_envelope(
    config: &Config,
    storage: &dyn Storage,
    object_id: &str,
) -> BurrowResult<Envelope> {
    let key = envelope_key_for(object_id);
    let mut sealed = Vec::new();
    storage.download(&key, &mut sealed)?;

    Envelope::open(
        &sealed,
        &OpenConfig::with_identities(vec![config.age_private_key.clone()]),
    )
}

/// Non-extract destinations: an existing directory gets
/// `<dest>/<original>.tar`, anything else becomes `<dest>.tar`.
fn resolve_archive_path(dest: &Path, original_file_name: &str) -> PathBuf {
    if dest.is_dir() {
        dest.join(format!("{original_file_name}.tar"))
    } else {
        let mut path = dest.as_os_str().to_owned();
        path.push(".tar");
        PathBuf::from(path)
    }
}

fn fetch_stage<'a>(storage: &'a dyn Storage, object_id: &'a str) -> Stage<'a> {
    Stage::new("fetch", move |_, out| {
        let mut out = out.expect("fetch stage writes to the pipeline");
        storage.download(&data_key_for(object_id), &mut out)?;
        Ok(())
    })
}

fn decrypt_stage<'a>(
    config: &'a Config,
    envelope: &'a Envelope,
    slot: &'a Mutex<Option<AeadSummary>>,
) -> Stage<'a> {
    Stage::new("decrypt", move |inp, out| {
        let mut inp = inp.expect("decrypt stage reads from the pipeline");
        let mut out = out.expect("decrypt stage writes to the pipeline");

        let data_key = derive_data_key(&config.master_key, &envelope.object_id)?;
        let summary = aead::decrypt(&mut out, &mut inp, &data_key, &envelope.encryption.params)?;

        if !aead::digests_equal(&summary.plain_sha, &envelope.plain_sha) {
            return Err(BurrowError::Integrity(
                "plaintext SHA-256 does not match the envelope".into(),
            ));
        }

        *slot.lock().expect("slot lock") = Some(summary);
        Ok(())
    })
}

fn decompress_stage<'a>(envelope: &'a Envelope) -> Stage<'a> {
    Stage::new("decompress", move |inp, out| {
        let mut inp = inp.expect("decompress stage reads from the pipeline");
        let mut out = out.expect("decompress stage writes to the pipeline");
        decompress(&mut out, &mut inp, &envelope.compression.mode)?;
        Ok(())
    })
}

fn extract_stage(dest: &Path) -> Stage<'_> {
    Stage::new("extract", move |inp, _| {
        let mut inp = inp.expect("extract stage reads from the pipeline");
        extract_tar(&mut inp, dest)
    })
}

fn write_file_stage<'a>(path: &'a Path, progress: Option<&'a ProgressFn>) -> Stage<'a> {
    Stage::new("write", move |inp, _| {
        let mut inp = inp.expect("write stage reads from the pipeline");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path)?;
        let mut writer = ProgressWriter::new(std::io::BufWriter::new(file), "write", progress);
        std::io::copy(&mut inp, &mut writer)?;
        use std::io::Write;
        writer.flush()?;
        Ok(())
    })
}
