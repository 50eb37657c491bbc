//! Upload orchestration
//!
//! `archive → compress → encrypt → store`, then fill, seal, and upload the
//! envelope. The envelope can only be written after the data stream
//! completes, because it carries the plaintext digest and the compression
//! decision that the stages discover along the way.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use burrow_archive::compress::{CompressMode, Compressor, CompressorConfig, CompressReport};
use burrow_archive::tar::{stream_tar, TarOptions};
use burrow_core::{new_object_id, BurrowError, BurrowResult, Config};
use burrow_crypto::aead::{self, AeadParams, AeadSummary};
use burrow_crypto::envelope::Envelope;
use burrow_crypto::kdf::derive_data_key;
use burrow_storage::{Storage, DEFAULT_CONTENT_TYPE};

use crate::pipeline::{run_pipeline, Stage};
use crate::progress::{ProgressFn, ProgressReader, ProgressWriter};
use crate::{data_key_for, envelope_key_for};

/// zstd level for uploads.
const COMPRESSION_LEVEL: i32 = 3;
/// Minimum estimated saving for auto mode to pick zstd.
const COMPRESSION_MIN_SAVING: f64 = 0.05;
/// Auto-decision sample size.
const COMPRESSION_SAMPLE_BYTES: usize = 1 << 20;

/// What an upload leaves behind, beyond the stored objects.
#[derive(Debug)]
pub struct UploadOutcome {
    pub object_id: String,
    pub compress: CompressReport,
    pub plain_sha: [u8; 32],
    pub total_plain: u64,
}

/// Encrypt and upload `source` (file or directory tree), returning the fresh
/// object id.
pub fn upload(
    config: &Config,
    storage: &dyn Storage,
    source: &Path,
    progress: Option<&ProgressFn>,
) -> BurrowResult<UploadOutcome> {
    config.validate()?;
    if !source.exists() {
        return Err(BurrowError::InvalidInput(format!(
            "source not found: {}",
            source.display()
        )));
    }

    let object_id = new_object_id();
    let original_file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_owned());

    tracing::info!(%object_id, source = %source.display(), "starting upload");

    let compress_slot: Mutex<Option<CompressReport>> = Mutex::new(None);
    let aead_slot: Mutex<Option<AeadSummary>> = Mutex::new(None);

    let stages = vec![
        archive_stage(source, progress),
        compress_stage(&compress_slot),
        encrypt_stage(config, &object_id, &aead_slot),
        store_stage(storage, &object_id, progress),
    ];
    run_pipeline(stages)?;

    let compress = compress_slot
        .into_inner()
        .expect("slot lock")
        .ok_or_else(|| BurrowError::Other(anyhow::anyhow!("compress stage reported nothing")))?;
    let summary = aead_slot
        .into_inner()
        .expect("slot lock")
        .ok_or_else(|| BurrowError::Other(anyhow::anyhow!("encrypt stage reported nothing")))?;

    let envelope = Envelope::new(
        &object_id,
        &original_file_name,
        summary.params.clone(),
        summary.data_key.as_bytes().to_vec(),
        compress.mode_used.as_str(),
        summary.plain_sha,
    );
    let sealed = envelope.seal(std::slice::from_ref(&config.age_public_key), true)?;
    storage.upload(
        &envelope_key_for(&object_id),
        &mut &sealed[..],
        DEFAULT_CONTENT_TYPE,
        &HashMap::new(),
    )?;

    tracing::info!(
        %object_id,
        total_plain = summary.total_plain,
        mode = %compress.mode_used,
        "upload complete"
    );

    Ok(UploadOutcome {
        object_id,
        compress,
        plain_sha: summary.plain_sha,
        total_plain: summary.total_plain,
    })
}

fn archive_stage<'a>(source: &'a Path, progress: Option<&'a ProgressFn>) -> Stage<'a> {
    Stage::new("archive", move |_, out| {
        let out = out.expect("archive stage writes to the pipeline");
        let mut writer = ProgressWriter::new(out, "archive", progress);
        stream_tar(
            &mut writer,
            source,
            &TarOptions {
                include_root: true,
                deterministic: true,
                ..TarOptions::default()
            },
        )
    })
}

fn compress_stage<'a>(slot: &'a Mutex<Option<CompressReport>>) -> Stage<'a> {
    Stage::new("compress", move |inp, out| {
        let mut inp = inp.expect("compress stage reads from the pipeline");
        let out = out.expect("compress stage writes to the pipeline");

        let (mut compressor, _live) = Compressor::new(
            out,
            CompressorConfig {
                mode: CompressMode::Auto,
                zstd_level: COMPRESSION_LEVEL,
                auto_min_saving: COMPRESSION_MIN_SAVING,
                sample_bytes: COMPRESSION_SAMPLE_BYTES,
            },
        )?;
        std::io::copy(&mut inp, &mut compressor)?;
        let report = compressor.finish()?;
        *slot.lock().expect("slot lock") = Some(report);
        Ok(())
    })
}

fn encrypt_stage<'a>(
    config: &'a Config,
    object_id: &'a str,
    slot: &'a Mutex<Option<AeadSummary>>,
) -> Stage<'a> {
    Stage::new("encrypt", move |inp, out| {
        let mut inp = inp.expect("encrypt stage reads from the pipeline");
        let mut out = out.expect("encrypt stage writes to the pipeline");

        // Fresh params per session: the nonce base must never repeat.
        let params = AeadParams::generate(object_id, aead::DEFAULT_CHUNK_SIZE)?;
        let data_key = derive_data_key(&config.master_key, object_id)?;
        let summary = aead::encrypt(&mut out, &mut inp, &data_key, &params)?;
        *slot.lock().expect("slot lock") = Some(summary);
        Ok(())
    })
}

fn store_stage<'a>(
    storage: &'a dyn Storage,
    object_id: &'a str,
    progress: Option<&'a ProgressFn>,
) -> Stage<'a> {
    Stage::new("store", move |inp, _| {
        let inp = inp.expect("store stage reads from the pipeline");
        let mut reader = ProgressReader::new(inp, "store", progress);
        storage.upload(
            &data_key_for(object_id),
            &mut reader,
            DEFAULT_CONTENT_TYPE,
            &HashMap::new(),
        )
    })
}
