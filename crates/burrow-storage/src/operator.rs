//! OpenDAL-backed storage implementation
//!
//! The S3 operator targets Backblaze B2's S3-compatible endpoint by default
//! and carries logging and jittered-retry layers; retry policy lives here,
//! below the `Storage` trait, so pipeline stages never retry on their own.
//!
//! OpenDAL's S3 service is async-only, so `OpendalStorage` owns a small
//! multi-thread tokio runtime and bridges each trait call with `block_on`.
//! Every call runs on a dedicated pipeline thread, never inside another
//! runtime.

use std::collections::HashMap;
use std::io::{Read, Write};

use opendal::Operator;

use burrow_core::{BurrowError, BurrowResult};

use crate::{ObjectInfo, Storage, DEFAULT_CONTENT_TYPE};

/// Upload stream granularity.
const UPLOAD_CHUNK: usize = 256 * 1024;

/// Ranged-read granularity for downloads.
const DOWNLOAD_CHUNK: u64 = 8 << 20;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Config {
    /// Config for Backblaze B2's S3-compatible API in the given region.
    pub fn backblaze(key_id: &str, app_key: &str, bucket: &str, region: &str) -> Self {
        Self {
            endpoint: format!("https://s3.{region}.backblazeb2.com"),
            region: region.to_owned(),
            bucket: bucket.to_owned(),
            access_key_id: key_id.to_owned(),
            secret_access_key: app_key.to_owned(),
        }
    }
}

/// Build the production S3 operator.
pub fn s3_operator(cfg: &S3Config) -> BurrowResult<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    let op = Operator::new(builder)
        .map_err(|e| BurrowError::Config(format!("creating S3 operator: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Blocking [`Storage`] over any OpenDAL operator.
pub struct OpendalStorage {
    op: Operator,
    rt: tokio::runtime::Runtime,
}

impl OpendalStorage {
    pub fn new(op: Operator) -> BurrowResult<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| BurrowError::Config(format!("storage runtime: {e}")))?;
        Ok(Self { op, rt })
    }

    /// In-memory backend used by tests and dry runs.
    pub fn memory() -> BurrowResult<Self> {
        let op = Operator::new(opendal::services::Memory::default())
            .map_err(|e| BurrowError::Config(format!("memory operator: {e}")))?
            .finish();
        Self::new(op)
    }
}

impl Storage for OpendalStorage {
    fn upload(
        &self,
        key: &str,
        body: &mut dyn Read,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> BurrowResult<()> {
        let content_type = if content_type.is_empty() {
            DEFAULT_CONTENT_TYPE
        } else {
            content_type
        };

        self.rt.block_on(async {
            // Content type and user metadata are best-effort: only forwarded
            // when the backend advertises the capability.
            let capability = self.op.info().full_capability();
            let mut writer_fut = self.op.writer_with(key);
            if capability.write_with_content_type {
                writer_fut = writer_fut.content_type(content_type);
            }
            if !metadata.is_empty() && capability.write_with_user_metadata {
                writer_fut = writer_fut.user_metadata(metadata.clone());
            }
            let mut writer = writer_fut
                .await
                .map_err(|e| BurrowError::storage(key, e))?;

            let mut buf = vec![0u8; UPLOAD_CHUNK];
            let mut total: u64 = 0;
            loop {
                let n = body
                    .read(&mut buf)
                    .map_err(|e| BurrowError::storage(key, e))?;
                if n == 0 {
                    break;
                }
                writer
                    .write(buf[..n].to_vec())
                    .await
                    .map_err(|e| BurrowError::storage(key, e))?;
                total += n as u64;
            }
            writer
                .close()
                .await
                .map_err(|e| BurrowError::storage(key, e))?;
            tracing::debug!(key, bytes = total, "uploaded object");
            Ok(())
        })
    }

    fn download(
        &self,
        key: &str,
        out: &mut dyn Write,
    ) -> BurrowResult<(String, HashMap<String, String>)> {
        self.rt.block_on(async {
            let meta = self
                .op
                .stat(key)
                .await
                .map_err(|e| BurrowError::storage(key, e))?;
            let len = meta.content_length();

            let mut offset: u64 = 0;
            while offset < len {
                let end = (offset + DOWNLOAD_CHUNK).min(len);
                let buffer = self
                    .op
                    .read_with(key)
                    .range(offset..end)
                    .await
                    .map_err(|e| BurrowError::storage(key, e))?;
                out.write_all(&buffer.to_bytes())
                    .map_err(|e| BurrowError::storage(key, e))?;
                offset = end;
            }
            tracing::debug!(key, bytes = len, "downloaded object");

            let content_type = meta
                .content_type()
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_owned();
            let metadata = meta.user_metadata().cloned().unwrap_or_default();
            Ok((content_type, metadata))
        })
    }

    fn get_metadata(&self, key: &str) -> BurrowResult<HashMap<String, String>> {
        self.rt.block_on(async {
            let meta = self
                .op
                .stat(key)
                .await
                .map_err(|e| BurrowError::storage(key, e))?;
            Ok(meta.user_metadata().cloned().unwrap_or_default())
        })
    }

    fn list(&self, prefix: &str) -> BurrowResult<Vec<ObjectInfo>> {
        self.rt.block_on(async {
            let entries = self
                .op
                .list_with(prefix)
                .recursive(true)
                .await
                .map_err(|e| BurrowError::storage(prefix, e))?;

            let mut objects = Vec::with_capacity(entries.len());
            for entry in entries {
                let meta = entry.metadata();
                if meta.mode().is_dir() {
                    continue;
                }
                objects.push(ObjectInfo {
                    key: entry.path().to_owned(),
                    size: meta.content_length(),
                    last_modified: meta
                        .last_modified()
                        .map(|t| t.to_string())
                        .unwrap_or_default(),
                    etag: meta.etag().unwrap_or_default().to_owned(),
                });
            }
            Ok(objects)
        })
    }
}
