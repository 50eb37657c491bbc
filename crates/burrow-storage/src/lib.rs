//! burrow-storage: the object-store boundary
//!
//! The pipeline only ever sees the [`Storage`] trait — four blocking,
//! streaming operations with typed errors carrying the object key. The
//! production implementation wraps an OpenDAL S3 operator; tests wrap the
//! OpenDAL memory service through the same type.

pub mod operator;

use std::collections::HashMap;
use std::io::{Read, Write};

use burrow_core::BurrowResult;

pub use operator::{s3_operator, OpendalStorage, S3Config};

/// Default content type for uploaded objects.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    /// Backend-reported timestamp, empty when not available.
    pub last_modified: String,
    pub etag: String,
}

/// A pluggable object-store backend.
///
/// Retries, multi-part uploads, and pagination are the implementation's
/// concern; callers see one streaming call per object.
pub trait Storage: Send + Sync {
    /// Stream `body` to the object under `key`. An empty `content_type`
    /// selects [`DEFAULT_CONTENT_TYPE`]; `metadata` is attached best-effort.
    fn upload(
        &self,
        key: &str,
        body: &mut dyn Read,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> BurrowResult<()>;

    /// Stream the object under `key` into `out`. Returns the stored content
    /// type and metadata.
    fn download(
        &self,
        key: &str,
        out: &mut dyn Write,
    ) -> BurrowResult<(String, HashMap<String, String>)>;

    /// Head-only metadata fetch.
    fn get_metadata(&self, key: &str) -> BurrowResult<HashMap<String, String>>;

    /// List objects under `prefix`.
    fn list(&self, prefix: &str) -> BurrowResult<Vec<ObjectInfo>>;
}
