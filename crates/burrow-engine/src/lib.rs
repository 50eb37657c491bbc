//! burrow-engine: wires the stages together
//!
//! A transfer is a linear pipeline of stages, each on its own thread,
//! connected by bounded in-memory byte pipes. The first stage reads from its
//! own source (filesystem or object store) and the last writes to its own
//! sink; everything between transforms bytes in flight. The first error from
//! any stage poisons every pipe and cancels the run.

pub mod download;
pub mod pipeline;
pub mod progress;
pub mod upload;

pub use download::{download, DownloadOutcome};
pub use pipeline::{pipe, run_pipeline, PipeReader, PipeWriter, Stage};
pub use progress::ProgressFn;
pub use upload::{upload, UploadOutcome};

/// Storage key of the encrypted blob for an object.
pub fn data_key_for(object_id: &str) -> String {
    format!("data/{object_id}.enc")
}

/// Storage key of the sealed envelope for an object.
pub fn envelope_key_for(object_id: &str) -> String {
    format!("keys/{object_id}.envelope")
}
