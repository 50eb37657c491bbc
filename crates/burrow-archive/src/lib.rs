//! burrow-archive: the byte-shaping stages of the pipeline
//!
//! `tar` turns a file or directory tree into a byte stream and back;
//! `compress` optionally squeezes that stream through zstd, deciding for
//! itself when compression is worth it.

pub mod compress;
pub mod tar;

pub use compress::{decompress, CompressMode, Compressor, CompressorConfig, CompressReport};
pub use tar::{extract_tar, stream_tar, TarOptions};
