//! burrow-core: shared types for the burrow backup tool
//!
//! Home of the error taxonomy, the passphrase-sealed configuration store,
//! and object-id generation. Everything else in the workspace builds on
//! these.

pub mod config;
pub mod error;
pub mod id;

pub use config::Config;
pub use error::{BurrowError, BurrowResult};
pub use id::new_object_id;

/// Size of the master key stored in the config, in bytes.
pub const MASTER_KEY_SIZE: usize = 64;
