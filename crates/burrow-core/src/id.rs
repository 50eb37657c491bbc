//! Object-id generation
//!
//! Every upload gets a fresh ULID: 26 characters, Crockford base32,
//! lexicographically sortable, millisecond time-ordered. The id doubles as
//! the HKDF salt, part of the AEAD associated data, and the storage key
//! basename, so it must never be reused across uploads.

use ulid::Ulid;

/// Generate a fresh object id for an upload session.
pub fn new_object_id() -> String {
    Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_shape() {
        let id = new_object_id();
        assert_eq!(id.len(), 26);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_object_ids_unique() {
        let a = new_object_id();
        let b = new_object_id();
        assert_ne!(a, b, "ids must be unique per upload");
    }

    #[test]
    fn test_object_ids_sortable() {
        let a = new_object_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_object_id();
        assert!(a < b, "later ids must sort after earlier ones");
    }
}
