//! Content-hash change detection. MD5 is a change detector here, not a
//! security primitive: see the data model's `content_hash` field.

/// Digest of file bytes, used solely to decide whether a file's chunks need
/// to be recomputed.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_hash() {
        assert_eq!(content_hash(b"hello"), content_hash(b"hello"));
    }

    #[test]
    fn different_bytes_different_hash() {
        assert_ne!(content_hash(b"hello"), content_hash(b"world"));
    }

    #[test]
    fn empty_bytes_hash_is_stable() {
        assert_eq!(content_hash(b""), content_hash(b""));
    }
}
