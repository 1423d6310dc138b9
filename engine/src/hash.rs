//! Content addressing compatible with git blob ids.
//!
//! A blob id is the SHA-1 of `"blob " + <byte length> + "\0"` followed by the
//! raw bytes, rendered as lowercase hex. Recomputing it locally lets the
//! differ compare local content against remote-reported hashes without any
//! network round-trip.

use crate::{error::Result, Error, Hash};
use sha1::{Digest, Sha1};

/// Length of a hex-encoded blob id.
pub const HASH_HEX_LEN: usize = 40;

/// Compute the git blob id of `content`.
pub fn blob_hash(content: &[u8]) -> Hash {
    let mut hasher = Sha1::new();
    hasher.update(b"blob ");
    hasher.update(content.len().to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Check that `content` stored at `path` still hashes to `expected`.
pub fn verify(path: &str, content: &[u8], expected: &str) -> Result<()> {
    let actual = blob_hash(content);
    if actual != expected {
        return Err(Error::HashMismatch {
            path: path.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Whether `hash` looks like a lowercase hex blob id.
pub fn is_blob_hash(hash: &str) -> bool {
    hash.len() == HASH_HEX_LEN
        && hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blob_matches_git() {
        assert_eq!(blob_hash(b""), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn text_blob_matches_git() {
        // git hash-object <(printf 'hello world\n')
        assert_eq!(
            blob_hash(b"hello world\n"),
            "3b18e512dba79e4c8300dd08aeb37f8e728b8dad"
        );
    }

    #[test]
    fn hash_is_stable() {
        let content = vec![0u8, 1, 2, 3, 255];
        assert_eq!(blob_hash(&content), blob_hash(&content));
    }

    #[test]
    fn header_length_is_part_of_digest() {
        // Same prefix bytes, different lengths, must not collide.
        assert_ne!(blob_hash(b"abc"), blob_hash(b"abcd"));
    }

    #[test]
    fn verify_detects_mismatch() {
        let hash = blob_hash(b"one");
        assert!(verify("a.json", b"one", &hash).is_ok());

        let err = verify("a.json", b"two", &hash).unwrap_err();
        assert!(matches!(err, Error::HashMismatch { ref path, .. } if path == "a.json"));
    }

    #[test]
    fn blob_hash_shape() {
        let hash = blob_hash(b"anything");
        assert!(is_blob_hash(&hash));
        assert!(!is_blob_hash("ABC"));
        assert!(!is_blob_hash(&hash.to_uppercase()));
    }
}
