use sha2::{Digest, Sha256};

/// Computes SHA-256 and returns the 32-byte digest value.
pub fn sha256_32(input: &[u8]) -> [u8; 32] {
    Sha256::digest(input).into()
}

#[cfg(test)]
mod tests {
    use super::sha256_32;

    #[test]
    fn hash_is_deterministic() {
        let input = b"dvb";
        assert_eq!(sha256_32(input), sha256_32(input));
    }

    #[test]
    fn hash_changes_when_input_changes() {
        assert_ne!(sha256_32(b"dvb-a"), sha256_32(b"dvb-b"));
    }

    #[test]
    fn hash_of_empty_input_matches_known_digest() {
        assert_eq!(
            hex::encode(sha256_32(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
