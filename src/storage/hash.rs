use sha2::{Digest, Sha256};

pub struct HashUtils;

impl HashUtils {
    /// Hex SHA-256 of `data`, used to correlate served and fetched files in
    /// the logs.
    pub fn hash_data(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            HashUtils::hash_data(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
