use sha2::{Digest, Sha256};
use std::io::Read;

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn sha256_string(data: &str) -> String {
    sha256_bytes(data.as_bytes())
}

/// Hash everything a reader yields, returning the hex digest and byte count
pub fn sha256_reader<R: Read>(mut reader: R) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut reader, &mut hasher)?;
    Ok((hex::encode(hasher.finalize()), size))
}

/// `sha256:<hex>` form used for diff IDs, image IDs and blob digests
pub fn prefixed(hex: &str) -> String {
    format!("sha256:{}", hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256_string("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_reader_matches_bytes() {
        let data = b"layer content".to_vec();
        let (hex, size) = sha256_reader(&data[..]).unwrap();
        assert_eq!(hex, sha256_bytes(&data));
        assert_eq!(size, data.len() as u64);
    }
}
