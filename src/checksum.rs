use sha2::{Digest, Sha256};

/// Content digest used for quick equality checks between local and server
/// state. 16 hex chars of SHA-256, the observed server convention.
pub fn checksum_bytes(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let hex = hex_encode(&digest);
    hex[..16].to_string()
}

pub fn checksum_str(data: &str) -> String {
    checksum_bytes(data.as_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_sixteen_hex_chars() {
        let sum = checksum_str("hello world");
        assert_eq!(sum.len(), 16);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn checksum_is_deterministic_and_content_sensitive() {
        let a = checksum_str("alpha");
        let b = checksum_str("alpha");
        let c = checksum_str("beta");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn checksum_matches_known_sha256_prefix() {
        // sha256("") = e3b0c44298fc1c14...
        assert_eq!(checksum_bytes(b""), "e3b0c44298fc1c14");
    }
}
