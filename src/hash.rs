//! Privacy utility for error telemetry (spec.md §9: hash user ids and phone
//! numbers before they land in error-reporting context).

use sha2::{Digest, Sha256};

pub fn hash_identifier(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_hashes_the_same() {
        assert_eq!(hash_identifier("+15551234567"), hash_identifier("+15551234567"));
    }

    #[test]
    fn different_inputs_hash_differently() {
        assert_ne!(hash_identifier("user-a"), hash_identifier("user-b"));
    }
}
