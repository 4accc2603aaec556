//! Per-response script nonces.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;

use crate::error::{SecurityError, SecurityResult};

/// Raw nonce length in bytes.
pub const NONCE_LENGTH: usize = 16;

fn nonce_shape() -> &'static Regex {
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    // 16 bytes encode to 22 significant characters plus two padding bytes.
    SHAPE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/]{22}==$").expect("static nonce pattern"))
}

/// Check that `value` looks like a base64-encoded 16 byte nonce.
pub fn validate_nonce(value: &str) -> bool {
    nonce_shape().is_match(value)
}

/// A single-use token. Deliberately not `Clone`.
#[derive(Debug, PartialEq, Eq)]
pub struct Nonce(String);

impl Nonce {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The CSP source expression, `'nonce-<value>'`.
    pub fn source_expression(&self) -> String {
        format!("'nonce-{}'", self.0)
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces fresh nonces from the operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonceGenerator;

impl NonceGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self) -> SecurityResult<Nonce> {
        let mut bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        let encoded = STANDARD.encode(bytes);
        if !validate_nonce(&encoded) {
            return Err(SecurityError::Validation(format!(
                "generated nonce has unexpected shape: {} chars",
                encoded.len()
            )));
        }
        Ok(Nonce(encoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_nonce_shape() {
        let nonce = NonceGenerator::new().generate().unwrap();
        assert_eq!(nonce.as_str().len(), 24);
        assert!(validate_nonce(nonce.as_str()));
        assert_eq!(STANDARD.decode(nonce.as_str()).unwrap().len(), NONCE_LENGTH);
        assert!(nonce.source_expression().starts_with("'nonce-"));
    }

    #[test]
    fn test_nonces_are_not_reused() {
        let generator = NonceGenerator::new();
        let seen: HashSet<String> = (0..256)
            .map(|_| generator.generate().unwrap().into_inner())
            .collect();
        assert_eq!(seen.len(), 256);
    }

    #[test]
    fn test_validate_rejects_malformed() {
        assert!(!validate_nonce(""));
        assert!(!validate_nonce("short=="));
        assert!(!validate_nonce("AAAAAAAAAAAAAAAAAAAAAAAA"));
        assert!(!validate_nonce("AAAAAAAAAAAAAAAAAAAAA-==")); // url-safe alphabet
    }
}
