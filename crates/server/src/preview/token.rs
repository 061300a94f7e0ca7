use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

const TOKEN_BYTES: usize = 32;

/// Per-instance bearer secret gating every preview request.
///
/// Minted at server construction, held only in memory, and wiped when the
/// instance is dropped. The wire form is lowercase hex, 64 ASCII chars.
pub struct AccessToken {
    bytes: [u8; TOKEN_BYTES],
}

impl AccessToken {
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Hex form carried in `?token=` and `Authorization: Bearer`.
    #[must_use]
    pub fn as_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Constant-time check of a presented credential.
    ///
    /// Inputs of the wrong length are still run through the comparison
    /// primitive against a dummy of matching length, keeping the code path
    /// uniform regardless of input shape.
    #[must_use]
    pub fn verify(&self, presented: &str) -> bool {
        let expected = self.as_hex();
        let expected = expected.as_bytes();
        let presented = presented.as_bytes();
        if presented.len() == expected.len() {
            bool::from(presented.ct_eq(expected))
        } else {
            let dummy = vec![0u8; presented.len()];
            let _ = presented.ct_eq(&dummy);
            false
        }
    }
}

impl Drop for AccessToken {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The secret must never reach logs.
        f.write_str("AccessToken(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_form_is_64_hex_chars() {
        let token = AccessToken::generate();
        let hex = token.as_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn verify_accepts_own_credential() {
        let token = AccessToken::generate();
        assert!(token.verify(&token.as_hex()));
    }

    #[test]
    fn verify_rejects_foreign_and_malformed_credentials() {
        let token = AccessToken::generate();
        let other = AccessToken::generate();
        assert!(!token.verify(&other.as_hex()));
        assert!(!token.verify(""));
        assert!(!token.verify("deadbeef"));
        let mut truncated = token.as_hex();
        truncated.pop();
        assert!(!token.verify(&truncated));
    }

    #[test]
    fn tokens_are_unique_per_instance() {
        assert_ne!(AccessToken::generate().as_hex(), AccessToken::generate().as_hex());
    }

    #[test]
    fn debug_never_prints_the_secret() {
        let token = AccessToken::generate();
        let rendered = format!("{token:?}");
        assert!(!rendered.contains(&token.as_hex()));
    }
}
