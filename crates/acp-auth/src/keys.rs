//! Identity key material.
//!
//! The private key on disk is an encrypted PKCS#8 PEM whose passphrase is
//! the SHA-256 of the user seed. An unencrypted key is accepted as a
//! compatibility fallback.

use std::fmt::Write as _;
use std::path::Path;

use p256::ecdsa::signature::Signer;
use p256::ecdsa::{DerSignature, SigningKey};
use pkcs8::DecodePrivateKey;

use acp_core::errors::AuthError;

/// Load the identity signing key from `path`.
pub fn load_signing_key(
    path: &Path,
    passphrase: &str,
    agent_id: &str,
) -> Result<SigningKey, AuthError> {
    let pem_text = std::fs::read_to_string(path).map_err(|e| {
        AuthError::bad_credentials(agent_id, format!("cannot read key file: {e}")).with_source(e)
    })?;

    if let Ok(key) = SigningKey::from_pkcs8_encrypted_pem(&pem_text, passphrase.as_bytes()) {
        return Ok(key);
    }
    // Compatibility: keys written before encryption was introduced.
    SigningKey::from_pkcs8_pem(&pem_text).map_err(|e| {
        AuthError::bad_credentials(
            agent_id,
            "private key cannot be decrypted; check the seed matches",
        )
        .with_source(e)
    })
}

/// Sign `nonce` with ECDSA P-256 / SHA-256, returning the hex DER signature.
#[must_use]
pub fn sign_nonce(key: &SigningKey, nonce: &str) -> String {
    let signature: DerSignature = key.sign(nonce.as_bytes());
    hex_encode(signature.as_bytes())
}

/// Lowercase hex encoding.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Inverse of [`hex_encode`].
pub fn hex_decode(text: &str) -> Result<Vec<u8>, AuthError> {
    if text.len() % 2 != 0 {
        return Err(AuthError::bad_chain("", "odd-length hex signature"));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|_| AuthError::bad_chain("", "non-hex signature byte"))
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use p256::ecdsa::signature::Verifier;
    use pkcs8::{EncodePrivateKey, LineEnding};

    use super::*;

    fn fresh_key() -> SigningKey {
        SigningKey::from_slice(&[7u8; 32]).unwrap()
    }

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0x00, 0x7f, 0xff, 0x10];
        let text = hex_encode(&bytes);
        assert_eq!(text, "007fff10");
        assert_eq!(hex_decode(&text).unwrap(), bytes);
    }

    #[test]
    fn hex_decode_rejects_odd_length() {
        assert!(hex_decode("abc").is_err());
    }

    #[test]
    fn hex_decode_rejects_non_hex() {
        assert!(hex_decode("zz").is_err());
    }

    #[test]
    fn signature_verifies_with_public_key() {
        let key = fresh_key();
        let hex = sign_nonce(&key, "nonce-123");
        let der = hex_decode(&hex).unwrap();
        let signature = p256::ecdsa::Signature::from_der(&der).unwrap();
        key.verifying_key()
            .verify(b"nonce-123", &signature)
            .unwrap();
    }

    #[test]
    fn load_unencrypted_key_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.corp.example.key");
        let pem = fresh_key().to_pkcs8_pem(LineEnding::LF).unwrap();
        std::fs::write(&path, pem.as_bytes()).unwrap();

        let loaded = load_signing_key(&path, "ignored", "a.corp.example").unwrap();
        assert_eq!(loaded.to_bytes(), fresh_key().to_bytes());
    }

    #[test]
    fn load_missing_key_is_credentials_error() {
        let err = load_signing_key(Path::new("/nonexistent/x.key"), "p", "a.corp.example")
            .unwrap_err();
        assert_eq!(err.code, "AUTH_CREDENTIALS_ERROR");
    }

    #[test]
    fn load_garbage_key_is_credentials_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, "not a pem").unwrap();
        let err = load_signing_key(&path, "p", "a.corp.example").unwrap_err();
        assert_eq!(err.code, "AUTH_CREDENTIALS_ERROR");
    }
}
