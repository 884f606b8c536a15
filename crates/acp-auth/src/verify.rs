//! Server certificate verification.
//!
//! The sign-in response may carry the server's certificate and a signature
//! over `lower(agent_id + request_id)`. The signature is checked against the
//! certificate's public key, then the certificate chain is walked: the
//! Authority-Information-Access CA-Issuers URL is fetched and the issuer's
//! key must verify the leaf, recursing upward. A certificate without an AIA
//! extension must verify against the pinned CA root on disk. Issuer URLs
//! that verified once are cached process-wide.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use pkcs8::DecodePublicKey;
use tracing::{debug, info, warn};
use x509_parser::oid_registry::OID_PKIX_ACCESS_DESCRIPTOR_CA_ISSUERS;
use x509_parser::prelude::*;

use acp_core::errors::AuthError;

use crate::keys::hex_decode;

/// Maximum chain length walked before giving up.
const MAX_CHAIN_DEPTH: usize = 4;

fn verified_issuers() -> &'static Mutex<HashSet<String>> {
    static CACHE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Test hook: forget all cached issuer URLs.
pub fn clear_issuer_cache() {
    verified_issuers().lock().expect("issuer cache poisoned").clear();
}

fn parse_cert_der(pem_text: &str, agent_id: &str) -> Result<Vec<u8>, AuthError> {
    let block = ::pem::parse(pem_text)
        .map_err(|e| AuthError::bad_chain(agent_id, format!("bad certificate PEM: {e}")))?;
    Ok(block.into_contents())
}

fn verifying_key_of(cert: &X509Certificate<'_>, agent_id: &str) -> Result<VerifyingKey, AuthError> {
    VerifyingKey::from_public_key_der(cert.public_key().raw)
        .map_err(|e| AuthError::bad_chain(agent_id, format!("unsupported public key: {e}")))
}

fn verify_cert_signed_by(
    cert: &X509Certificate<'_>,
    issuer_key: &VerifyingKey,
    agent_id: &str,
) -> Result<(), AuthError> {
    let signature = Signature::from_der(cert.signature_value.as_ref())
        .map_err(|e| AuthError::bad_chain(agent_id, format!("bad certificate signature: {e}")))?;
    issuer_key
        .verify(cert.tbs_certificate.as_ref(), &signature)
        .map_err(|_| AuthError::bad_chain(agent_id, "certificate signature does not verify"))
}

fn ca_issuers_url(cert: &X509Certificate<'_>) -> Option<String> {
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                if desc.access_method != OID_PKIX_ACCESS_DESCRIPTOR_CA_ISSUERS {
                    continue;
                }
                if let GeneralName::URI(uri) = &desc.access_location {
                    return Some((*uri).to_owned());
                }
            }
        }
    }
    None
}

/// Verify the server's challenge signature with the leaf certificate's key.
///
/// The signed payload is `lowercase(agent_id + request_id)`.
pub fn verify_server_signature(
    cert_pem: &str,
    agent_id: &str,
    request_id: &str,
    signature_hex: &str,
) -> Result<(), AuthError> {
    let der = parse_cert_der(cert_pem, agent_id)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| AuthError::bad_chain(agent_id, format!("bad certificate DER: {e}")))?;
    let key = verifying_key_of(&cert, agent_id)?;

    let payload = format!("{agent_id}{request_id}").to_lowercase();
    let sig_bytes = hex_decode(signature_hex)?;
    let signature = Signature::from_der(&sig_bytes)
        .map_err(|e| AuthError::bad_chain(agent_id, format!("bad server signature: {e}")))?;
    key.verify(payload.as_bytes(), &signature)
        .map_err(|_| AuthError::bad_chain(agent_id, "server signature does not verify"))?;
    debug!(agent_id, "server signature verified");
    Ok(())
}

/// Walk the certificate chain starting at `cert_pem`.
///
/// Each link fetches the issuer certificate from the AIA URL and checks the
/// current certificate against the issuer's key; a certificate without an
/// AIA extension is checked against the pinned root at `ca_root_path`.
pub async fn verify_chain(
    http: &reqwest::Client,
    cert_pem: &str,
    ca_root_path: &Path,
    agent_id: &str,
) -> Result<(), AuthError> {
    let mut current_der = parse_cert_der(cert_pem, agent_id)?;

    for depth in 0..MAX_CHAIN_DEPTH {
        let (_, cert) = X509Certificate::from_der(&current_der)
            .map_err(|e| AuthError::bad_chain(agent_id, format!("bad certificate DER: {e}")))?;

        let Some(issuer_url) = ca_issuers_url(&cert) else {
            // End of the AIA chain; the pinned root must vouch for it.
            let root_pem = std::fs::read_to_string(ca_root_path).map_err(|e| {
                AuthError::bad_chain(agent_id, format!("pinned CA root unreadable: {e}"))
                    .with_source(e)
            })?;
            let root_der = parse_cert_der(&root_pem, agent_id)?;
            let (_, root) = X509Certificate::from_der(&root_der)
                .map_err(|e| AuthError::bad_chain(agent_id, format!("bad CA root DER: {e}")))?;
            let root_key = verifying_key_of(&root, agent_id)?;
            verify_cert_signed_by(&cert, &root_key, agent_id)?;
            info!(agent_id, depth, "certificate chain anchored at pinned root");
            return Ok(());
        };

        {
            let cache = verified_issuers().lock().expect("issuer cache poisoned");
            if cache.contains(&issuer_url) {
                debug!(issuer_url, "issuer previously verified, skipping download");
                return Ok(());
            }
        }

        let response = http.get(&issuer_url).send().await.map_err(|e| {
            warn!(issuer_url, error = %e, "issuer certificate download failed");
            AuthError::bad_chain(agent_id, format!("issuer download failed: {e}"))
        })?;
        let issuer_pem = response
            .error_for_status()
            .map_err(|e| AuthError::bad_chain(agent_id, format!("issuer download failed: {e}")))?
            .text()
            .await
            .map_err(|e| AuthError::bad_chain(agent_id, format!("issuer body unreadable: {e}")))?;

        let issuer_der = parse_cert_der(&issuer_pem, agent_id)?;
        let (_, issuer) = X509Certificate::from_der(&issuer_der)
            .map_err(|e| AuthError::bad_chain(agent_id, format!("bad issuer DER: {e}")))?;
        let issuer_key = verifying_key_of(&issuer, agent_id)?;
        verify_cert_signed_by(&cert, &issuer_key, agent_id)?;

        {
            let mut cache = verified_issuers().lock().expect("issuer cache poisoned");
            let _ = cache.insert(issuer_url.clone());
        }
        info!(issuer_url, depth, "issuer verified");

        current_der = issuer_der;
    }

    Err(AuthError::bad_chain(agent_id, "certificate chain too deep"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_pem_is_chain_error() {
        let err =
            verify_server_signature("not a pem", "a.corp.example", "r1", "00").unwrap_err();
        assert_eq!(err.code, "AUTH_CHAIN_ERROR");
    }

    #[test]
    fn issuer_cache_insert_and_clear() {
        clear_issuer_cache();
        {
            let mut cache = verified_issuers().lock().unwrap();
            let _ = cache.insert("https://ca.example/issuer.crt".to_owned());
        }
        assert!(
            verified_issuers()
                .lock()
                .unwrap()
                .contains("https://ca.example/issuer.crt")
        );
        clear_issuer_cache();
        assert!(verified_issuers().lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn chain_without_root_file_fails() {
        // A syntactically valid PEM wrapping non-certificate DER still fails
        // before any filesystem access.
        let bogus = pem::Pem::new("CERTIFICATE", vec![0u8; 8]);
        let pem_text = pem::encode(&bogus);
        let http = reqwest::Client::new();
        let err = verify_chain(
            &http,
            &pem_text,
            Path::new("/nonexistent/root.crt"),
            "a.corp.example",
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, "AUTH_CHAIN_ERROR");
    }
}
