//! Per-identity filesystem layout and passphrase derivation.
//!
//! ```text
//! <app>/AIDs/<id>/public/      published profile, HTML, config
//! <app>/AIDs/<id>/private/     databases, proxy config JSON
//! <app>/Certs/root/            pinned CA root
//! <certdir>/<id>.key           encrypted private key
//! <certdir>/<id>.crt           certificate
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::errors::{AcpError, PersistenceError};

/// Resolved filesystem locations for one identity.
#[derive(Clone, Debug)]
pub struct IdentityPaths {
    /// Application root directory.
    pub app_root: PathBuf,
    /// Published profile / HTML / config directory.
    pub public_dir: PathBuf,
    /// Databases and private config directory.
    pub private_dir: PathBuf,
    /// Pinned CA root directory.
    pub ca_root_dir: PathBuf,
    /// Credential directory holding `<id>.key` / `<id>.crt`.
    pub cert_dir: PathBuf,
    /// The identity the paths belong to.
    pub agent_id: String,
}

impl IdentityPaths {
    /// Resolve the layout under `app_root` for `agent_id`, with credentials
    /// in `cert_dir`.
    #[must_use]
    pub fn new(app_root: impl Into<PathBuf>, cert_dir: impl Into<PathBuf>, agent_id: &str) -> Self {
        let app_root = app_root.into();
        let aid_dir = app_root.join("AIDs").join(agent_id);
        Self {
            public_dir: aid_dir.join("public"),
            private_dir: aid_dir.join("private"),
            ca_root_dir: app_root.join("Certs").join("root"),
            cert_dir: cert_dir.into(),
            agent_id: agent_id.to_owned(),
            app_root,
        }
    }

    /// Create every directory in the layout.
    pub fn ensure_directories(&self) -> Result<(), AcpError> {
        for dir in [
            &self.public_dir,
            &self.private_dir,
            &self.ca_root_dir,
            &self.cert_dir,
        ] {
            fs::create_dir_all(dir).map_err(|e| {
                PersistenceError::new(dir.display().to_string(), "mkdir", e.to_string())
                    .with_source(e)
            })?;
        }
        Ok(())
    }

    /// Path of the encrypted private key.
    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(format!("{}.key", self.agent_id))
    }

    /// Path of the identity certificate.
    #[must_use]
    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(format!("{}.crt", self.agent_id))
    }

    /// Path of the pinned CA root certificate.
    #[must_use]
    pub fn ca_root_cert_path(&self) -> PathBuf {
        self.ca_root_dir.join("root.crt")
    }

    /// Path of the per-identity message/session database.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.private_dir.join("agent.db")
    }

    /// Path of the metrics time-series database.
    #[must_use]
    pub fn metrics_db_path(&self) -> PathBuf {
        self.private_dir.join("metrics_timeseries.db")
    }

    /// Path of the periodically synced metrics summary JSON.
    #[must_use]
    pub fn metrics_json_path(&self) -> PathBuf {
        self.private_dir.join("metrics.json")
    }

    /// Path of the per-identity proxy configuration JSON.
    #[must_use]
    pub fn proxy_config_path(&self) -> PathBuf {
        self.private_dir.join("proxy_config.json")
    }
}

/// Derive the key-file passphrase from the user seed: hex SHA-256.
#[must_use]
pub fn seed_passphrase(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Whether a URL points at the local host (proxies are always bypassed).
#[must_use]
pub fn is_local_url(url: &str) -> bool {
    let host = url
        .split("://")
        .nth(1)
        .unwrap_or(url)
        .split(['/', ':'])
        .next()
        .unwrap_or("");
    matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1" | "0.0.0.0")
}

/// Does `path` exist and is a regular file.
#[must_use]
pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
