//! # acp-auth
//!
//! Challenge/response sign-in against an authority server.
//!
//! [`AuthClient`] performs the two-phase `/sign_in` exchange, verifies the
//! server's certificate chain when one is presented, and stores the opaque
//! signature token every subsequent transport authenticates with. One
//! `AuthClient` may be shared by every transport talking to the same server
//! so the token is only negotiated once.

pub mod keys;
pub mod verify;

use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use pkcs8::{EncodePublicKey, LineEnding};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use acp_core::errors::AuthError;
use acp_core::paths::IdentityPaths;
use acp_core::retry::linear_backoff;

/// Connect timeout for control-plane HTTP calls.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Total timeout for control-plane HTTP calls.
const HTTP_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Sign-in linear backoff step.
const SIGN_IN_BACKOFF_STEP: Duration = Duration::from_secs(2);
/// Sign-in backoff cap.
const SIGN_IN_BACKOFF_CAP: Duration = Duration::from_secs(30);

fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_u64().and_then(|v| u32::try_from(v).ok())),
        Some(Value::String(s)) => Ok(s.parse().ok()),
        Some(_) => Ok(None),
    }
}

/// Endpoint and credential material returned by a successful sign-in.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SignInInfo {
    /// The opaque runtime signature token.
    #[serde(default)]
    pub signature: Option<String>,
    /// Heartbeat server IP.
    #[serde(default)]
    pub server_ip: Option<String>,
    /// Heartbeat server UDP port.
    #[serde(default, deserialize_with = "lenient_u32")]
    pub port: Option<u32>,
    /// Cookie echoed in every heartbeat record.
    #[serde(default, deserialize_with = "lenient_u32")]
    pub sign_cookie: Option<u32>,
    /// Heartbeat server root URL.
    #[serde(default)]
    pub heartbeat_server: Option<String>,
    /// Message server root URL.
    #[serde(default)]
    pub message_server: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    cert: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct ChallengeRequest<'a> {
    agent_id: &'a str,
    request_id: &'a str,
}

#[derive(Serialize)]
struct ConfirmRequest<'a> {
    agent_id: &'a str,
    request_id: &'a str,
    nonce: &'a str,
    public_key: &'a str,
    cert: &'a str,
    signature: &'a str,
}

/// Per-agent online flag returned by the online-state query.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct OnlineState {
    /// The queried identity.
    pub agent_id: String,
    /// Whether the authority currently sees it online.
    #[serde(default)]
    pub online: bool,
}

#[derive(Deserialize)]
struct OnlineStateResponse {
    #[serde(default)]
    data: Vec<OnlineState>,
}

/// Challenge/response sign-in client for one authority server.
pub struct AuthClient {
    agent_id: String,
    server_url: String,
    paths: IdentityPaths,
    passphrase: String,
    http: reqwest::Client,
    signature: RwLock<Option<String>>,
    signing_key: Mutex<Option<p256::ecdsa::SigningKey>>,
}

impl AuthClient {
    /// Create a client for `server_url`; no network traffic until
    /// [`sign_in`](Self::sign_in).
    #[must_use]
    pub fn new(agent_id: &str, server_url: &str, paths: IdentityPaths, passphrase: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_TOTAL_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .user_agent(format!("AgentCP (AuthClient; {agent_id})"))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            agent_id: agent_id.to_owned(),
            server_url: server_url.trim_end_matches('/').to_owned(),
            paths,
            passphrase: passphrase.to_owned(),
            http,
            signature: RwLock::new(None),
            signing_key: Mutex::new(None),
        }
    }

    /// The server this client signs in against.
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// The runtime signature token, if signed in.
    #[must_use]
    pub fn signature(&self) -> Option<String> {
        self.signature.read().clone()
    }

    /// Drop the cached token (forces a fresh sign-in next time).
    pub fn clear_signature(&self) {
        *self.signature.write() = None;
    }

    fn load_key(&self) -> Result<p256::ecdsa::SigningKey, AuthError> {
        let mut guard = self.signing_key.lock();
        if let Some(key) = guard.as_ref() {
            return Ok(key.clone());
        }
        let key = keys::load_signing_key(&self.paths.key_path(), &self.passphrase, &self.agent_id)?;
        *guard = Some(key.clone());
        Ok(key)
    }

    /// Sign in, retrying transient failures up to `max_retries` times with
    /// linear backoff (2 s × attempt, capped at 30 s).
    ///
    /// Bad-chain and bad-credential failures abort immediately; they will
    /// not heal by retrying.
    pub async fn sign_in(&self, max_retries: u32) -> Result<SignInInfo, AuthError> {
        for attempt in 0..=max_retries {
            if attempt > 0 {
                let wait = linear_backoff(attempt, SIGN_IN_BACKOFF_STEP, SIGN_IN_BACKOFF_CAP);
                info!(
                    agent_id = %self.agent_id,
                    attempt,
                    wait_secs = wait.as_secs(),
                    "sign-in retry"
                );
                tokio::time::sleep(wait).await;
            }
            match self.sign_in_once().await {
                Ok(info) => return Ok(info),
                Err(e) if e.severity == acp_core::errors::Severity::Transient => {
                    warn!(agent_id = %self.agent_id, attempt, error = %e, "sign-in attempt failed");
                }
                Err(e) => return Err(e),
            }
        }
        error!(agent_id = %self.agent_id, "sign-in failed after all retries");
        Err(AuthError::retries_exhausted(&self.agent_id, max_retries))
    }

    async fn sign_in_once(&self) -> Result<SignInInfo, AuthError> {
        let url = format!("{}/sign_in", self.server_url);
        let request_id = Uuid::new_v4().simple().to_string();

        let challenge: ChallengeResponse = self
            .post_json(
                &url,
                &ChallengeRequest {
                    agent_id: &self.agent_id,
                    request_id: &request_id,
                },
            )
            .await?;

        if let Some(err) = challenge.error {
            return Err(AuthError::network(
                &self.agent_id,
                format!("sign-in rejected: {err}"),
            ));
        }
        let Some(nonce) = challenge.nonce else {
            return Err(AuthError::network(&self.agent_id, "sign-in response had no nonce"));
        };

        // Verify the server's identity when it presents one.
        if let (Some(cert), Some(signature)) = (&challenge.cert, &challenge.signature) {
            verify::verify_server_signature(cert, &self.agent_id, &request_id, signature)?;
            verify::verify_chain(
                &self.http,
                cert,
                &self.paths.ca_root_cert_path(),
                &self.agent_id,
            )
            .await?;
        }

        let key = self.load_key()?;
        let public_key_pem = key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| {
                AuthError::bad_credentials(&self.agent_id, format!("cannot encode public key: {e}"))
            })?;
        let cert_pem = std::fs::read_to_string(self.paths.cert_path()).map_err(|e| {
            AuthError::bad_credentials(&self.agent_id, format!("cannot read certificate: {e}"))
                .with_source(e)
        })?;
        let nonce_signature = keys::sign_nonce(&key, &nonce);

        let info: SignInInfo = self
            .post_json(
                &url,
                &ConfirmRequest {
                    agent_id: &self.agent_id,
                    request_id: &request_id,
                    nonce: &nonce,
                    public_key: &public_key_pem,
                    cert: &cert_pem,
                    signature: &nonce_signature,
                },
            )
            .await?;

        let Some(token) = info.signature.clone() else {
            return Err(AuthError::network(
                &self.agent_id,
                "sign-in confirmation carried no signature token",
            ));
        };
        *self.signature.write() = Some(token);
        info!(agent_id = %self.agent_id, server = %self.server_url, "sign-in successful");
        Ok(info)
    }

    /// Best-effort sign-out; errors are logged, never returned.
    pub async fn sign_out(&self) {
        let Some(signature) = self.signature() else {
            return;
        };
        let url = format!("{}/sign_out", self.server_url);
        let body = serde_json::json!({
            "agent_id": self.agent_id,
            "signature": signature,
        });
        match self.http.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!(agent_id = %self.agent_id, "signed out");
            }
            Ok(response) => {
                warn!(agent_id = %self.agent_id, status = %response.status(), "sign-out rejected");
            }
            Err(e) => warn!(agent_id = %self.agent_id, error = %e, "sign-out failed"),
        }
        self.clear_signature();
    }

    /// Query the authority for the online state of `agents`.
    pub async fn query_online_state(
        &self,
        agents: &[String],
    ) -> Result<Vec<OnlineState>, AuthError> {
        let Some(signature) = self.signature() else {
            return Err(AuthError::network(&self.agent_id, "not signed in"));
        };
        let url = format!("{}/query_online_state", self.server_url);
        let body = serde_json::json!({
            "agent_id": self.agent_id,
            "signature": signature,
            "agents": agents.join(";"),
        });
        let response: OnlineStateResponse = self.post_json(&url, &body).await?;
        Ok(response.data)
    }

    async fn post_json<B, R>(&self, url: &str, body: &B) -> Result<R, AuthError>
    where
        B: Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| AuthError::network(&self.agent_id, format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AuthError::network(
                &self.agent_id,
                format!("{url}: status {status}: {text}"),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| AuthError::network(&self.agent_id, format!("{url}: bad body: {e}")))
    }
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("agent_id", &self.agent_id)
            .field("server_url", &self.server_url)
            .field("signed_in", &self.signature.read().is_some())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
