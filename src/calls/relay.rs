//! Third-party media relay integration.
//!
//! Sessions are provisioned over HTTP when a call is initiated. Access
//! tokens are minted locally with the HMAC-SHA1 shared-secret mechanism
//! (the relay independently computes the same HMAC to verify them) and are
//! re-minted fresh on accept so their lifetime stays short. A relay failure
//! never fails call initiation — clients fall back to signaling-only mode.

use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha1::Sha1;

use crate::config::RelayConfig;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay provisioning is disabled")]
    Disabled,
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay returned status {0}")]
    Status(u16),
}

/// Per-participant access credentials for the relay session.
#[derive(Debug, Clone, Serialize)]
pub struct RelayAccess {
    pub session_id: String,
    pub token: String,
    /// Unix timestamp after which the token is rejected.
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    config: Option<RelayConfig>,
}

impl RelayClient {
    pub fn new(config: Option<RelayConfig>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config
            .as_ref()
            .map(|c| c.enabled && !c.shared_secret.is_empty())
            .unwrap_or(false)
    }

    /// Provision a media session with the relay provider.
    pub async fn provision_session(
        &self,
        call_id: &str,
        participant_ids: &[&str],
        video: bool,
    ) -> Result<String, RelayError> {
        let cfg = self.config.as_ref().ok_or(RelayError::Disabled)?;
        if !cfg.enabled || cfg.endpoint.is_empty() {
            return Err(RelayError::Disabled);
        }

        let url = format!("{}/v1/sessions", cfg.endpoint.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&json!({
                "app_id": cfg.app_id,
                "session_id": call_id,
                "participant_ids": participant_ids,
                "video": video,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(RelayError::Status(resp.status().as_u16()));
        }

        #[derive(Deserialize)]
        struct SessionResponse {
            session_id: String,
        }
        let session: SessionResponse = resp.json().await?;
        Ok(session.session_id)
    }

    /// Mint a time-limited access token for one participant.
    ///
    /// identity = "{expiry}:{session_id}:{user_id}"
    /// token    = base64(identity) + "." + base64(HMAC-SHA1(secret, identity))
    ///
    /// Returns None when the relay is not configured — callers treat that as
    /// degraded mode, not an error.
    pub fn mint_token(&self, session_id: &str, user_id: &str) -> Option<RelayAccess> {
        let cfg = self.config.as_ref()?;
        if !cfg.enabled || cfg.shared_secret.is_empty() {
            return None;
        }

        let expires_at = Utc::now().timestamp() + cfg.token_ttl_secs as i64;
        let identity = format!("{}:{}:{}", expires_at, session_id, user_id);

        let mut mac = HmacSha1::new_from_slice(cfg.shared_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(identity.as_bytes());

        let b64 = base64::engine::general_purpose::STANDARD;
        let token = format!(
            "{}.{}",
            b64.encode(identity.as_bytes()),
            b64.encode(mac.finalize().into_bytes())
        );

        Some(RelayAccess {
            session_id: session_id.to_string(),
            token,
            expires_at,
        })
    }
}
