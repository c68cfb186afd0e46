//! Client for the optional rendezvous service: registers the agent's
//! fingerprint and name, and reports whether the peer is verified.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{AgentError, Result};

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    fingerprint: &'a str,
    name: &'a str,
    uid: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    verified: bool,
}

#[derive(Debug, Clone)]
pub struct PeerbookClient {
    client: Client,
    base: String,
}

impl PeerbookClient {
    pub fn new(host: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| AgentError::Config(err.to_string()))?;
        let base = if host.contains("://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };
        Ok(Self { client, base })
    }

    /// POSTs `{fingerprint, name, uid}` to `/verify`; `false` means the
    /// service mailed a verification request and is still waiting.
    pub async fn verify_peer(&self, fingerprint: &str, name: &str, uid: &str) -> Result<bool> {
        let url = format!("{}/verify", self.base);
        let response = self
            .client
            .post(&url)
            .json(&VerifyRequest {
                fingerprint,
                name,
                uid,
            })
            .send()
            .await
            .map_err(|err| AgentError::Transport(format!("peerbook {url}: {err}")))?;
        if !response.status().is_success() {
            return Err(AgentError::Transport(format!(
                "peerbook {url} returned {}",
                response.status()
            )));
        }
        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|err| AgentError::Protocol(format!("peerbook response: {err}")))?;
        Ok(body.verified)
    }
}
