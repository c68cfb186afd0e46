//! The agent's DTLS identity: one self-signed certificate, persisted as
//! PEM so the fingerprint stays stable across restarts.

use rcgen::KeyPair;
use std::fs;
use std::path::Path;
use tracing::info;
use webrtc::peer_connection::certificate::RTCCertificate;

use crate::errors::{AgentError, Result};

#[derive(Clone)]
pub struct AgentCertificate {
    certificate: RTCCertificate,
    fingerprint: String,
}

impl AgentCertificate {
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|err| AgentError::Cert(format!("generate key pair: {err}")))?;
        let certificate = RTCCertificate::from_key_pair(key_pair)
            .map_err(|err| AgentError::Cert(format!("self-sign certificate: {err}")))?;
        Self::from_certificate(certificate)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let pem = fs::read_to_string(path)
            .map_err(|err| AgentError::Cert(format!("read {}: {err}", path.display())))?;
        let certificate = RTCCertificate::from_pem(&pem)
            .map_err(|err| AgentError::Cert(format!("parse {}: {err}", path.display())))?;
        Self::from_certificate(certificate)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.certificate.serialize_pem())
            .map_err(|err| AgentError::Cert(format!("write {}: {err}", path.display())))?;
        Ok(())
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let cert = Self::generate()?;
            cert.save(path)?;
            info!(path = %path.display(), "generated agent certificate");
            Ok(cert)
        }
    }

    fn from_certificate(certificate: RTCCertificate) -> Result<Self> {
        let fingerprints = certificate.get_fingerprints();
        let first = fingerprints
            .first()
            .ok_or_else(|| AgentError::Cert("certificate has no fingerprint".into()))?;
        // Stable identity form: lowercase hex, no separators.
        let fingerprint = first.value.replace(':', "").to_lowercase();
        Ok(Self {
            certificate,
            fingerprint,
        })
    }

    /// Hex SHA-256 of the certificate, the agent's stable identity.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn rtc_certificate(&self) -> RTCCertificate {
        self.certificate.clone()
    }
}
