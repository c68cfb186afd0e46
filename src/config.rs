//! Agent configuration: a sectioned key=value file under the conf
//! directory, plus the derived on-disk paths (certificate, tokens, PID
//! file, control socket).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{AgentError, Result};

pub const CONF_FILE: &str = "boardwalk.conf";
pub const CERT_FILE: &str = "certnkey.pem";
pub const TOKENS_FILE: &str = "authorized_tokens";
pub const PID_FILE: &str = "agent.pid";
pub const SOCKET_FILE: &str = "boardwalk.sock";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerbookSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP address the signalling HTTP server also listens on; the Unix
    /// socket is always served.
    #[serde(default = "default_http_server")]
    pub http_server: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub err_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub peerbook_host: Option<String>,
    #[serde(default)]
    pub ice_servers: Vec<String>,
    #[serde(default)]
    pub peerbook: PeerbookSection,
    /// Per-scope log levels for the WebRTC stack, e.g. `ice = "debug"`.
    #[serde(default)]
    pub webrtc_log: HashMap<String, String>,
}

fn default_http_server() -> String {
    "0.0.0.0:7777".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_server: default_http_server(),
            log_file: None,
            err_file: None,
            log_level: default_log_level(),
            peerbook_host: None,
            ice_servers: Vec::new(),
            peerbook: PeerbookSection::default(),
            webrtc_log: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            AgentError::Config(format!(
                "cannot read {}: {err}; run `boardwalk init` first",
                path.display()
            ))
        })?;
        toml::from_str(&raw)
            .map_err(|err| AgentError::Config(format!("parse {}: {err}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|err| AgentError::Config(format!("render configuration: {err}")))?;
        fs::write(path, rendered)
            .map_err(|err| AgentError::Config(format!("write {}: {err}", path.display())))?;
        Ok(())
    }

    /// The `tracing` filter derived from `log_level` plus the per-scope
    /// WebRTC levels.
    pub fn tracing_filter(&self) -> String {
        let mut directives = vec![format!("boardwalk={}", self.log_level)];
        for (scope, level) in &self.webrtc_log {
            if scope == "all" {
                directives.push(format!("webrtc={level}"));
            } else {
                directives.push(format!("webrtc_{scope}={level}"));
            }
        }
        directives.join(",")
    }
}

/// Conf directory: `$BOARDWALK_HOME`, else `~/.config/boardwalk`.
pub fn conf_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("BOARDWALK_HOME") {
        if !home.trim().is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    let home = dirs::home_dir()
        .ok_or_else(|| AgentError::Config("cannot determine the home directory".into()))?;
    Ok(home.join(".config").join("boardwalk"))
}

pub fn conf_path(name: &str) -> Result<PathBuf> {
    Ok(conf_dir()?.join(name))
}

/// Runtime directory for the PID file and control socket:
/// `$XDG_RUNTIME_DIR/boardwalk` when available, else the conf dir.
pub fn run_dir() -> Result<PathBuf> {
    if let Ok(runtime) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime.trim().is_empty() {
            let dir = PathBuf::from(runtime).join("boardwalk");
            fs::create_dir_all(&dir)?;
            return Ok(dir);
        }
    }
    conf_dir()
}

pub fn run_path(name: &str) -> Result<PathBuf> {
    Ok(run_dir()?.join(name))
}

pub fn socket_path() -> Result<PathBuf> {
    run_path(SOCKET_FILE)
}

pub fn pid_path() -> Result<PathBuf> {
    run_path(PID_FILE)
}

/// Creates the conf directory and a commented default configuration,
/// honoring the `PEERBOOK_*` environment at init time. Fails when the
/// directory already exists.
pub fn create_default_conf(dir: &Path) -> Result<Config> {
    if dir.exists() {
        return Err(AgentError::Config(format!(
            "{} already exists, leaving as is",
            dir.display()
        )));
    }
    fs::create_dir_all(dir)?;

    let mut config = Config::default();
    if let Ok(host) = std::env::var("PEERBOOK_HOST") {
        if !host.trim().is_empty() {
            config.peerbook_host = Some(host);
        }
    }
    if let Ok(name) = std::env::var("PEERBOOK_NAME") {
        if !name.trim().is_empty() {
            config.peerbook.name = Some(name);
        }
    }
    if let Ok(uid) = std::env::var("PEERBOOK_UID") {
        if !uid.trim().is_empty() {
            config.peerbook.uid = Some(uid);
        }
    }
    config.save(&dir.join(CONF_FILE))?;

    let tokens = dir.join(TOKENS_FILE);
    if !tokens.exists() {
        fs::write(&tokens, "# one authorized token per line\n")?;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.http_server, "0.0.0.0:7777");
        assert_eq!(config.log_level, "info");
        assert!(config.peerbook_host.is_none());
    }

    #[test]
    fn sectioned_file_parses() {
        let raw = r#"
http_server = "127.0.0.1:7777"
log_level = "debug"
peerbook_host = "book.example.com"

[peerbook]
name = "workstation"
uid = "u-123"

[webrtc_log]
ice = "trace"
all = "warn"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.peerbook_host.as_deref(), Some("book.example.com"));
        assert_eq!(config.peerbook.name.as_deref(), Some("workstation"));
        let filter = config.tracing_filter();
        assert!(filter.contains("boardwalk=debug"));
        assert!(filter.contains("webrtc_ice=trace"));
        assert!(filter.contains("webrtc=warn"));
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONF_FILE);
        let mut config = Config::default();
        config.log_level = "trace".into();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.log_level, "trace");
    }

    #[test]
    fn missing_conf_points_at_init() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join(CONF_FILE)).unwrap_err();
        assert!(err.to_string().contains("boardwalk init"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn create_default_conf_refuses_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("boardwalk");
        create_default_conf(&target).unwrap();
        assert!(target.join(CONF_FILE).exists());
        assert!(target.join(TOKENS_FILE).exists());
        assert!(create_default_conf(&target).is_err());
    }
}
