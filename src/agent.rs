//! Agent supervisor: the application context every component receives,
//! plus the signal loop and ordered shutdown.

use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::time::{Duration, timeout};
use tracing::{error, info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::auth::TokenStore;
use crate::cert::AgentCertificate;
use crate::config::Config;
use crate::errors::Result;
use crate::peer::PeerTable;
use crate::peerbook::PeerbookClient;
use crate::registry::PaneRegistry;
use crate::signaling;

/// Grace applied to closing the listeners before they are abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Everything components share, passed explicitly instead of living in
/// globals; tests build one around stubs.
pub struct AgentContext {
    pub config: RwLock<Config>,
    conf_file: Option<PathBuf>,
    pub panes: Arc<PaneRegistry>,
    pub peers: PeerTable,
    pub tokens: TokenStore,
    pub certificate: AgentCertificate,
    pub payload: Mutex<Value>,
    pub markers: Mutex<HashMap<String, Value>>,
    started: Instant,
    shutdown_done: AtomicBool,
}

impl AgentContext {
    pub fn new(
        config: Config,
        conf_file: Option<PathBuf>,
        certificate: AgentCertificate,
        tokens: TokenStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            conf_file,
            panes: Arc::new(PaneRegistry::new()),
            peers: PeerTable::new(),
            tokens,
            certificate,
            payload: Mutex::new(Value::Null),
            markers: Mutex::new(HashMap::new()),
            started: Instant::now(),
            shutdown_done: AtomicBool::new(false),
        })
    }

    /// Monotonic milliseconds since the agent started; the `time` field
    /// on outgoing control frames.
    pub fn monotonic_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn ice_server_urls(&self) -> Vec<String> {
        self.config.read().unwrap().ice_servers.clone()
    }

    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_server_urls()
            .into_iter()
            .map(|url| RTCIceServer {
                urls: vec![url],
                ..Default::default()
            })
            .collect()
    }

    /// SIGHUP handler: re-reads the conf file in place.
    pub fn reload_config(&self) -> Result<()> {
        let Some(path) = &self.conf_file else {
            return Ok(());
        };
        let fresh = Config::load(path)?;
        *self.config.write().unwrap() = fresh;
        info!(path = %path.display(), "configuration reloaded");
        Ok(())
    }

    pub fn status_text(&self) -> String {
        format!(
            "agent running\nuptime: {}s\npeers: {}\npanes: {}\nfingerprint: {}\n",
            self.started.elapsed().as_secs(),
            self.peers.len(),
            self.panes.len(),
            self.certificate.fingerprint(),
        )
    }

    /// Ordered teardown: peers first (closing their channels), then the
    /// panes. Safe to call twice; the second call is a no-op.
    pub fn shutdown(&self) -> bool {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("shutting down");
        self.peers.shutdown_all();
        self.panes.shutdown_all();
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_done.load(Ordering::SeqCst)
    }
}

/// Brings up signalling, registers with the peerbook when configured,
/// then parks on the signal loop until told to exit.
pub async fn run(ctx: Arc<AgentContext>, address: &str) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let socket_path = crate::config::socket_path()?;
    let unix_task = signaling::serve_unix(ctx.clone(), &socket_path, shutdown_rx.clone()).await?;
    let tcp_task = if address.is_empty() {
        None
    } else {
        Some(signaling::serve_tcp(ctx.clone(), address, shutdown_rx.clone()).await?)
    };

    let peerbook_host = ctx.config.read().unwrap().peerbook_host.clone();
    if let Some(host) = peerbook_host {
        match verify_with_peerbook(&ctx, &host).await {
            Ok(true) => info!(host, "verified by peerbook"),
            Ok(false) => {
                info!(host, "unverified; peerbook sent a verification email");
            }
            Err(err) => warn!(host, error = %err, "peerbook verification failed"),
        }
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("exiting on SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                info!("exiting on SIGTERM");
                break;
            }
            _ = sighup.recv() => {
                if let Err(err) = ctx.reload_config() {
                    error!(error = %err, "failed to reload configuration");
                }
            }
        }
    }

    ctx.shutdown();
    let _ = shutdown_tx.send(true);
    if timeout(SHUTDOWN_GRACE, unix_task).await.is_err() {
        warn!("unix signalling socket did not close within grace");
    }
    if let Some(task) = tcp_task {
        if timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("http signalling socket did not close within grace");
        }
    }
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn verify_with_peerbook(ctx: &Arc<AgentContext>, host: &str) -> Result<bool> {
    let (name, uid) = {
        let config = ctx.config.read().unwrap();
        (
            config.peerbook.name.clone().unwrap_or_default(),
            config.peerbook.uid.clone().unwrap_or_default(),
        )
    };
    let client = PeerbookClient::new(host)?;
    client
        .verify_peer(ctx.certificate.fingerprint(), &name, &uid)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> Arc<AgentContext> {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenStore::new(dir.path().join("authorized_tokens"));
        AgentContext::new(
            Config::default(),
            None,
            AgentCertificate::generate().unwrap(),
            tokens,
        )
    }

    #[test]
    fn shutdown_is_idempotent() {
        let ctx = test_ctx();
        assert!(!ctx.is_shut_down());
        assert!(ctx.shutdown());
        assert!(!ctx.shutdown());
        assert!(ctx.is_shut_down());
    }

    #[test]
    fn status_text_names_the_fingerprint() {
        let ctx = test_ctx();
        let status = ctx.status_text();
        assert!(status.contains("agent running"));
        assert!(status.contains(ctx.certificate.fingerprint()));
    }

    #[test]
    fn monotonic_time_moves_forward() {
        let ctx = test_ctx();
        let first = ctx.monotonic_ms();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(ctx.monotonic_ms() >= first);
    }
}
