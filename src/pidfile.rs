//! PID file handling: one agent per runtime directory, stale files
//! cleaned up via a signal-0 liveness probe.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{AgentError, Result};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claims the PID file for this process; errors when another live
    /// agent holds it.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(pid) = read_running(path)? {
            return Err(AgentError::Config(format!(
                "agent is already running with process id {pid}"
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", std::process::id()))?;
        debug!(path = %path.display(), pid = std::process::id(), "pid file created");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.remove();
    }
}

/// The PID of a live agent, if any. Stale files are removed on the way.
pub fn read_running(path: &Path) -> Result<Option<i32>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let pid: i32 = raw
        .trim()
        .parse()
        .map_err(|_| AgentError::Config(format!("corrupt pid file {}", path.display())))?;
    if alive(pid) {
        Ok(Some(pid))
    } else {
        let _ = fs::remove_file(path);
        Ok(None)
    }
}

fn alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_reads_back_as_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        let pidfile = PidFile::create(&path).unwrap();
        assert_eq!(read_running(&path).unwrap(), Some(std::process::id() as i32));
        assert!(PidFile::create(&path).is_err());
        pidfile.remove();
        assert_eq!(read_running(&path).unwrap(), None);
    }

    #[test]
    fn stale_pid_is_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        // Far above any real pid_max, so the probe fails.
        fs::write(&path, "999999999\n").unwrap();
        assert_eq!(read_running(&path).unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_pid_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        fs::write(&path, "not a pid\n").unwrap();
        assert!(read_running(&path).is_err());
    }
}
