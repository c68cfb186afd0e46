//! Process-wide pane registry: the sole owner of panes, with monotonic
//! id allocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::errors::Result;
use crate::pane::Pane;
use crate::protocol::Winsize;

pub struct PaneRegistry {
    panes: Mutex<HashMap<u32, Arc<Pane>>>,
    next_id: AtomicU32,
}

impl Default for PaneRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PaneRegistry {
    pub fn new() -> Self {
        Self {
            panes: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Spawns a pane, registers it, and starts its output loop. The pane
    /// is reachable by id before its first output chunk is processed.
    pub fn create(
        self: &Arc<Self>,
        argv: &[String],
        size: Winsize,
        env: HashMap<String, String>,
    ) -> Result<Arc<Pane>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (pane, reader) = Pane::spawn(id, argv, size, env)?;
        self.panes.lock().unwrap().insert(id, pane.clone());
        pane.start_reader(reader, Arc::clone(self));
        Ok(pane)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Pane>> {
        self.panes.lock().unwrap().get(&id).cloned()
    }

    /// Consistent snapshot of all live panes.
    pub fn all(&self) -> Vec<Arc<Pane>> {
        let mut panes: Vec<Arc<Pane>> = self.panes.lock().unwrap().values().cloned().collect();
        panes.sort_by_key(|pane| pane.id());
        panes
    }

    pub fn len(&self) -> usize {
        self.panes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.panes.lock().unwrap().is_empty()
    }

    /// Unregisters and tears the pane down: channels closed first, then
    /// the child killed and reaped.
    pub fn remove(&self, id: u32) -> Option<Arc<Pane>> {
        let pane = self.panes.lock().unwrap().remove(&id)?;
        pane.shutdown();
        info!(pane_id = id, "pane removed");
        Some(pane)
    }

    /// Agent shutdown sweep.
    pub fn shutdown_all(&self) {
        let drained: Vec<Arc<Pane>> = {
            let mut panes = self.panes.lock().unwrap();
            panes.drain().map(|(_, pane)| pane).collect()
        };
        for pane in drained {
            pane.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn try_create(registry: &Arc<PaneRegistry>) -> Option<Arc<Pane>> {
        match registry.create(&["/bin/cat".to_string()], Winsize::DEFAULT, HashMap::new()) {
            Ok(pane) => Some(pane),
            Err(err) => {
                eprintln!("skipping PTY-backed test: {err}");
                None
            }
        }
    }

    #[tokio::test]
    async fn ids_are_distinct_and_increasing() {
        let registry = Arc::new(PaneRegistry::new());
        let Some(first) = try_create(&registry) else {
            return;
        };
        let Some(second) = try_create(&registry) else {
            return;
        };
        assert!(first.id() >= 1);
        assert!(second.id() > first.id());
        registry.shutdown_all();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn remove_is_terminal_for_lookup() {
        let registry = Arc::new(PaneRegistry::new());
        let Some(pane) = try_create(&registry) else {
            return;
        };
        let id = pane.id();
        assert!(registry.get(id).is_some());
        assert!(registry.remove(id).is_some());
        assert!(registry.get(id).is_none());
        assert!(registry.remove(id).is_none());
        assert!(pane.is_dead());
    }
}
