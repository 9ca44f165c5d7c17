//! Session state and game catalog.
//!
//! Both caches live for the process lifetime and are replaced wholesale by
//! inbound commands. They are owned, lock-guarded structures handed to the
//! controller by reference; consumers go through the narrow accessors and
//! never see the lock.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Point-in-time copy of the session state, safe to hand to presentation
/// layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Currently assigned game file (may be empty between assignments).
    pub game: String,
    /// Currently assigned instance id.
    pub instance_id: String,
    /// Whether emulation is running (false while paused).
    pub running: bool,
    /// Asset currently being fetched for a pending swap, if any.
    pub pending_asset: Option<String>,
}

impl SessionSnapshot {
    /// True once an instance has been assigned.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.instance_id.is_empty()
    }
}

/// Lock-guarded session state. Mutated by the controller while handling
/// swap/start commands; read by status reporting under the same lock.
#[derive(Debug, Default)]
pub struct SessionState {
    inner: Mutex<SessionSnapshot>,
}

impl SessionState {
    /// Current state snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.lock().expect("session lock poisoned").clone()
    }

    /// Record a new `(game, instance)` assignment and return the previous
    /// instance id (empty if none).
    pub fn begin_swap(&self, game: &str, instance_id: &str) -> String {
        let mut state = self.inner.lock().expect("session lock poisoned");
        let previous = std::mem::replace(&mut state.instance_id, instance_id.to_string());
        state.game = game.to_string();
        previous
    }

    /// Update the running flag.
    pub fn set_running(&self, running: bool) {
        self.inner.lock().expect("session lock poisoned").running = running;
    }

    /// Record which asset a pending swap is waiting on.
    pub fn set_pending_asset(&self, asset: Option<String>) {
        self.inner.lock().expect("session lock poisoned").pending_asset = asset;
    }
}

/// One catalog entry: a primary ROM plus the auxiliary files it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEntry {
    /// Primary ROM file name.
    pub primary_file: String,
    /// Auxiliary files that must accompany the primary.
    #[serde(default)]
    pub extra_files: Vec<String>,
}

/// Ordered catalog of games the server declared for this session.
/// Replaced wholesale on each games-update.
#[derive(Debug, Default)]
pub struct GameCatalog {
    inner: Mutex<Vec<GameEntry>>,
}

impl GameCatalog {
    /// Replace the catalog.
    pub fn replace(&self, entries: Vec<GameEntry>) {
        *self.inner.lock().expect("catalog lock poisoned") = entries;
    }

    /// Extra files declared for `primary`, empty if unknown.
    #[must_use]
    pub fn extras_for(&self, primary: &str) -> Vec<String> {
        self.inner
            .lock()
            .expect("catalog lock poisoned")
            .iter()
            .find(|entry| entry.primary_file == primary)
            .map(|entry| entry.extra_files.clone())
            .unwrap_or_default()
    }

    /// Ordered union of every primary and extra file, deduplicated.
    #[must_use]
    pub fn required_assets(&self) -> Vec<String> {
        let entries = self.inner.lock().expect("catalog lock poisoned");
        let mut seen = std::collections::HashSet::new();
        let mut assets = Vec::new();
        for entry in entries.iter() {
            if seen.insert(entry.primary_file.clone()) {
                assets.push(entry.primary_file.clone());
            }
            for extra in &entry.extra_files {
                if seen.insert(extra.clone()) {
                    assets.push(extra.clone());
                }
            }
        }
        assets
    }

    /// Number of catalog entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("catalog lock poisoned").len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_swap_returns_previous_instance() {
        let session = SessionState::default();
        assert_eq!(session.begin_swap("zelda.zip", "p1-1"), "");
        assert_eq!(session.begin_swap("mario.zip", "p1-2"), "p1-1");

        let snap = session.snapshot();
        assert_eq!(snap.game, "mario.zip");
        assert_eq!(snap.instance_id, "p1-2");
        assert!(snap.is_active());
    }

    #[test]
    fn test_snapshot_reflects_flags() {
        let session = SessionState::default();
        assert!(!session.snapshot().is_active());

        session.set_running(true);
        session.set_pending_asset(Some("zelda.zip".to_string()));
        let snap = session.snapshot();
        assert!(snap.running);
        assert_eq!(snap.pending_asset.as_deref(), Some("zelda.zip"));

        session.set_pending_asset(None);
        assert_eq!(session.snapshot().pending_asset, None);
    }

    #[test]
    fn test_catalog_extras_lookup() {
        let catalog = GameCatalog::default();
        catalog.replace(vec![
            GameEntry {
                primary_file: "zelda.zip".to_string(),
                extra_files: vec!["zelda.pal".to_string()],
            },
            GameEntry {
                primary_file: "mario.zip".to_string(),
                extra_files: vec![],
            },
        ]);

        assert_eq!(catalog.extras_for("zelda.zip"), vec!["zelda.pal"]);
        assert!(catalog.extras_for("mario.zip").is_empty());
        assert!(catalog.extras_for("unknown.zip").is_empty());
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_required_assets_union_dedup_ordered() {
        let catalog = GameCatalog::default();
        catalog.replace(vec![
            GameEntry {
                primary_file: "zelda.zip".to_string(),
                extra_files: vec!["shared.bios".to_string()],
            },
            GameEntry {
                primary_file: "mario.zip".to_string(),
                extra_files: vec!["shared.bios".to_string(), "mario.pal".to_string()],
            },
        ]);

        assert_eq!(
            catalog.required_assets(),
            vec!["zelda.zip", "shared.bios", "mario.zip", "mario.pal"]
        );
    }
}
