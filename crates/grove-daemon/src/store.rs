//! Persisted per-instance snapshots.
//!
//! Each instance has a JSON file at `<root>/instances/<id>.json` holding its
//! public metadata. Snapshots are written on start, restart, every terminal
//! transition, and when reload corrects a stale state. Writes go to a temp
//! file and are renamed into place, so a crash mid-write leaves the previous
//! snapshot intact (and reloadable) instead of a torn file; stale `.tmp`
//! leftovers are ignored on reload.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use grove_proto::InstanceState;

use crate::error::{GroveError, Result};

/// The on-disk record for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub project: String,
    pub branch: String,
    pub worktree_dir: String,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Unix timestamp of process exit; 0 while live.
    #[serde(default)]
    pub ended_at: i64,
    pub state: InstanceState,
    #[serde(default)]
    pub pid: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compose_project: String,
}

/// Directory-backed store of instance snapshots.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Write a snapshot, replacing any previous file for the instance.
    ///
    /// Atomic at the filesystem level: the data lands in `<id>.json.tmp`
    /// first and is renamed over the real path, so readers (and the next
    /// daemon's reload) only ever see a complete file.
    pub fn save(&self, snap: &InstanceSnapshot) -> Result<()> {
        let data = serde_json::to_vec_pretty(snap)
            .map_err(|e| GroveError::Store(format!("serialize {}: {e}", snap.id)))?;
        let path = self.path_for(&snap.id);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, data)
            .map_err(|e| GroveError::Store(format!("write {}.json.tmp: {e}", snap.id)))?;
        fs::rename(&tmp_path, &path)
            .map_err(|e| GroveError::Store(format!("rename {}.json into place: {e}", snap.id)))
    }

    /// Remove the snapshot file for an instance. Missing files are fine.
    pub fn delete(&self, id: &str) {
        let _ = fs::remove_file(self.path_for(id));
    }

    /// Read every parseable snapshot in the directory.
    ///
    /// Unreadable or unparseable files are skipped with a warning so one
    /// corrupt record cannot block daemon startup.
    pub fn load_all(&self) -> Result<Vec<InstanceSnapshot>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| GroveError::Store(format!("read {}: {e}", self.dir.display())))?;

        let mut snaps = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match fs::read(&path) {
                Ok(d) => d,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable instance file");
                    continue;
                }
            };
            match serde_json::from_slice::<InstanceSnapshot>(&data) {
                Ok(snap) => snaps.push(snap),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unparseable instance file");
                }
            }
        }
        Ok(snaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, state: InstanceState) -> InstanceSnapshot {
        InstanceSnapshot {
            id: id.into(),
            project: "my-app".into(),
            branch: "feat/x".into(),
            worktree_dir: format!("/data/worktrees/{id}"),
            created_at: 1_700_000_000,
            ended_at: 0,
            state,
            pid: 1234,
            container_id: format!("grove-{id}"),
            compose_project: String::new(),
        }
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store.save(&snapshot("1", InstanceState::Running)).unwrap();
        store.save(&snapshot("2", InstanceState::Exited)).unwrap();

        let mut snaps = store.load_all().unwrap();
        snaps.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].id, "1");
        assert_eq!(snaps[0].state, InstanceState::Running);
        assert_eq!(snaps[0].container_id, "grove-1");
        assert_eq!(snaps[1].state, InstanceState::Exited);
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store.save(&snapshot("1", InstanceState::Running)).unwrap();
        let mut updated = snapshot("1", InstanceState::Killed);
        updated.ended_at = 1_700_000_100;
        store.save(&updated).unwrap();

        let snaps = store.load_all().unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].state, InstanceState::Killed);
        assert_eq!(snaps[0].ended_at, 1_700_000_100);
    }

    #[test]
    fn save_leaves_only_the_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store.save(&snapshot("1", InstanceState::Running)).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["1.json".to_string()], "no .tmp residue after save");
    }

    #[test]
    fn stale_tmp_file_is_ignored_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store.save(&snapshot("1", InstanceState::Running)).unwrap();
        // A crash between write and rename leaves a torn tmp behind; the
        // real snapshot must still reload alone.
        fs::write(dir.path().join("1.json.tmp"), b"{\"id\":\"1\",\"proj").unwrap();

        let snaps = store.load_all().unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].id, "1");
        assert_eq!(snaps[0].state, InstanceState::Running);
    }

    #[test]
    fn load_all_skips_garbage_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store.save(&snapshot("a", InstanceState::Finished)).unwrap();
        fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

        let snaps = store.load_all().unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].id, "a");
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store.save(&snapshot("z", InstanceState::Crashed)).unwrap();
        store.delete("z");
        store.delete("z");
        assert!(store.load_all().unwrap().is_empty());
    }
}
