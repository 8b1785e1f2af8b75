//! Durable bidirectional index between server node ids and local relative
//! paths, plus enough metadata (checksum, inode) to detect offline
//! rename/delete/move at reconnect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::logging;

pub type NodeId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeEntry {
    pub path: String,
    pub checksum: Option<String>,
    pub inode: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(rename = "lastSyncedAt")]
    pub last_synced_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeMap {
    entries: HashMap<NodeId, NodeEntry>,
}

impl NodeMap {
    pub fn get(&self, id: &str) -> Option<&NodeEntry> {
        self.entries.get(id)
    }

    pub fn insert(&mut self, id: impl Into<NodeId>, entry: NodeEntry) {
        self.entries.insert(id.into(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<NodeEntry> {
        self.entries.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeEntry)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Finds the node id currently mapped to `path`, if any.
    pub fn id_for_path(&self, path: &str) -> Option<NodeId> {
        self.entries
            .iter()
            .find(|(_, e)| e.path == path)
            .map(|(id, _)| id.clone())
    }
}

fn meta_dir(root: &Path) -> PathBuf {
    root.join(".sync-meta")
}

fn node_map_path(root: &Path) -> PathBuf {
    meta_dir(root).join("node-map.json")
}

fn sync_state_path(root: &Path) -> PathBuf {
    meta_dir(root).join("sync-state.json")
}

/// Reads both metadata files. A parse failure on either degrades to an
/// empty value and logs a warning rather than aborting startup — the next
/// reconcile rebuilds state from the server listing.
pub fn load(root: &Path) -> (NodeMap, SyncState) {
    let map = load_node_map(root).unwrap_or_else(|err| {
        logging::warn(format!("node-map.json unreadable, starting empty: {err}"));
        NodeMap::default()
    });
    let state = load_sync_state(root).unwrap_or_else(|err| {
        logging::warn(format!("sync-state.json unreadable, starting empty: {err}"));
        SyncState::default()
    });
    (map, state)
}

fn load_node_map(root: &Path) -> Result<NodeMap> {
    let path = node_map_path(root);
    if !path.exists() {
        return Ok(NodeMap::default());
    }
    let raw = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let value: HashMap<NodeId, Value> = serde_json::from_str(&raw).context("parse node-map.json")?;

    let mut entries = HashMap::with_capacity(value.len());
    for (id, v) in value {
        let entry = match v {
            // Legacy form: a bare string is just the path.
            Value::String(path) => NodeEntry {
                path,
                checksum: None,
                inode: None,
            },
            other => serde_json::from_value(other)
                .with_context(|| format!("parse node-map entry {id}"))?,
        };
        entries.insert(id, entry);
    }
    Ok(NodeMap { entries })
}

fn load_sync_state(root: &Path) -> Result<SyncState> {
    let path = sync_state_path(root);
    if !path.exists() {
        return Ok(SyncState::default());
    }
    let raw = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).context("parse sync-state.json")
}

/// Writes `<file>.<rand>.tmp` then renames over the target so a crash
/// mid-write never leaves a corrupt map or state file on disk.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = path.with_extension(format!("{}.tmp", rand_suffix()));
    std::fs::write(&tmp, contents.as_bytes()).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

fn rand_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}

pub fn save(root: &Path, map: &NodeMap) -> Result<()> {
    let json = serde_json::to_string_pretty(&map.entries).context("serialize node map")?;
    write_atomic(&node_map_path(root), &json)
}

pub fn save_state(root: &Path, state: &SyncState) -> Result<()> {
    let json = serde_json::to_string_pretty(state).context("serialize sync state")?;
    write_atomic(&sync_state_path(root), &json)
}

/// Best-effort OS file identity, used to recognize a rename when the
/// content checksum alone is ambiguous. `None` on platforms without a
/// stable inode concept.
#[cfg(unix)]
pub fn inode_of(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| m.ino())
}

#[cfg(not(unix))]
pub fn inode_of(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_root(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("sitesync-nodemap-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn round_trips_map_and_state_through_atomic_save() {
        let root = tmp_root("roundtrip");
        let mut map = NodeMap::default();
        map.insert(
            "42",
            NodeEntry {
                path: "blog/intro.html".to_string(),
                checksum: Some("a1b2c3d4e5f60708".to_string()),
                inode: Some(99),
            },
        );
        save(&root, &map).unwrap();

        let mut state = SyncState::default();
        state.last_synced_at = Some(1000);
        save_state(&root, &state).unwrap();

        let (loaded_map, loaded_state) = load(&root);
        assert_eq!(loaded_map.get("42").unwrap().path, "blog/intro.html");
        assert_eq!(loaded_state.last_synced_at, Some(1000));
    }

    #[test]
    fn upgrades_legacy_string_entries() {
        let root = tmp_root("legacy");
        std::fs::create_dir_all(root.join(".sync-meta")).unwrap();
        std::fs::write(
            root.join(".sync-meta/node-map.json"),
            r#"{"7": "posts/a.html"}"#,
        )
        .unwrap();

        let (map, _) = load(&root);
        let entry = map.get("7").unwrap();
        assert_eq!(entry.path, "posts/a.html");
        assert_eq!(entry.checksum, None);
        assert_eq!(entry.inode, None);
    }

    #[test]
    fn missing_files_load_as_empty_without_error() {
        let root = tmp_root("missing");
        let (map, state) = load(&root);
        assert!(map.is_empty());
        assert_eq!(state.last_synced_at, None);
    }

    #[test]
    fn corrupt_node_map_degrades_to_empty() {
        let root = tmp_root("corrupt");
        std::fs::create_dir_all(root.join(".sync-meta")).unwrap();
        std::fs::write(root.join(".sync-meta/node-map.json"), "not json").unwrap();

        let (map, _) = load(&root);
        assert!(map.is_empty());
    }

    #[test]
    fn id_for_path_finds_matching_entry() {
        let mut map = NodeMap::default();
        map.insert(
            "1",
            NodeEntry {
                path: "a.html".to_string(),
                checksum: None,
                inode: None,
            },
        );
        assert_eq!(map.id_for_path("a.html"), Some("1".to_string()));
        assert_eq!(map.id_for_path("b.html"), None);
    }
}
