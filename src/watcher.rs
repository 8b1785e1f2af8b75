//! Filesystem watcher and semantic correlator (spec §4.6). Splits cleanly
//! into: ignore rules, raw OS event framing via `notify`, a write-settle
//! debounce tracker, and a pure rename/move correlator. The async loop
//! that ties these to the pending-unlinks store and the upload queue
//! lives in the engine, which owns all the shared state the correlator
//! needs to act on.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

pub const WRITE_SETTLE_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub enum RawFsEvent {
    Create(PathBuf),
    Modify(PathBuf),
    Remove(PathBuf),
}

/// Keeps the `notify` watcher alive; dropping this stops watching.
pub struct Watcher {
    _inner: RecommendedWatcher,
}

/// Starts watching `root` recursively and returns a channel of raw events
/// (already filtered for ignored paths). `notify`'s callback runs
/// synchronously on its own thread; `UnboundedSender::send` is a plain,
/// non-blocking queue push, so no bridging thread is needed.
pub fn spawn(root: PathBuf) -> Result<(Watcher, UnboundedReceiver<RawFsEvent>)> {
    let (tx, rx) = unbounded_channel();
    let ignore_root = root.clone();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else { return };
        for path in event.paths {
            if is_ignored(&path, &ignore_root) {
                continue;
            }
            let mapped = match event.kind {
                notify::EventKind::Create(_) => Some(RawFsEvent::Create(path)),
                notify::EventKind::Modify(_) => Some(RawFsEvent::Modify(path)),
                notify::EventKind::Remove(_) => Some(RawFsEvent::Remove(path)),
                _ => None,
            };
            if let Some(ev) = mapped {
                let _ = tx.send(ev);
            }
        }
    })
    .context("create filesystem watcher")?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", root.display()))?;

    Ok((Watcher { _inner: watcher }, rx))
}

/// Mirrors `reconciler::is_ignored` — both need the same ignore rule set,
/// kept identical on purpose (spec §4.6's ignore list is a single set
/// shared by the watcher and the reconciler's local walk).
pub fn is_ignored(path: &Path, root: &Path) -> bool {
    crate::reconciler::is_ignored(path, root)
}

/// Tracks per-path "last seen write" timestamps so a burst of OS-level
/// write events collapses into one semantic change after the file has
/// settled for `WRITE_SETTLE_DEBOUNCE`.
#[derive(Debug, Default)]
pub struct DebounceTracker {
    last_seen: std::collections::HashMap<PathBuf, Instant>,
}

impl DebounceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&mut self, path: PathBuf, at: Instant) {
        self.last_seen.insert(path, at);
    }

    /// True once `at` is at least the debounce window past the last touch
    /// for `path` — i.e. the file looks settled and safe to act on.
    pub fn is_settled(&self, path: &Path, at: Instant) -> bool {
        match self.last_seen.get(path) {
            Some(last) => at.duration_since(*last) >= WRITE_SETTLE_DEBOUNCE,
            None => true,
        }
    }

    pub fn clear(&mut self, path: &Path) {
        self.last_seen.remove(path);
    }
}

/// A recently-observed delete, offered to the correlator as a candidate
/// match for an incoming create.
#[derive(Debug, Clone)]
pub struct UnlinkCandidate {
    pub rel_path: String,
    pub node_id: Option<String>,
    pub checksum: Option<String>,
    pub inode: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationKind {
    Rename,
    Move,
    MoveAndRename,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub kind: CorrelationKind,
    pub old_rel_path: String,
    pub new_rel_path: String,
    pub node_id: Option<String>,
}

fn basename(rel_path: &str) -> &str {
    Path::new(rel_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(rel_path)
}

fn parent_dir(rel_path: &str) -> &str {
    Path::new(rel_path)
        .parent()
        .and_then(|p| p.to_str())
        .unwrap_or("")
}

/// Tries to pair an incoming create with one of the recently-observed
/// deletes. Identity is verified by inode when both ends have one, else
/// by content checksum — never by path alone, since a create/delete pair
/// sharing a basename could just as easily be an unrelated file. Returns
/// `None` when no candidate's identity can be confirmed, in which case the
/// caller treats the create as a fresh add (and the paired delete, if any,
/// will separately expire into a real delete).
pub fn correlate_create(
    new_rel_path: &str,
    new_checksum: &str,
    new_inode: Option<u64>,
    candidates: &[UnlinkCandidate],
) -> Option<Correlation> {
    candidates.iter().find_map(|c| {
        if c.rel_path == new_rel_path {
            return None;
        }
        let identity_confirmed = match (c.inode, new_inode) {
            (Some(a), Some(b)) => a == b,
            _ => c.checksum.as_deref() == Some(new_checksum),
        };
        if !identity_confirmed {
            return None;
        }

        let same_dir = parent_dir(&c.rel_path) == parent_dir(new_rel_path);
        let same_basename = basename(&c.rel_path) == basename(new_rel_path);
        let kind = match (same_dir, same_basename) {
            (true, false) => CorrelationKind::Rename,
            (false, true) => CorrelationKind::Move,
            (false, false) => CorrelationKind::MoveAndRename,
            (true, true) => return None,
        };
        Some(Correlation {
            kind,
            old_rel_path: c.rel_path.clone(),
            new_rel_path: new_rel_path.to_string(),
            node_id: c.node_id.clone(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(rel_path: &str, node_id: &str, checksum: &str, inode: Option<u64>) -> UnlinkCandidate {
        UnlinkCandidate {
            rel_path: rel_path.to_string(),
            node_id: Some(node_id.to_string()),
            checksum: Some(checksum.to_string()),
            inode,
        }
    }

    #[test]
    fn same_directory_different_basename_is_a_rename() {
        let candidates = vec![candidate("projects/old.html", "1", "abc", Some(10))];
        let result = correlate_create("projects/new.html", "abc", Some(10), &candidates).unwrap();
        assert_eq!(result.kind, CorrelationKind::Rename);
        assert_eq!(result.old_rel_path, "projects/old.html");
    }

    #[test]
    fn different_directory_same_basename_is_a_move() {
        let candidates = vec![candidate("blog/intro.html", "1", "abc", Some(10))];
        let result = correlate_create("archive/intro.html", "abc", Some(10), &candidates).unwrap();
        assert_eq!(result.kind, CorrelationKind::Move);
    }

    #[test]
    fn different_directory_and_basename_is_move_and_rename() {
        let candidates = vec![candidate("blog/old.html", "1", "abc", Some(10))];
        let result = correlate_create("archive/new.html", "abc", Some(10), &candidates).unwrap();
        assert_eq!(result.kind, CorrelationKind::MoveAndRename);
    }

    #[test]
    fn checksum_confirms_identity_when_inode_changed() {
        // Some editors rewrite inodes on save; checksum still matches.
        let candidates = vec![candidate("projects/old.html", "1", "stable", Some(10))];
        let result = correlate_create("projects/new.html", "stable", Some(999), &candidates).unwrap();
        assert_eq!(result.kind, CorrelationKind::Rename);
    }

    #[test]
    fn mismatched_identity_does_not_correlate() {
        let candidates = vec![candidate("projects/old.html", "1", "abc", Some(10))];
        assert!(correlate_create("projects/new.html", "xyz", Some(11), &candidates).is_none());
    }

    #[test]
    fn unrelated_candidate_with_no_shared_dir_or_name_and_no_identity_match_is_ignored() {
        let candidates = vec![candidate("unrelated/file.html", "2", "zzz", Some(1))];
        assert!(correlate_create("new/place.html", "abc", Some(10), &candidates).is_none());
    }

    #[test]
    fn debounce_tracker_waits_for_settle_window() {
        let mut tracker = DebounceTracker::new();
        let path = PathBuf::from("/sync/a.html");
        let t0 = Instant::now();
        tracker.touch(path.clone(), t0);
        assert!(!tracker.is_settled(&path, t0 + Duration::from_millis(100)));
        assert!(tracker.is_settled(&path, t0 + WRITE_SETTLE_DEBOUNCE + Duration::from_millis(1)));
    }

    #[test]
    fn untouched_path_is_always_settled() {
        let tracker = DebounceTracker::new();
        assert!(tracker.is_settled(Path::new("/sync/never-seen.html"), Instant::now()));
    }
}
