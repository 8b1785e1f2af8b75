//! Pending-actions and pending-unlinks stores (spec §3). Both are accessed
//! only from the engine's single event loop — no locking is needed beyond
//! what their owner (the `Engine`) already serializes through.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const PENDING_ACTION_TTL: Duration = Duration::from_secs(30);
pub const UNLINK_GRACE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Delete,
    Rename,
    Move,
}

impl MutationKind {
    fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Delete => "delete",
            MutationKind::Rename => "rename",
            MutationKind::Move => "move",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Token {
    kind: MutationKind,
    node_id: String,
}

/// In-memory set of `{delete,rename,move}:<nodeId>` tokens. Inserted
/// synchronously before a client-initiated server mutation so the
/// resulting SSE echo can be suppressed (I4). Swept for stale entries
/// every 30s in case an echo never arrives (dropped message, reconnect).
#[derive(Debug, Default)]
pub struct PendingActions {
    tokens: HashMap<Token, Instant>,
}

impl PendingActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: MutationKind, node_id: impl Into<String>) {
        self.tokens.insert(
            Token {
                kind,
                node_id: node_id.into(),
            },
            Instant::now(),
        );
    }

    /// Consumes (removes) a matching token if present. A matched token is
    /// consumed exactly once, per spec §4.7.
    pub fn consume(&mut self, kind: MutationKind, node_id: &str) -> bool {
        self.tokens
            .remove(&Token {
                kind,
                node_id: node_id.to_string(),
            })
            .is_some()
    }

    pub fn contains(&self, kind: MutationKind, node_id: &str) -> bool {
        self.tokens.contains_key(&Token {
            kind,
            node_id: node_id.to_string(),
        })
    }

    /// Drops tokens older than the TTL. Called by the periodic sweep timer.
    pub fn sweep(&mut self, now: Instant) {
        self.tokens
            .retain(|_, inserted_at| now.duration_since(*inserted_at) < PENDING_ACTION_TTL);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PendingUnlink {
    pub node_id: Option<String>,
    pub prev_checksum: Option<String>,
    pub prev_inode: Option<u64>,
    pub observed_at: Instant,
}

/// `relPath → observed delete`, held for the grace window so a subsequent
/// create can be paired into a rename/move instead of a delete+add.
#[derive(Debug, Default)]
pub struct PendingUnlinks {
    entries: HashMap<String, PendingUnlink>,
}

impl PendingUnlinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rel_path: impl Into<String>, entry: PendingUnlink) {
        self.entries.insert(rel_path.into(), entry);
    }

    pub fn remove(&mut self, rel_path: &str) -> Option<PendingUnlink> {
        self.entries.remove(rel_path)
    }

    pub fn get(&self, rel_path: &str) -> Option<&PendingUnlink> {
        self.entries.get(rel_path)
    }

    /// Finds an unlink still within its grace window — a candidate for
    /// correlation with an incoming create. Returns the best match by
    /// basename equality, preferring content/inode-confirmed identity to
    /// the caller.
    pub fn find_unexpired(
        &self,
        now: Instant,
    ) -> impl Iterator<Item = (&String, &PendingUnlink)> {
        self.entries
            .iter()
            .filter(move |(_, e)| now.duration_since(e.observed_at) < UNLINK_GRACE_WINDOW)
    }

    /// Returns relPaths whose grace window has expired: callers should
    /// commit these as real deletes.
    pub fn expired(&self, now: Instant) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.observed_at) >= UNLINK_GRACE_WINDOW)
            .map(|(path, _)| path.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn insert_then_consume_matches_once() {
        let mut pa = PendingActions::new();
        pa.insert(MutationKind::Rename, "42");
        assert!(pa.consume(MutationKind::Rename, "42"));
        assert!(!pa.consume(MutationKind::Rename, "42"));
    }

    #[test]
    fn different_kind_does_not_match() {
        let mut pa = PendingActions::new();
        pa.insert(MutationKind::Rename, "42");
        assert!(!pa.consume(MutationKind::Move, "42"));
    }

    #[test]
    fn sweep_drops_stale_tokens() {
        let mut pa = PendingActions::new();
        pa.insert(MutationKind::Delete, "1");
        let future = Instant::now() + PENDING_ACTION_TTL + Duration::from_secs(1);
        pa.sweep(future);
        assert!(pa.is_empty());
    }

    #[test]
    fn unlink_is_findable_within_grace_window_and_expires_after() {
        let mut unlinks = PendingUnlinks::new();
        unlinks.insert(
            "old.html",
            PendingUnlink {
                node_id: Some("1".into()),
                prev_checksum: Some("abc".into()),
                prev_inode: Some(9),
                observed_at: Instant::now(),
            },
        );
        assert_eq!(unlinks.find_unexpired(Instant::now()).count(), 1);

        sleep(UNLINK_GRACE_WINDOW + Duration::from_millis(50));
        assert_eq!(unlinks.find_unexpired(Instant::now()).count(), 0);
        assert_eq!(unlinks.expired(Instant::now()), vec!["old.html".to_string()]);
    }
}
