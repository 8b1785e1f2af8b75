//! Upload queue and bounded retry (spec §4.8). The FIFO/dedup/backoff
//! bookkeeping here is plain, synchronous, and unit-testable; the engine
//! drives it with real timers and the API client.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

pub const DEBOUNCE: Duration = Duration::from_millis(500);
pub const MAX_RETRIES: u32 = 3;
pub const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UploadKind {
    Site,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKey {
    pub kind: UploadKind,
    pub rel_path: String,
}

impl QueueKey {
    pub fn site(rel_path: impl Into<String>) -> Self {
        Self {
            kind: UploadKind::Site,
            rel_path: rel_path.into(),
        }
    }

    pub fn upload(rel_path: impl Into<String>) -> Self {
        Self {
            kind: UploadKind::Upload,
            rel_path: rel_path.into(),
        }
    }

    fn token(&self) -> String {
        match self.kind {
            UploadKind::Site => format!("site:{}", self.rel_path),
            UploadKind::Upload => format!("upload:{}", self.rel_path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub key: QueueKey,
    pub attempt: u32,
}

/// FIFO with same-key dedup: re-enqueuing a key already waiting collapses
/// to the one entry, preserving its original position (the debounce timer
/// isn't reset — a burst of writes to the same file drains once).
#[derive(Debug, Default)]
pub struct UploadQueue {
    order: VecDeque<String>,
    entries: HashMap<String, QueueEntry>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, key: QueueKey) {
        let token = key.token();
        if !self.entries.contains_key(&token) {
            self.order.push_back(token.clone());
        }
        self.entries.insert(token, QueueEntry { key, attempt: 0 });
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Removes and returns the next entry to process, in FIFO order.
    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        while let Some(token) = self.order.pop_front() {
            if let Some(entry) = self.entries.remove(&token) {
                return Some(entry);
            }
        }
        None
    }

    /// Re-enqueues an entry for retry, bumping its attempt count. Returns
    /// `None` (drops it) if `MAX_RETRIES` has been exhausted.
    pub fn requeue_for_retry(&mut self, mut entry: QueueEntry) -> Option<QueueEntry> {
        entry.attempt += 1;
        if entry.attempt > MAX_RETRIES {
            return None;
        }
        Some(entry)
    }

    /// Cancels all pending work — called by `stop()`.
    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

/// Backoff delay for a given (1-based) retry attempt. Attempt 1 uses the
/// first schedule entry, etc.; beyond the schedule length, the last delay
/// repeats (defensive — `MAX_RETRIES` keeps this from being reached).
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let idx = (attempt.saturating_sub(1)) as usize;
    BACKOFF_SCHEDULE
        .get(idx)
        .copied()
        .unwrap_or(*BACKOFF_SCHEDULE.last().unwrap())
}

/// The retryability predicate from spec §7/§4.8: network-shaped failures
/// are retried with backoff; everything else (auth, name conflict, file
/// access, validation) surfaces immediately. A bare `reqwest::Error`
/// reaching here (connect refused, timeout, DNS) never got the chance to
/// be classified into a `SyncError` at all, since the call failed before a
/// response existed to classify — that's still the "fetch/network/timeout"
/// bucket spec §7 calls retryable, so it's treated the same as `Network`.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(typed) = crate::errors::downcast(err) {
        return typed.is_retryable();
    }
    err.chain().any(|cause| cause.downcast_ref::<reqwest::Error>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_key_collapses_to_one_entry_in_original_position() {
        let mut q = UploadQueue::new();
        q.enqueue(QueueKey::site("a.html"));
        q.enqueue(QueueKey::site("b.html"));
        q.enqueue(QueueKey::site("a.html")); // dup, collapses
        assert_eq!(q.len(), 2);
        let first = q.pop_front().unwrap();
        assert_eq!(first.key.rel_path, "a.html");
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut q = UploadQueue::new();
        q.enqueue(QueueKey::site("a.html"));
        q.enqueue(QueueKey::upload("b.png"));
        assert_eq!(q.pop_front().unwrap().key.rel_path, "a.html");
        assert_eq!(q.pop_front().unwrap().key.rel_path, "b.png");
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn retry_is_dropped_after_max_retries() {
        let mut q = UploadQueue::new();
        let mut entry = QueueEntry {
            key: QueueKey::site("a.html"),
            attempt: 0,
        };
        for _ in 0..MAX_RETRIES {
            entry = q.requeue_for_retry(entry).expect("retry allowed");
        }
        assert!(q.requeue_for_retry(entry).is_none());
    }

    #[test]
    fn backoff_follows_fixed_schedule() {
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(10));
        assert_eq!(backoff_for_attempt(3), Duration::from_secs(30));
    }

    #[test]
    fn clear_drops_all_pending_work() {
        let mut q = UploadQueue::new();
        q.enqueue(QueueKey::site("a.html"));
        q.enqueue(QueueKey::upload("b.png"));
        q.clear();
        assert!(q.is_empty());
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn network_errors_are_retryable_others_are_not() {
        let network: anyhow::Error = crate::errors::SyncError::network("timeout").into();
        let auth: anyhow::Error = crate::errors::SyncError::auth("expired").into();
        assert!(is_retryable(&network));
        assert!(!is_retryable(&auth));
    }

    #[test]
    fn untyped_anyhow_error_without_a_reqwest_cause_is_not_retryable() {
        let err = anyhow::anyhow!("some unrelated failure");
        assert!(!is_retryable(&err));
    }
}
