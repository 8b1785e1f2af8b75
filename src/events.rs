//! Typed pub/sub fanned out to the shell, replacing the ecosystem's
//! event-emitter pattern with a closed set of tagged variants (Design
//! Notes §9: "typed event channel... fanned out to subscribers").

use tokio::sync::broadcast;

/// One of the shell-facing event kinds enumerated in spec §6.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SyncStart,
    SyncComplete { stats: SyncStats },
    SyncError { file: Option<String>, message: String },
    SyncWarning { file: Option<String>, message: String },
    SyncStats { stats: SyncStats },
    SyncRetry { file: String, attempt: u32 },
    SyncFailed { file: String, message: String },
    FileSynced { file: String, action: FileAction },
    BackupCreated { file: String, backup_path: String },
    SyncConflict { file: String, message: String, suggestions: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Downloaded,
    Uploaded,
    Renamed,
    Moved,
    Trashed,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub files_downloaded: u32,
    pub files_downloaded_skipped: u32,
    pub files_uploaded: u32,
    pub files_protected: u32,
    pub files_trashed: u32,
    pub files_renamed: u32,
    pub files_moved: u32,
    pub errors: u32,
}

/// Broadcast hub. Cloning is cheap (an `Arc`-backed sender); every clone
/// shares the same subscriber set.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Best-effort publish: a lagged or subscriber-less bus must never
    /// block or fail the caller's sync operation.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SyncEvent::SyncStart);
        let got = rx.recv().await.unwrap();
        assert_eq!(got, SyncEvent::SyncStart);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(SyncEvent::SyncStart);
    }
}
