//! The owning engine (Design Notes §9): composes the watcher, SSE client,
//! upload queue, and reconciler behind one struct, so there are no cyclic
//! references between them — only the engine holds all of them, and it
//! injects itself (via the `Arc<Mutex<..>>` shared state below) wherever a
//! subsystem needs to read or mutate node-map/pending state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle;

use crate::api_client::ApiClient;
use crate::backup;
use crate::checksum::checksum_bytes;
use crate::clock::ClockCalibrator;
use crate::config::Config;
use crate::errors::SyncError;
use crate::events::{EventBus, FileAction, SyncEvent, SyncStats};
use crate::node_map::{self, NodeEntry, NodeMap, SyncState};
use crate::pending::{MutationKind, PendingActions, PendingUnlink, PendingUnlinks};
use crate::queue::{self, QueueKey, UploadKind, UploadQueue};
use crate::reconciler::Reconciler;
use crate::sse::{self, Action, FrameDecoder};
use crate::watcher::{self, Correlation, CorrelationKind, DebounceTracker, RawFsEvent, UnlinkCandidate};

struct SharedState {
    map: NodeMap,
    sync_state: SyncState,
    pending_actions: PendingActions,
    pending_unlinks: PendingUnlinks,
    queue: UploadQueue,
    clock: ClockCalibrator,
}

/// The sync engine: one struct owning every subsystem in spec §5's
/// concurrent-actor list. `Arc<Self>` is cloned into each spawned task.
pub struct Engine {
    root: PathBuf,
    api: ApiClient,
    events: EventBus,
    device_id: String,
    state: Arc<TokioMutex<SharedState>>,
    running: Arc<AtomicBool>,
    last_sse_activity: Arc<TokioMutex<Instant>>,
    tasks: TokioMutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let api = ApiClient::new(&config.server_url, &config.api_key, &config.device_id)?;
        let (map, sync_state) = node_map::load(&config.sync_folder);
        Ok(Arc::new(Self {
            root: config.sync_folder.clone(),
            api,
            events: EventBus::new(),
            device_id: config.device_id.clone(),
            state: Arc::new(TokioMutex::new(SharedState {
                map,
                sync_state,
                pending_actions: PendingActions::new(),
                pending_unlinks: PendingUnlinks::new(),
                queue: UploadQueue::new(),
                clock: ClockCalibrator::unsynced(),
            })),
            running: Arc::new(AtomicBool::new(false)),
            last_sse_activity: Arc::new(TokioMutex::new(Instant::now())),
            tasks: TokioMutex::new(Vec::new()),
        }))
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    async fn calibrate_clock(&self) -> ClockCalibrator {
        match self.api.status().await {
            Ok(status) => {
                let server_ms = status.server_time.timestamp_millis();
                let local_ms = chrono::Utc::now().timestamp_millis();
                ClockCalibrator::calibrate(server_ms, local_ms)
            }
            Err(err) => {
                self.events.publish(SyncEvent::SyncWarning {
                    file: None,
                    message: format!("clock calibration failed, assuming no skew: {err}"),
                });
                ClockCalibrator::unsynced()
            }
        }
    }

    /// One-shot reconcile: used by `sitesync sync` and by the SSE
    /// watchdog.
    pub async fn reconcile_once(&self) -> Result<SyncStats> {
        let clock = self.calibrate_clock().await;
        let mut state = self.state.lock().await;
        state.clock = clock;
        let clock = state.clock;
        let mut reconciler = Reconciler::new(self.root.clone(), self.api.clone(), self.events.clone());
        let stats = reconciler
            .reconcile(
                &mut state.map,
                &mut state.sync_state,
                &mut state.pending_actions,
                &clock,
            )
            .await?;
        Ok(stats)
    }

    /// Runs the engine until `shutdown` is notified: initial reconcile,
    /// then the watcher, SSE, queue-drain, and timer loops.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        if let Err(err) = self.reconcile_once().await {
            self.events.publish(SyncEvent::SyncError {
                file: None,
                message: format!("initial reconcile failed: {err}"),
            });
        }

        let (_watcher_handle, watcher_rx) =
            watcher::spawn(self.root.clone()).context("start filesystem watcher")?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(self.clone().watcher_loop(watcher_rx)));
        tasks.push(tokio::spawn(self.clone().queue_loop()));
        tasks.push(tokio::spawn(self.clone().sse_loop()));
        tasks.push(tokio::spawn(self.clone().pending_sweep_loop()));
        tasks.push(tokio::spawn(self.clone().sse_watchdog_loop()));
        *self.tasks.lock().await = tasks;

        // Keep `_watcher_handle` alive for the engine's lifetime.
        shutdown.notified().await;
        self.stop(_watcher_handle).await;
        Ok(())
    }

    async fn stop(&self, watcher_handle: watcher::Watcher) {
        self.running.store(false, Ordering::SeqCst);
        drop(watcher_handle);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        let mut state = self.state.lock().await;
        state.queue.clear();
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ---- watcher loop --------------------------------------------------

    async fn watcher_loop(self: Arc<Self>, mut rx: tokio::sync::mpsc::UnboundedReceiver<RawFsEvent>) {
        let mut debounce = DebounceTracker::new();
        while let Some(event) = rx.recv().await {
            if !self.running() {
                continue;
            }
            match event {
                RawFsEvent::Create(path) => {
                    let now = Instant::now();
                    debounce.touch(path.clone(), now);
                    self.clone().handle_watcher_create(path).await;
                }
                RawFsEvent::Modify(path) => {
                    let now = Instant::now();
                    debounce.touch(path.clone(), now);
                    self.handle_watcher_change(path).await;
                }
                RawFsEvent::Remove(path) => {
                    self.clone().handle_watcher_remove(path).await;
                }
            }
        }
    }

    fn rel_path(&self, path: &std::path::Path) -> Option<String> {
        if watcher::is_ignored(path, &self.root) {
            return None;
        }
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }

    fn is_site(rel_path: &str) -> bool {
        rel_path.ends_with(".html")
    }

    async fn handle_watcher_create(self: Arc<Self>, path: std::path::PathBuf) {
        let Some(rel_path) = self.rel_path(&path) else { return };
        if !path.is_file() {
            return;
        }
        let Ok(bytes) = std::fs::read(&path) else { return };
        let checksum = checksum_bytes(&bytes);
        let inode = node_map::inode_of(&path);

        let correlation = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let candidates: Vec<UnlinkCandidate> = state
                .pending_unlinks
                .find_unexpired(now)
                .map(|(rel, unlink)| UnlinkCandidate {
                    rel_path: rel.clone(),
                    node_id: unlink.node_id.clone(),
                    checksum: unlink.prev_checksum.clone(),
                    inode: unlink.prev_inode,
                })
                .collect();
            let correlation = watcher::correlate_create(&rel_path, &checksum, inode, &candidates);
            if let Some(c) = &correlation {
                state.pending_unlinks.remove(&c.old_rel_path);
            }
            correlation
        };

        match correlation {
            Some(c) => self.apply_offline_correlation(c).await,
            None => {
                self.enqueue_upload(&rel_path).await;
            }
        }
    }

    async fn apply_offline_correlation(self: Arc<Self>, c: Correlation) {
        let Some(node_id) = c.node_id.clone() else {
            self.enqueue_upload(&c.new_rel_path).await;
            return;
        };
        {
            let mut state = self.state.lock().await;
            let kind = match c.kind {
                CorrelationKind::Rename => MutationKind::Rename,
                CorrelationKind::Move | CorrelationKind::MoveAndRename => MutationKind::Move,
            };
            state.pending_actions.insert(kind, &node_id);
        }

        let result = match c.kind {
            CorrelationKind::Rename => {
                let new_name = strip_html(basename(&c.new_rel_path));
                self.api.rename(&node_id, new_name).await
            }
            CorrelationKind::Move => {
                let target_folder = parent_dir(&c.new_rel_path);
                self.api.move_node(&node_id, target_folder).await
            }
            CorrelationKind::MoveAndRename => {
                let target_folder = parent_dir(&c.new_rel_path);
                let new_name = strip_html(basename(&c.new_rel_path));
                match self.api.move_node(&node_id, target_folder).await {
                    Ok(()) => self.api.rename(&node_id, new_name).await,
                    Err(err) => Err(err),
                }
            }
        };

        match result {
            Ok(()) => {
                let mut state = self.state.lock().await;
                let inode = node_map::inode_of(&self.root.join(&c.new_rel_path));
                let checksum = std::fs::read(self.root.join(&c.new_rel_path))
                    .ok()
                    .map(|b| checksum_bytes(&b));
                state.map.insert(
                    node_id,
                    NodeEntry {
                        path: c.new_rel_path.clone(),
                        checksum,
                        inode,
                    },
                );
                let action = match c.kind {
                    CorrelationKind::Rename => FileAction::Renamed,
                    _ => FileAction::Moved,
                };
                self.events.publish(SyncEvent::FileSynced {
                    file: c.new_rel_path,
                    action,
                });
            }
            Err(err) => {
                self.events.publish(SyncEvent::SyncError {
                    file: Some(c.new_rel_path),
                    message: err.to_string(),
                });
            }
        }
    }

    async fn handle_watcher_change(&self, path: std::path::PathBuf) {
        let Some(rel_path) = self.rel_path(&path) else { return };
        if !path.is_file() {
            return;
        }
        self.enqueue_upload(&rel_path).await;
    }

    async fn handle_watcher_remove(self: Arc<Self>, path: std::path::PathBuf) {
        let Some(rel_path) = self.rel_path(&path) else { return };
        let grace_info = {
            let state = self.state.lock().await;
            let node_id = state.map.id_for_path(&rel_path);
            let entry = node_id.as_deref().and_then(|id| state.map.get(id)).cloned();
            (node_id, entry)
        };
        {
            let mut state = self.state.lock().await;
            state.pending_unlinks.insert(
                rel_path.clone(),
                PendingUnlink {
                    node_id: grace_info.0.clone(),
                    prev_checksum: grace_info.1.as_ref().and_then(|e| e.checksum.clone()),
                    prev_inode: grace_info.1.as_ref().and_then(|e| e.inode),
                    observed_at: Instant::now(),
                },
            );
        }

        // Hold for the grace window, then commit as a real delete unless
        // a paired create already consumed this unlink.
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(watcher::WRITE_SETTLE_DEBOUNCE).await;
            engine.commit_delete_if_still_pending(&rel_path).await;
        });
    }

    async fn commit_delete_if_still_pending(&self, rel_path: &str) {
        let still_pending = {
            let mut state = self.state.lock().await;
            state.pending_unlinks.remove(rel_path)
        };
        let Some(unlink) = still_pending else { return };
        let Some(node_id) = unlink.node_id else { return };

        {
            let mut state = self.state.lock().await;
            state.pending_actions.insert(MutationKind::Delete, &node_id);
        }
        if let Err(err) = self.api.delete(&node_id).await {
            self.events.publish(SyncEvent::SyncError {
                file: Some(rel_path.to_string()),
                message: err.to_string(),
            });
            return;
        }
        let mut state = self.state.lock().await;
        state.map.remove(&node_id);
        self.events.publish(SyncEvent::FileSynced {
            file: rel_path.to_string(),
            action: FileAction::Trashed,
        });
    }

    async fn enqueue_upload(&self, rel_path: &str) {
        let mut state = self.state.lock().await;
        let key = if Self::is_site(rel_path) {
            QueueKey::site(rel_path)
        } else {
            QueueKey::upload(rel_path)
        };
        state.queue.enqueue(key);
    }

    // ---- queue drain loop -----------------------------------------------

    async fn queue_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(queue::DEBOUNCE);
        loop {
            interval.tick().await;
            if !self.running() {
                continue;
            }
            loop {
                let entry = {
                    let mut state = self.state.lock().await;
                    state.queue.pop_front()
                };
                let Some(entry) = entry else { break };
                self.clone().process_queue_entry(entry).await;
            }
        }
    }

    async fn process_queue_entry(self: Arc<Self>, entry: queue::QueueEntry) {
        let rel_path = entry.key.rel_path.clone();
        let local_path = self.root.join(&rel_path);
        if !local_path.exists() {
            return; // retry re-check: source vanished, drop silently
        }

        let result = match &entry.key.kind {
            UploadKind::Site => self.upload_site(&rel_path).await,
            UploadKind::Upload => self.upload_binary(&rel_path).await,
        };

        if let Err(err) = result {
            if queue::is_retryable(&err) {
                let mut state = self.state.lock().await;
                if let Some(retry_entry) = state.queue.requeue_for_retry(entry.clone()) {
                    drop(state);
                    self.events.publish(SyncEvent::SyncRetry {
                        file: rel_path.clone(),
                        attempt: retry_entry.attempt,
                    });
                    let engine = self.clone();
                    let delay = queue::backoff_for_attempt(retry_entry.attempt);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let mut state = engine.state.lock().await;
                        state.queue.enqueue(retry_entry.key);
                    });
                } else {
                    self.events.publish(SyncEvent::SyncFailed {
                        file: rel_path,
                        message: err.to_string(),
                    });
                }
            } else {
                let suggestions = crate::errors::downcast(&err)
                    .map(|e| e.suggestions.clone())
                    .unwrap_or_default();
                if !suggestions.is_empty() {
                    self.events.publish(SyncEvent::SyncConflict {
                        file: rel_path,
                        message: err.to_string(),
                        suggestions,
                    });
                } else {
                    self.events.publish(SyncEvent::SyncFailed {
                        file: rel_path,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    async fn upload_site(&self, rel_path: &str) -> Result<()> {
        let validation = crate::validator::validate_site_path(rel_path);
        if !validation.valid {
            return Err(SyncError::validation(validation.reason.unwrap_or_default()).into());
        }
        let local_path = self.root.join(rel_path);
        let content = std::fs::read_to_string(&local_path)
            .with_context(|| format!("read {}", local_path.display()))?;
        let checksum = checksum_bytes(content.as_bytes());
        let mtime_ms = crate::reconciler::mtime_millis(&local_path)?;

        {
            let state = self.state.lock().await;
            let skip = state
                .map
                .iter()
                .find(|(_, e)| e.path == rel_path)
                .and_then(|(_, e)| e.checksum.clone())
                .map(|existing| existing == checksum)
                .unwrap_or(false);
            if skip {
                drop(state);
                self.events.publish(SyncEvent::FileSynced {
                    file: rel_path.to_string(),
                    action: FileAction::Skipped,
                });
                return Ok(());
            }
        }

        let modified_at =
            chrono::DateTime::from_timestamp_millis(mtime_ms).unwrap_or_else(chrono::Utc::now);
        let name = strip_html(basename(rel_path));

        // The server keys uploads by filename, not node id, so a known
        // file's edit reuses the same upload call as a brand-new one.
        let result = self.api.upload(name, &content, modified_at, None, true).await?;
        let mut state = self.state.lock().await;
        state.map.insert(
            result.node_id,
            NodeEntry {
                path: rel_path.to_string(),
                checksum: Some(checksum),
                inode: node_map::inode_of(&local_path),
            },
        );
        drop(state);
        self.events.publish(SyncEvent::FileSynced {
            file: rel_path.to_string(),
            action: FileAction::Uploaded,
        });
        Ok(())
    }

    async fn upload_binary(&self, rel_path: &str) -> Result<()> {
        let local_path = self.root.join(rel_path);
        let bytes = std::fs::read(&local_path).with_context(|| format!("read {}", local_path.display()))?;
        let validation = crate::validator::validate_upload_path(rel_path, bytes.len() as u64);
        if !validation.valid {
            return Err(SyncError::validation(validation.reason.unwrap_or_default()).into());
        }
        let mtime_ms = crate::reconciler::mtime_millis(&local_path)?;
        let modified_at =
            chrono::DateTime::from_timestamp_millis(mtime_ms).unwrap_or_else(chrono::Utc::now);
        self.api.upload_upload(rel_path, &bytes, modified_at).await?;
        self.events.publish(SyncEvent::FileSynced {
            file: rel_path.to_string(),
            action: FileAction::Uploaded,
        });
        Ok(())
    }

    // ---- SSE loop ---------------------------------------------------------

    async fn sse_loop(self: Arc<Self>) {
        loop {
            if !self.running() {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                continue;
            }
            match self.api.open_stream().await {
                Ok(mut stream) => {
                    let mut decoder = FrameDecoder::new();
                    *self.last_sse_activity.lock().await = Instant::now();
                    while let Some(chunk) = stream.next().await {
                        if !self.running() {
                            break;
                        }
                        let Ok(bytes) = chunk else { break };
                        *self.last_sse_activity.lock().await = Instant::now();
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        for payload in decoder.push(&text) {
                            self.handle_sse_payload(&payload).await;
                        }
                    }
                }
                Err(err) => {
                    self.events.publish(SyncEvent::SyncWarning {
                        file: None,
                        message: format!("SSE connection failed: {err}"),
                    });
                }
            }
            tokio::time::sleep(sse::RECONNECT_DELAY).await;
        }
    }

    async fn handle_sse_payload(&self, payload: &str) {
        let message = match sse::parse_message(payload) {
            Ok(m) => m,
            Err(err) => {
                self.events.publish(SyncEvent::SyncWarning {
                    file: None,
                    message: format!("unparseable SSE message: {err}"),
                });
                return;
            }
        };

        let local_checksum = if let crate::sse::SseMessage::FileSaved { node_id, .. } = &message {
            let state = self.state.lock().await;
            state.map.get(node_id).and_then(|e| e.checksum.clone())
        } else {
            None
        };

        let action = {
            let mut state = self.state.lock().await;
            sse::dispatch(message, &mut state.pending_actions, &self.device_id, local_checksum.as_deref())
        };

        self.apply_sse_action(action).await;
    }

    async fn apply_sse_action(&self, action: Action) {
        match action {
            Action::Ignore => {}
            Action::RelayLiveSync { .. } => {
                // Browser-to-browser relay is the embedded HTTP server's
                // job (out of scope, spec §1); the core only decides
                // whether to forward it.
            }
            Action::WriteThrough {
                file,
                content,
                checksum,
                modified_at: _,
                node_id,
            } => {
                if let Ok(Some(backup_path)) = backup::backup_if_exists(&self.root, &file, Self::is_site(&file)) {
                    self.events.publish(SyncEvent::BackupCreated {
                        file: file.clone(),
                        backup_path: backup_path.to_string_lossy().into_owned(),
                    });
                }
                let dest = self.root.join(&file);
                if let Some(parent) = dest.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if std::fs::write(&dest, content.as_bytes()).is_ok() {
                    let mut state = self.state.lock().await;
                    state.map.insert(
                        node_id,
                        NodeEntry {
                            path: file.clone(),
                            checksum: Some(checksum),
                            inode: node_map::inode_of(&dest),
                        },
                    );
                    drop(state);
                    self.events.publish(SyncEvent::FileSynced {
                        file,
                        action: FileAction::Downloaded,
                    });
                }
            }
            Action::MoveOnDisk {
                node_id,
                old_name: _,
                new_name,
            } => {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.map.get(&node_id).cloned() {
                    let new_rel = sibling_path(&entry.path, &format!("{new_name}.html"));
                    let from = self.root.join(&entry.path);
                    let to = self.root.join(&new_rel);
                    if from.exists() {
                        if let Some(parent) = to.parent() {
                            let _ = std::fs::create_dir_all(parent);
                        }
                        let _ = std::fs::rename(&from, &to);
                    }
                    state.map.insert(
                        node_id,
                        NodeEntry {
                            path: new_rel.clone(),
                            checksum: entry.checksum,
                            inode: node_map::inode_of(&to),
                        },
                    );
                    drop(state);
                    self.events.publish(SyncEvent::FileSynced {
                        file: new_rel,
                        action: FileAction::Renamed,
                    });
                }
            }
            Action::MoveFolder {
                node_id,
                from_path: _,
                to_path,
            } => {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.map.get(&node_id).cloned() {
                    let from = self.root.join(&entry.path);
                    let to = self.root.join(&to_path);
                    if from.exists() {
                        if let Some(parent) = to.parent() {
                            let _ = std::fs::create_dir_all(parent);
                        }
                        let _ = std::fs::rename(&from, &to);
                    }
                    state.map.insert(
                        node_id,
                        NodeEntry {
                            path: to_path.clone(),
                            checksum: entry.checksum,
                            inode: node_map::inode_of(&to),
                        },
                    );
                    drop(state);
                    self.events.publish(SyncEvent::FileSynced {
                        file: to_path,
                        action: FileAction::Moved,
                    });
                }
            }
            Action::TrashLocally { node_id, file } => {
                if let Ok(Some(_)) = backup::trash(&self.root, &file) {
                    let mut state = self.state.lock().await;
                    state.map.remove(&node_id);
                    drop(state);
                    self.events.publish(SyncEvent::FileSynced {
                        file,
                        action: FileAction::Trashed,
                    });
                }
            }
        }
    }

    // ---- timers -----------------------------------------------------------

    async fn pending_sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(crate::pending::PENDING_ACTION_TTL);
        loop {
            interval.tick().await;
            let mut state = self.state.lock().await;
            state.pending_actions.sweep(Instant::now());
        }
    }

    async fn sse_watchdog_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(sse::WATCHDOG_INTERVAL);
        loop {
            interval.tick().await;
            if !self.running() {
                continue;
            }
            let silent_for = {
                let last = *self.last_sse_activity.lock().await;
                last.elapsed()
            };
            if silent_for > sse::SILENCE_THRESHOLD {
                if let Err(err) = self.reconcile_once().await {
                    self.events.publish(SyncEvent::SyncError {
                        file: None,
                        message: format!("watchdog reconcile failed: {err}"),
                    });
                }
                *self.last_sse_activity.lock().await = Instant::now();
            }
        }
    }
}

fn basename(rel_path: &str) -> &str {
    std::path::Path::new(rel_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(rel_path)
}

fn parent_dir(rel_path: &str) -> &str {
    std::path::Path::new(rel_path)
        .parent()
        .and_then(|p| p.to_str())
        .unwrap_or("")
}

fn strip_html(name: &str) -> &str {
    name.strip_suffix(".html").unwrap_or(name)
}

fn sibling_path(old_rel_path: &str, new_basename: &str) -> String {
    let dir = parent_dir(old_rel_path);
    if dir.is_empty() {
        new_basename.to_string()
    } else {
        format!("{dir}/{new_basename}")
    }
}
