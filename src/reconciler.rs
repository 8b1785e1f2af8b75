//! The reconciler (spec §4.5): the only writer of node-map entries besides
//! the watcher and SSE handlers. Runs in three phases on startup, on
//! reconnect, and on demand.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use walkdir::WalkDir;

use crate::api_client::{ApiClient, SiteListing};
use crate::backup;
use crate::cache::SnapshotCache;
use crate::checksum::checksum_bytes;
use crate::clock::ClockCalibrator;
use crate::events::{EventBus, FileAction, SyncEvent, SyncStats};
use crate::node_map::{self, NodeEntry, NodeMap, SyncState};
use crate::pending::{MutationKind, PendingActions};

/// Per-site decision in Phase A, factored out as a pure function of the
/// comparison inputs so it's unit-testable without a server or a clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseADecision {
    Download,
    DownloadSkipped,
    Protected,
}

pub fn phase_a_decision(
    local_exists: bool,
    is_future_dated: bool,
    is_local_newer: bool,
    checksum_matches: bool,
) -> PhaseADecision {
    if !local_exists {
        return PhaseADecision::Download;
    }
    if is_future_dated || is_local_newer {
        return PhaseADecision::Protected;
    }
    if checksum_matches {
        return PhaseADecision::DownloadSkipped;
    }
    PhaseADecision::Download
}

/// Phase B: a node id the server no longer lists, only consulted once
/// `lastSyncedAt` is set (I5 — first sync never trashes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseBDecision {
    /// Edited offline after our last known-good state: keep the file,
    /// drop the map entry (phase C re-uploads it as a fresh node).
    KeepAndForget,
    /// Not edited since last sync: the server deletion is authoritative.
    Trash,
}

pub fn phase_b_decision(local_mtime_ms: i64, last_synced_at_ms: i64) -> PhaseBDecision {
    if local_mtime_ms > last_synced_at_ms {
        PhaseBDecision::KeepAndForget
    } else {
        PhaseBDecision::Trash
    }
}

/// Phase C offline-delete conflict check: the server may have a newer edit
/// we haven't pulled down yet, in which case the "delete" was really an
/// offline-edit race we should resolve by redownloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteConflictDecision {
    Redownload,
    Delete,
}

pub fn delete_conflict_decision(
    server_modified_ms: i64,
    last_synced_at_ms: i64,
) -> DeleteConflictDecision {
    if server_modified_ms > last_synced_at_ms {
        DeleteConflictDecision::Redownload
    } else {
        DeleteConflictDecision::Delete
    }
}

/// Offline structural-change classification for an orphaned map entry
/// (phase C steps 1-4), given what the local-only file index reveals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineChange {
    Move { new_rel_path: String },
    Rename { new_rel_path: String },
    Delete,
}

/// Finds what happened, offline, to the file previously at `entry.path`
/// by matching against the unassigned local files. Order matters: same
/// basename at a new folder is a move; identity by inode, then by
/// checksum, is a rename; no match is a delete.
pub fn classify_offline_change(
    entry: &NodeEntry,
    unassigned: &[LocalFile],
) -> OfflineChange {
    let old_path = Path::new(&entry.path);
    let old_basename = old_path.file_name().and_then(|n| n.to_str());

    if let Some(basename) = old_basename {
        if let Some(candidate) = unassigned.iter().find(|f| {
            Path::new(&f.rel_path)
                .file_name()
                .and_then(|n| n.to_str())
                == Some(basename)
                && f.rel_path != entry.path
        }) {
            return OfflineChange::Move {
                new_rel_path: candidate.rel_path.clone(),
            };
        }
    }

    if let Some(inode) = entry.inode {
        if let Some(candidate) = unassigned.iter().find(|f| f.inode == Some(inode)) {
            return OfflineChange::Rename {
                new_rel_path: candidate.rel_path.clone(),
            };
        }
    }

    if let Some(checksum) = &entry.checksum {
        if let Some(candidate) = unassigned.iter().find(|f| &f.checksum == checksum) {
            return OfflineChange::Rename {
                new_rel_path: candidate.rel_path.clone(),
            };
        }
    }

    OfflineChange::Delete
}

#[derive(Debug, Clone)]
pub struct LocalFile {
    pub rel_path: String,
    pub checksum: String,
    pub inode: Option<u64>,
    pub mtime_ms: i64,
}

/// Phase A step 2: finds an unassigned local file that already holds the
/// same bytes as a server node we've never mapped, so it can be moved into
/// place instead of downloaded fresh. Factored out as a pure function of
/// the index and the already-claimed paths so it's unit-testable without
/// touching disk.
pub fn find_checksum_correlation<'a>(
    remote_checksum: &str,
    remote_path: &str,
    mapped_paths: &HashSet<&str>,
    local_index: &'a HashMap<String, LocalFile>,
) -> Option<&'a LocalFile> {
    local_index.values().find(|f| {
        f.checksum == remote_checksum
            && f.rel_path != remote_path
            && !mapped_paths.contains(f.rel_path.as_str())
    })
}

/// Walks the sync root (sites only: `*.html`, skipping ignored segments)
/// and returns every local file indexed by relative path.
pub fn index_local_sites(root: &Path) -> Result<HashMap<String, LocalFile>> {
    let mut out = HashMap::new();
    for entry in WalkDir::new(root).into_iter().filter_entry(|e| !is_ignored(e.path(), root)) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("html") {
            continue;
        }
        let rel_path = relativize(root, path);
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let checksum = checksum_bytes(&bytes);
        let inode = node_map::inode_of(path);
        let mtime_ms = mtime_millis(path)?;
        out.insert(
            rel_path.clone(),
            LocalFile {
                rel_path,
                checksum,
                inode,
                mtime_ms,
            },
        );
    }
    Ok(out)
}

fn relativize(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn mtime_millis(path: &Path) -> Result<i64> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let modified = meta.modified().with_context(|| format!("mtime {}", path.display()))?;
    let dur = modified
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(dur.as_millis() as i64)
}

/// Ignored path segments shared with the watcher (spec §4.6).
pub fn is_ignored(path: &Path, root: &Path) -> bool {
    if path == root {
        return false;
    }
    for comp in path.components() {
        let seg = comp.as_os_str().to_string_lossy();
        if seg.starts_with('.')
            || seg == "node_modules"
            || seg == "sites-versions"
            || seg == "tailwindcss"
            || seg == "Thumbs.db"
        {
            return true;
        }
    }
    false
}

pub struct Reconciler {
    root: std::path::PathBuf,
    api: ApiClient,
    events: EventBus,
    sites_cache: SnapshotCache<Vec<SiteListing>>,
}

impl Reconciler {
    pub fn new(root: impl Into<std::path::PathBuf>, api: ApiClient, events: EventBus) -> Self {
        Self {
            root: root.into(),
            api,
            events,
            sites_cache: SnapshotCache::new(),
        }
    }

    pub fn sites_cache(&self) -> &SnapshotCache<Vec<SiteListing>> {
        &self.sites_cache
    }

    /// Runs the full reconcile (phases A, B, C) and returns accumulated
    /// stats. `clock` must already reflect a calibrated (or unsynced)
    /// offset.
    pub async fn reconcile(
        &mut self,
        map: &mut NodeMap,
        state: &mut SyncState,
        pending: &mut PendingActions,
        clock: &ClockCalibrator,
    ) -> Result<SyncStats> {
        self.events.publish(SyncEvent::SyncStart);
        let mut stats = SyncStats::default();

        let listing = self.api.list_sites().await.context("list_sites")?;
        self.sites_cache.set(listing.clone(), Instant::now());

        let now_ms = Utc::now().timestamp_millis();
        let mut local_index = index_local_sites(&self.root)?;
        let server_ids: HashSet<String> = listing.iter().map(|s| s.node_id.clone()).collect();

        // Phase A — server-authoritative sweep.
        for remote in &listing {
            if let Err(err) = self
                .phase_a_one(remote, map, &mut local_index, clock, now_ms, &mut stats)
                .await
            {
                stats.errors += 1;
                self.events.publish(SyncEvent::SyncError {
                    file: Some(remote.path.clone()),
                    message: err.to_string(),
                });
            }
        }

        // Phase B — server-deletion sweep, only once we have a baseline.
        if let Some(last_synced_at) = state.last_synced_at {
            let gone: Vec<String> = map
                .iter()
                .filter(|(id, _)| !server_ids.contains(*id))
                .map(|(id, _)| id.clone())
                .collect();
            for node_id in gone {
                if let Err(err) = self.phase_b_one(&node_id, map, last_synced_at, &mut stats) {
                    stats.errors += 1;
                    self.events.publish(SyncEvent::SyncError {
                        file: None,
                        message: err.to_string(),
                    });
                }
            }
        }

        // Phase C — local-only sweep and offline-change detection.
        let local_index = index_local_sites(&self.root)?;
        if state.last_synced_at.is_some() {
            self.phase_c_offline_changes(map, &local_index, state, pending, &mut stats)
                .await;
        }
        self.phase_c_upload_new(map, &local_index, &listing, &mut stats)
            .await;

        if let Err(err) = self.reconcile_uploads(clock, &mut stats).await {
            stats.errors += 1;
            self.events.publish(SyncEvent::SyncError {
                file: None,
                message: format!("upload reconcile failed: {err}"),
            });
        }

        state.last_synced_at = Some(now_ms);
        node_map::save(&self.root, map).context("save node map")?;
        node_map::save_state(&self.root, state).context("save sync state")?;

        self.events.publish(SyncEvent::SyncStats { stats: stats.clone() });
        self.events.publish(SyncEvent::SyncComplete { stats: stats.clone() });
        Ok(stats)
    }

    async fn phase_a_one(
        &self,
        remote: &SiteListing,
        map: &mut NodeMap,
        local_index: &mut HashMap<String, LocalFile>,
        clock: &ClockCalibrator,
        now_ms: i64,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let local_path = self.root.join(&remote.path);
        let mut local_exists = local_path.exists();

        // Step 1: the id is known under a different local path — move it
        // into place rather than re-downloading.
        if !local_exists {
            if let Some(entry) = map.get(&remote.node_id) {
                let known_path = self.root.join(&entry.path);
                if entry.path != remote.path && known_path.exists() {
                    move_local_file(&self.root, &entry.path, &remote.path)?;
                    local_index.remove(&entry.path);
                    local_exists = true;
                }
            }
        }

        // Step 2: cold start (or any node id the map has never seen) —
        // correlate by checksum against the as-yet-unassigned local tree
        // before falling back to a download. A pre-existing local file with
        // byte-identical content just needs moving into place, not
        // re-fetching.
        if !local_exists && map.get(&remote.node_id).is_none() {
            let mapped_paths: HashSet<&str> = map.iter().map(|(_, e)| e.path.as_str()).collect();
            let candidate = find_checksum_correlation(&remote.checksum, &remote.path, &mapped_paths, local_index)
                .map(|f| f.rel_path.clone());

            if let Some(candidate_path) = candidate {
                move_local_file(&self.root, &candidate_path, &remote.path)?;
                local_index.remove(&candidate_path);
                let inode = node_map::inode_of(&self.root.join(&remote.path));
                map.insert(
                    remote.node_id.clone(),
                    NodeEntry {
                        path: remote.path.clone(),
                        checksum: Some(remote.checksum.clone()),
                        inode,
                    },
                );
                stats.files_downloaded_skipped += 1;
                self.events.publish(SyncEvent::FileSynced {
                    file: remote.path.clone(),
                    action: FileAction::Skipped,
                });
                return Ok(());
            }
        }

        if !local_exists {
            let result = self.api.download(strip_html(&remote.path)).await?;
            write_with_backup(&self.root, &remote.path, result.content.as_bytes(), true, &self.events)?;
            let inode = node_map::inode_of(&self.root.join(&remote.path));
            map.insert(
                remote.node_id.clone(),
                NodeEntry {
                    path: remote.path.clone(),
                    checksum: Some(result.checksum),
                    inode,
                },
            );
            stats.files_downloaded += 1;
            self.events.publish(SyncEvent::FileSynced {
                file: remote.path.clone(),
                action: FileAction::Downloaded,
            });
            return Ok(());
        }

        let bytes = std::fs::read(&local_path).with_context(|| format!("read {}", local_path.display()))?;
        let local_checksum = checksum_bytes(&bytes);
        let local_mtime = mtime_millis(&local_path)?;

        let future_dated = clock.is_future_dated(local_mtime, now_ms);
        let local_newer = clock.is_local_newer(local_mtime, remote.modified_at.timestamp_millis());
        let checksum_matches = local_checksum == remote.checksum;

        match phase_a_decision(true, future_dated, local_newer, checksum_matches) {
            PhaseADecision::Protected => {
                stats.files_protected += 1;
            }
            PhaseADecision::DownloadSkipped => {
                stats.files_downloaded_skipped += 1;
                let inode = node_map::inode_of(&local_path);
                map.insert(
                    remote.node_id.clone(),
                    NodeEntry {
                        path: remote.path.clone(),
                        checksum: Some(local_checksum),
                        inode,
                    },
                );
                self.events.publish(SyncEvent::FileSynced {
                    file: remote.path.clone(),
                    action: FileAction::Skipped,
                });
            }
            PhaseADecision::Download => {
                let result = self.api.download(strip_html(&remote.path)).await?;
                write_with_backup(&self.root, &remote.path, result.content.as_bytes(), true, &self.events)?;
                let inode = node_map::inode_of(&local_path);
                map.insert(
                    remote.node_id.clone(),
                    NodeEntry {
                        path: remote.path.clone(),
                        checksum: Some(result.checksum),
                        inode,
                    },
                );
                stats.files_downloaded += 1;
                self.events.publish(SyncEvent::FileSynced {
                    file: remote.path.clone(),
                    action: FileAction::Downloaded,
                });
            }
        }
        Ok(())
    }

    fn phase_b_one(
        &self,
        node_id: &str,
        map: &mut NodeMap,
        last_synced_at: i64,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let Some(entry) = map.get(node_id).cloned() else {
            return Ok(());
        };
        let local_path = self.root.join(&entry.path);
        if local_path.exists() {
            let mtime = mtime_millis(&local_path)?;
            match phase_b_decision(mtime, last_synced_at) {
                PhaseBDecision::KeepAndForget => {
                    map.remove(node_id);
                    return Ok(());
                }
                PhaseBDecision::Trash => {}
            }
        }
        if let Some(dest) = backup::trash(&self.root, &entry.path)? {
            stats.files_trashed += 1;
            self.events.publish(SyncEvent::FileSynced {
                file: entry.path.clone(),
                action: FileAction::Trashed,
            });
            let _ = dest;
        }
        map.remove(node_id);
        Ok(())
    }

    async fn phase_c_offline_changes(
        &self,
        map: &mut NodeMap,
        local_index: &HashMap<String, LocalFile>,
        state: &SyncState,
        pending: &mut PendingActions,
        stats: &mut SyncStats,
    ) {
        let last_synced_at = state.last_synced_at.unwrap_or(0);
        let mapped_paths: HashSet<String> = map.iter().map(|(_, e)| e.path.clone()).collect();

        let orphaned: Vec<(String, NodeEntry)> = map
            .iter()
            .filter(|(_, e)| !local_index.contains_key(&e.path))
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();

        for (node_id, entry) in orphaned {
            let unassigned: Vec<LocalFile> = local_index
                .values()
                .filter(|f| !mapped_paths.contains(&f.rel_path))
                .cloned()
                .collect();

            match classify_offline_change(&entry, &unassigned) {
                OfflineChange::Move { new_rel_path } => {
                    let target_folder = parent_folder(&new_rel_path);
                    pending.insert(MutationKind::Move, &node_id);
                    if let Err(err) = self.api.move_node(&node_id, &target_folder).await {
                        stats.errors += 1;
                        self.events.publish(SyncEvent::SyncError {
                            file: Some(entry.path.clone()),
                            message: err.to_string(),
                        });
                        continue;
                    }
                    map.insert(
                        node_id,
                        NodeEntry {
                            path: new_rel_path.clone(),
                            checksum: entry.checksum.clone(),
                            inode: local_index.get(&new_rel_path).and_then(|f| f.inode),
                        },
                    );
                    stats.files_moved += 1;
                    self.events.publish(SyncEvent::FileSynced {
                        file: new_rel_path,
                        action: FileAction::Moved,
                    });
                }
                OfflineChange::Rename { new_rel_path } => {
                    let new_name = strip_html(
                        Path::new(&new_rel_path)
                            .file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or(&new_rel_path),
                    )
                    .to_string();
                    pending.insert(MutationKind::Rename, &node_id);
                    if let Err(err) = self.api.rename(&node_id, &new_name).await {
                        stats.errors += 1;
                        self.events.publish(SyncEvent::SyncError {
                            file: Some(entry.path.clone()),
                            message: err.to_string(),
                        });
                        continue;
                    }
                    map.insert(
                        node_id,
                        NodeEntry {
                            path: new_rel_path.clone(),
                            checksum: entry.checksum.clone(),
                            inode: local_index.get(&new_rel_path).and_then(|f| f.inode),
                        },
                    );
                    stats.files_renamed += 1;
                    self.events.publish(SyncEvent::FileSynced {
                        file: new_rel_path,
                        action: FileAction::Renamed,
                    });
                }
                OfflineChange::Delete => {
                    // Re-check the server's freshest modifiedAt for a
                    // delete-conflict: it may have been edited remotely
                    // after our last known-good state.
                    let remote_modified = self
                        .sites_cache
                        .get_fresh(Instant::now())
                        .and_then(|listing| listing.iter().find(|s| s.node_id == node_id))
                        .map(|s| s.modified_at.timestamp_millis());

                    let decision = match remote_modified {
                        Some(ts) => delete_conflict_decision(ts, last_synced_at),
                        None => DeleteConflictDecision::Delete,
                    };

                    match decision {
                        DeleteConflictDecision::Redownload => {
                            match self.api.download(strip_html(&entry.path)).await {
                                Ok(result) => {
                                    let _ = write_with_backup(
                                        &self.root,
                                        &entry.path,
                                        result.content.as_bytes(),
                                        true,
                                        &self.events,
                                    );
                                    map.insert(
                                        node_id,
                                        NodeEntry {
                                            path: entry.path.clone(),
                                            checksum: Some(result.checksum),
                                            inode: node_map::inode_of(&self.root.join(&entry.path)),
                                        },
                                    );
                                    self.events.publish(SyncEvent::SyncConflict {
                                        file: entry.path.clone(),
                                        message: "remote edit raced an offline delete; redownloaded"
                                            .to_string(),
                                        suggestions: vec![],
                                    });
                                }
                                Err(err) => {
                                    stats.errors += 1;
                                    self.events.publish(SyncEvent::SyncError {
                                        file: Some(entry.path.clone()),
                                        message: err.to_string(),
                                    });
                                }
                            }
                        }
                        DeleteConflictDecision::Delete => {
                            pending.insert(MutationKind::Delete, &node_id);
                            if let Err(err) = self.api.delete(&node_id).await {
                                stats.errors += 1;
                                self.events.publish(SyncEvent::SyncError {
                                    file: Some(entry.path.clone()),
                                    message: err.to_string(),
                                });
                                continue;
                            }
                            map.remove(&node_id);
                        }
                    }
                }
            }
        }
    }

    async fn phase_c_upload_new(
        &self,
        map: &mut NodeMap,
        local_index: &HashMap<String, LocalFile>,
        listing: &[SiteListing],
        stats: &mut SyncStats,
    ) {
        let mapped_paths: HashSet<String> = map.iter().map(|(_, e)| e.path.clone()).collect();
        let server_paths: HashMap<String, &SiteListing> =
            listing.iter().map(|s| (s.path.clone(), s)).collect();
        let server_basenames: HashSet<&str> = listing
            .iter()
            .filter_map(|s| Path::new(&s.path).file_name().and_then(|n| n.to_str()))
            .collect();

        let mut seen_basenames: HashSet<String> = HashSet::new();
        for (rel_path, file) in local_index {
            if mapped_paths.contains(rel_path) {
                continue;
            }
            if server_paths.contains_key(rel_path) {
                continue;
            }
            let basename = Path::new(rel_path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(rel_path)
                .to_string();
            if !seen_basenames.insert(basename.clone()) {
                self.events.publish(SyncEvent::SyncWarning {
                    file: Some(rel_path.clone()),
                    message: format!("duplicate-filename: {basename} already uploaded from another folder"),
                });
                continue;
            }
            // The basename is already live on the server under a different
            // path (spec §4.5 phase C: "not already present on the server
            // under a different path") — uploading would mint a second
            // node for the same logical site. Cold-start correlation
            // (checksum match against an unmapped server node) already
            // claims these paths before this loop runs; anything still
            // here with a server-matching basename is a genuine
            // same-name-different-folder collision, not a move.
            if server_basenames.contains(basename.as_str()) {
                self.events.publish(SyncEvent::SyncWarning {
                    file: Some(rel_path.clone()),
                    message: format!("duplicate-filename: {basename} already exists on the server under a different path"),
                });
                continue;
            }

            let site_name = strip_html(&basename);
            let validation = crate::validator::validate_site_path(rel_path);
            if !validation.valid {
                stats.errors += 1;
                self.events.publish(SyncEvent::SyncWarning {
                    file: Some(rel_path.clone()),
                    message: validation.reason.unwrap_or_default(),
                });
                continue;
            }

            let content = match std::fs::read_to_string(self.root.join(rel_path)) {
                Ok(c) => c,
                Err(err) => {
                    stats.errors += 1;
                    self.events.publish(SyncEvent::SyncError {
                        file: Some(rel_path.clone()),
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            let modified_at = chrono::DateTime::from_timestamp_millis(file.mtime_ms)
                .unwrap_or_else(Utc::now);
            match self.api.upload(site_name, &content, modified_at, None, true).await {
                Ok(result) => {
                    map.insert(
                        result.node_id,
                        NodeEntry {
                            path: rel_path.clone(),
                            checksum: Some(file.checksum.clone()),
                            inode: file.inode,
                        },
                    );
                    stats.files_uploaded += 1;
                    self.events.publish(SyncEvent::FileSynced {
                        file: rel_path.clone(),
                        action: FileAction::Uploaded,
                    });
                }
                Err(err) => {
                    stats.errors += 1;
                    let suggestions = crate::errors::downcast(&err)
                        .map(|e| e.suggestions.clone())
                        .unwrap_or_default();
                    if !suggestions.is_empty() || crate::errors::downcast(&err)
                        .map(|e| e.kind == crate::errors::SyncErrorKind::NameConflict)
                        .unwrap_or(false)
                    {
                        self.events.publish(SyncEvent::SyncConflict {
                            file: rel_path.clone(),
                            message: err.to_string(),
                            suggestions,
                        });
                    } else {
                        self.events.publish(SyncEvent::SyncError {
                            file: Some(rel_path.clone()),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Two-way diff sync for upload (binary) files. The wire protocol's
    /// upload listing carries no node id (spec §6's `ListUploads` has only
    /// `path`/`checksum`/`modifiedAt`), so unlike sites there is no rename,
    /// move, or delete tracking here — just download-if-remote-is-newer,
    /// upload-if-local-is-newer-or-remote-is-missing.
    pub async fn reconcile_uploads(&self, clock: &ClockCalibrator, stats: &mut SyncStats) -> Result<()> {
        let remote = self.api.list_uploads().await.context("list_uploads")?;
        let remote_by_path: HashMap<&str, &crate::api_client::UploadListing> =
            remote.iter().map(|u| (u.path.as_str(), u)).collect();

        for upload in &remote {
            let local_path = self.root.join(&upload.path);
            if !local_path.exists() {
                self.download_upload(&upload.path, stats).await;
                continue;
            }
            let bytes = std::fs::read(&local_path)
                .with_context(|| format!("read {}", local_path.display()))?;
            let local_checksum = checksum_bytes(&bytes);
            if local_checksum == upload.checksum {
                self.events.publish(SyncEvent::FileSynced {
                    file: upload.path.clone(),
                    action: FileAction::Skipped,
                });
                continue;
            }
            let local_mtime = mtime_millis(&local_path)?;
            if clock.is_local_newer(local_mtime, upload.modified_at.timestamp_millis()) {
                self.upload_upload(&upload.path, &bytes, local_mtime, stats).await;
            } else {
                self.download_upload(&upload.path, stats).await;
            }
        }

        for entry in index_local_uploads(&self.root)? {
            if remote_by_path.contains_key(entry.rel_path.as_str()) {
                continue;
            }
            let bytes = std::fs::read(self.root.join(&entry.rel_path))
                .with_context(|| format!("read {}", entry.rel_path))?;
            self.upload_upload(&entry.rel_path, &bytes, entry.mtime_ms, stats).await;
        }
        Ok(())
    }

    async fn download_upload(&self, rel_path: &str, stats: &mut SyncStats) {
        match self.api.download_upload(rel_path).await {
            Ok(result) => {
                if write_with_backup(&self.root, rel_path, &result.content, false, &self.events).is_ok() {
                    stats.files_downloaded += 1;
                    self.events.publish(SyncEvent::FileSynced {
                        file: rel_path.to_string(),
                        action: FileAction::Downloaded,
                    });
                }
            }
            Err(err) => {
                stats.errors += 1;
                self.events.publish(SyncEvent::SyncError {
                    file: Some(rel_path.to_string()),
                    message: err.to_string(),
                });
            }
        }
    }

    async fn upload_upload(&self, rel_path: &str, bytes: &[u8], mtime_ms: i64, stats: &mut SyncStats) {
        let validation = crate::validator::validate_upload_path(rel_path, bytes.len() as u64);
        if !validation.valid {
            stats.errors += 1;
            self.events.publish(SyncEvent::SyncWarning {
                file: Some(rel_path.to_string()),
                message: validation.reason.unwrap_or_default(),
            });
            return;
        }
        let modified_at = chrono::DateTime::from_timestamp_millis(mtime_ms).unwrap_or_else(Utc::now);
        match self.api.upload_upload(rel_path, bytes, modified_at).await {
            Ok(()) => {
                stats.files_uploaded += 1;
                self.events.publish(SyncEvent::FileSynced {
                    file: rel_path.to_string(),
                    action: FileAction::Uploaded,
                });
            }
            Err(err) => {
                stats.errors += 1;
                self.events.publish(SyncEvent::SyncError {
                    file: Some(rel_path.to_string()),
                    message: err.to_string(),
                });
            }
        }
    }
}

/// Walks the sync root for non-site files (anything not `.html`, outside
/// the ignored segments) — the counterpart to `index_local_sites` for the
/// upload-file two-way diff.
pub fn index_local_uploads(root: &Path) -> Result<Vec<LocalFile>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_entry(|e| !is_ignored(e.path(), root)) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("html") {
            continue;
        }
        let rel_path = relativize(root, path);
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        out.push(LocalFile {
            rel_path,
            checksum: checksum_bytes(&bytes),
            inode: node_map::inode_of(path),
            mtime_ms: mtime_millis(path)?,
        });
    }
    Ok(out)
}

fn parent_folder(rel_path: &str) -> String {
    Path::new(rel_path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn strip_html(name_or_path: &str) -> &str {
    name_or_path.strip_suffix(".html").unwrap_or(name_or_path)
}

fn move_local_file(root: &Path, from_rel: &str, to_rel: &str) -> Result<()> {
    let from = root.join(from_rel);
    let to = root.join(to_rel);
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::rename(&from, &to).with_context(|| format!("move {} to {}", from.display(), to.display()))
}

fn write_with_backup(
    root: &Path,
    rel_path: &str,
    content: &[u8],
    is_site: bool,
    events: &EventBus,
) -> Result<()> {
    if let Some(backup_path) = backup::backup_if_exists(root, rel_path, is_site)? {
        events.publish(SyncEvent::BackupCreated {
            file: rel_path.to_string(),
            backup_path: backup_path.to_string_lossy().into_owned(),
        });
    }
    let dest = root.join(rel_path);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(&dest, content).with_context(|| format!("write {}", dest.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_a_downloads_when_no_local_file() {
        assert_eq!(
            phase_a_decision(false, false, false, false),
            PhaseADecision::Download
        );
    }

    #[test]
    fn phase_a_protects_future_dated_local_file() {
        assert_eq!(
            phase_a_decision(true, true, false, false),
            PhaseADecision::Protected
        );
    }

    #[test]
    fn phase_a_protects_locally_newer_file_over_checksum_match() {
        assert_eq!(
            phase_a_decision(true, false, true, true),
            PhaseADecision::Protected
        );
    }

    #[test]
    fn phase_a_skips_download_on_checksum_match() {
        assert_eq!(
            phase_a_decision(true, false, false, true),
            PhaseADecision::DownloadSkipped
        );
    }

    #[test]
    fn phase_a_downloads_on_checksum_mismatch() {
        assert_eq!(
            phase_a_decision(true, false, false, false),
            PhaseADecision::Download
        );
    }

    #[test]
    fn phase_b_keeps_files_edited_after_last_sync() {
        assert_eq!(phase_b_decision(2000, 1000), PhaseBDecision::KeepAndForget);
    }

    #[test]
    fn phase_b_trashes_files_untouched_since_last_sync() {
        assert_eq!(phase_b_decision(500, 1000), PhaseBDecision::Trash);
    }

    #[test]
    fn delete_conflict_prefers_redownload_when_server_is_newer() {
        assert_eq!(
            delete_conflict_decision(2000, 1000),
            DeleteConflictDecision::Redownload
        );
        assert_eq!(
            delete_conflict_decision(500, 1000),
            DeleteConflictDecision::Delete
        );
    }

    #[test]
    fn classifies_offline_move_by_shared_basename() {
        let entry = NodeEntry {
            path: "posts/a.html".into(),
            checksum: Some("c1".into()),
            inode: Some(1),
        };
        let unassigned = vec![LocalFile {
            rel_path: "archive/a.html".into(),
            checksum: "different".into(),
            inode: Some(99),
            mtime_ms: 0,
        }];
        assert_eq!(
            classify_offline_change(&entry, &unassigned),
            OfflineChange::Move {
                new_rel_path: "archive/a.html".into()
            }
        );
    }

    #[test]
    fn classifies_offline_rename_by_inode_when_basename_differs() {
        let entry = NodeEntry {
            path: "projects/old.html".into(),
            checksum: Some("c1".into()),
            inode: Some(55),
        };
        let unassigned = vec![LocalFile {
            rel_path: "projects/new.html".into(),
            checksum: "c1-changed".into(),
            inode: Some(55),
            mtime_ms: 0,
        }];
        assert_eq!(
            classify_offline_change(&entry, &unassigned),
            OfflineChange::Rename {
                new_rel_path: "projects/new.html".into()
            }
        );
    }

    #[test]
    fn classifies_offline_rename_by_checksum_when_inode_changed() {
        let entry = NodeEntry {
            path: "projects/old.html".into(),
            checksum: Some("stable-checksum".into()),
            inode: Some(55),
        };
        let unassigned = vec![LocalFile {
            rel_path: "projects/new.html".into(),
            checksum: "stable-checksum".into(),
            inode: Some(999), // editor rewrote the inode
            mtime_ms: 0,
        }];
        assert_eq!(
            classify_offline_change(&entry, &unassigned),
            OfflineChange::Rename {
                new_rel_path: "projects/new.html".into()
            }
        );
    }

    #[test]
    fn classifies_as_delete_when_nothing_matches() {
        let entry = NodeEntry {
            path: "posts/gone.html".into(),
            checksum: Some("c1".into()),
            inode: Some(1),
        };
        assert_eq!(classify_offline_change(&entry, &[]), OfflineChange::Delete);
    }

    #[test]
    fn ignores_dotted_segments_and_known_directories() {
        let root = Path::new("/sync");
        assert!(is_ignored(Path::new("/sync/.sync-meta/node-map.json"), root));
        assert!(is_ignored(Path::new("/sync/node_modules/pkg/index.html"), root));
        assert!(is_ignored(Path::new("/sync/.trash/a.html"), root));
        assert!(!is_ignored(Path::new("/sync/blog/intro.html"), root));
    }

    #[test]
    fn cold_start_correlates_an_unmapped_node_to_a_matching_local_file() {
        // Spec §8 scenario 1: server lists node 42 at blog/intro.html, the
        // local tree already has the same bytes sitting at intro.html, and
        // the map has never heard of node 42.
        let mut local_index = HashMap::new();
        local_index.insert(
            "intro.html".to_string(),
            LocalFile {
                rel_path: "intro.html".into(),
                checksum: "deadbeefcafef00d".into(),
                inode: Some(7),
                mtime_ms: 0,
            },
        );
        let mapped_paths: HashSet<&str> = HashSet::new();

        let found = find_checksum_correlation("deadbeefcafef00d", "blog/intro.html", &mapped_paths, &local_index);
        assert_eq!(found.map(|f| f.rel_path.as_str()), Some("intro.html"));
    }

    #[test]
    fn cold_start_correlation_ignores_paths_already_claimed_by_another_node() {
        let mut local_index = HashMap::new();
        local_index.insert(
            "intro.html".to_string(),
            LocalFile {
                rel_path: "intro.html".into(),
                checksum: "deadbeefcafef00d".into(),
                inode: Some(7),
                mtime_ms: 0,
            },
        );
        let mapped_paths: HashSet<&str> = ["intro.html"].into_iter().collect();

        let found = find_checksum_correlation("deadbeefcafef00d", "blog/intro.html", &mapped_paths, &local_index);
        assert!(found.is_none());
    }

    #[test]
    fn cold_start_correlation_ignores_checksum_mismatch_and_identical_path() {
        let mut local_index = HashMap::new();
        local_index.insert(
            "blog/intro.html".to_string(),
            LocalFile {
                rel_path: "blog/intro.html".into(),
                checksum: "deadbeefcafef00d".into(),
                inode: Some(7),
                mtime_ms: 0,
            },
        );
        local_index.insert(
            "other.html".to_string(),
            LocalFile {
                rel_path: "other.html".into(),
                checksum: "some-other-checksum".into(),
                inode: Some(8),
                mtime_ms: 0,
            },
        );
        let mapped_paths: HashSet<&str> = HashSet::new();

        // The file already at the remote path isn't a "candidate to move" —
        // local_exists already handles that case before this path is tried.
        let found = find_checksum_correlation("deadbeefcafef00d", "blog/intro.html", &mapped_paths, &local_index);
        assert!(found.is_none());
    }
}
