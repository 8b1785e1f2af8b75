//! SSE client and dispatch (spec §4.7): frames the real-time event stream,
//! classifies each message, and decides — consulting the pending-actions
//! set — whether it's an echo of our own mutation or a remote change to
//! apply.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::pending::{MutationKind, PendingActions};

pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
pub const SILENCE_THRESHOLD: Duration = Duration::from_secs(5 * 60);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SseMessage {
    #[serde(rename = "live-sync")]
    LiveSync { file: String, html: String, sender: String },
    #[serde(rename = "file-saved")]
    FileSaved {
        file: String,
        content: String,
        checksum: String,
        #[serde(rename = "modifiedAt")]
        modified_at: DateTime<Utc>,
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    #[serde(rename = "file-renamed")]
    FileRenamed {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "oldName")]
        old_name: String,
        #[serde(rename = "newName")]
        new_name: String,
    },
    #[serde(rename = "file-moved")]
    FileMoved {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "fromPath")]
        from_path: String,
        #[serde(rename = "toPath")]
        to_path: String,
    },
    #[serde(rename = "file-deleted")]
    FileDeleted {
        #[serde(rename = "nodeId")]
        node_id: String,
        file: String,
    },
}

pub fn parse_message(json: &str) -> Result<SseMessage> {
    serde_json::from_str(json).context("parse SSE message")
}

/// Incrementally frames `text/event-stream` bytes into `data:` payloads,
/// dropping `:` comment/ping lines. The wire protocol here is plain-line
/// `data:` framing (spec §6), not the teacher's msgpack/WebSocket envelope.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(idx) = self.buffer.find('\n') {
            let line = self.buffer[..idx].trim_end_matches('\r').to_string();
            self.buffer.drain(..=idx);
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                out.push(data.trim().to_string());
            }
        }
        out
    }
}

/// What the engine should do in response to a decoded message, after
/// consulting pending-actions and local state. Kept separate from the
/// disk/network side effects so the dispatch decision is unit-testable.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Ignore,
    RelayLiveSync { file: String, html: String },
    WriteThrough {
        file: String,
        content: String,
        checksum: String,
        modified_at: DateTime<Utc>,
        node_id: String,
    },
    MoveOnDisk {
        node_id: String,
        old_name: String,
        new_name: String,
    },
    MoveFolder {
        node_id: String,
        from_path: String,
        to_path: String,
    },
    TrashLocally { node_id: String, file: String },
}

/// Dispatches one decoded SSE message. Consumes the matching
/// pending-actions token exactly once (I4); a matched token suppresses
/// the corresponding local mutation.
pub fn dispatch(
    message: SseMessage,
    pending: &mut PendingActions,
    device_id: &str,
    local_checksum: Option<&str>,
) -> Action {
    match message {
        SseMessage::LiveSync { file, html, sender } => {
            if sender == device_id {
                Action::Ignore
            } else {
                Action::RelayLiveSync { file, html }
            }
        }
        SseMessage::FileSaved {
            file,
            content,
            checksum,
            modified_at,
            node_id,
        } => {
            if local_checksum == Some(checksum.as_str()) {
                Action::Ignore
            } else {
                Action::WriteThrough {
                    file,
                    content,
                    checksum,
                    modified_at,
                    node_id,
                }
            }
        }
        SseMessage::FileRenamed {
            node_id,
            old_name,
            new_name,
        } => {
            if pending.consume(MutationKind::Rename, &node_id) {
                Action::Ignore
            } else {
                Action::MoveOnDisk {
                    node_id,
                    old_name,
                    new_name,
                }
            }
        }
        SseMessage::FileMoved {
            node_id,
            from_path,
            to_path,
        } => {
            if pending.consume(MutationKind::Move, &node_id) {
                Action::Ignore
            } else {
                Action::MoveFolder {
                    node_id,
                    from_path,
                    to_path,
                }
            }
        }
        SseMessage::FileDeleted { node_id, file } => {
            if pending.consume(MutationKind::Delete, &node_id) {
                Action::Ignore
            } else {
                Action::TrashLocally { node_id, file }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_decoder_extracts_data_lines_and_skips_comments() {
        let mut decoder = FrameDecoder::new();
        let out = decoder.push(":ping\ndata: {\"type\":\"live-sync\"}\n\n");
        assert_eq!(out, vec!["{\"type\":\"live-sync\"}".to_string()]);
    }

    #[test]
    fn frame_decoder_buffers_partial_lines_across_pushes() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push("data: {\"type\":\"l").is_empty());
        let out = decoder.push("ive-sync\"}\n");
        assert_eq!(out, vec!["{\"type\":\"live-sync\"}".to_string()]);
    }

    #[test]
    fn parses_every_message_type() {
        assert!(matches!(
            parse_message(r#"{"type":"live-sync","file":"a.html","html":"<p>","sender":"dev-1"}"#).unwrap(),
            SseMessage::LiveSync { .. }
        ));
        assert!(matches!(
            parse_message(
                r#"{"type":"file-deleted","nodeId":"42","file":"a.html"}"#
            )
            .unwrap(),
            SseMessage::FileDeleted { .. }
        ));
    }

    #[test]
    fn live_sync_from_own_device_is_ignored() {
        let mut pending = PendingActions::new();
        let action = dispatch(
            SseMessage::LiveSync {
                file: "a.html".into(),
                html: "<p>".into(),
                sender: "dev-1".into(),
            },
            &mut pending,
            "dev-1",
            None,
        );
        assert_eq!(action, Action::Ignore);
    }

    #[test]
    fn live_sync_from_other_device_relays() {
        let mut pending = PendingActions::new();
        let action = dispatch(
            SseMessage::LiveSync {
                file: "a.html".into(),
                html: "<p>".into(),
                sender: "dev-2".into(),
            },
            &mut pending,
            "dev-1",
            None,
        );
        assert_eq!(
            action,
            Action::RelayLiveSync {
                file: "a.html".into(),
                html: "<p>".into()
            }
        );
    }

    #[test]
    fn file_saved_with_matching_checksum_is_skipped() {
        let mut pending = PendingActions::new();
        let action = dispatch(
            SseMessage::FileSaved {
                file: "a.html".into(),
                content: "x".into(),
                checksum: "same".into(),
                modified_at: Utc::now(),
                node_id: "1".into(),
            },
            &mut pending,
            "dev-1",
            Some("same"),
        );
        assert_eq!(action, Action::Ignore);
    }

    #[test]
    fn pending_rename_token_suppresses_echo() {
        let mut pending = PendingActions::new();
        pending.insert(MutationKind::Rename, "42");
        let action = dispatch(
            SseMessage::FileRenamed {
                node_id: "42".into(),
                old_name: "old".into(),
                new_name: "new".into(),
            },
            &mut pending,
            "dev-1",
            None,
        );
        assert_eq!(action, Action::Ignore);
        assert!(!pending.contains(MutationKind::Rename, "42"));
    }

    #[test]
    fn unsuppressed_delete_trashes_locally() {
        let mut pending = PendingActions::new();
        let action = dispatch(
            SseMessage::FileDeleted {
                node_id: "7".into(),
                file: "posts/a.html".into(),
            },
            &mut pending,
            "dev-1",
            None,
        );
        assert_eq!(
            action,
            Action::TrashLocally {
                node_id: "7".into(),
                file: "posts/a.html".into()
            }
        );
    }
}
