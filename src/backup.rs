//! Backup-before-overwrite and trash-not-delete helpers (spec §4.10,
//! invariants I2/I3). Pulled out of the reconciler/watcher/SSE call sites
//! so each invariant has exactly one implementation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

/// `YYYY-MM-DD-HH-mm-ss-mmm`, the timestamp format spec §3 mandates for
/// backup file names.
pub fn backup_timestamp() -> String {
    Utc::now().format("%Y-%m-%d-%H-%M-%S-%3f").to_string()
}

fn strip_html_ext(rel_path: &str) -> &str {
    rel_path.strip_suffix(".html").unwrap_or(rel_path)
}

/// Computes (without writing) the backup destination for a site file.
pub fn site_backup_path(root: &Path, rel_path: &str, ts: &str) -> PathBuf {
    root.join("sites-versions")
        .join(strip_html_ext(rel_path))
        .join(format!("{ts}.html"))
}

/// Computes (without writing) the backup destination for an upload file.
pub fn upload_backup_path(root: &Path, rel_path: &str, ts: &str) -> PathBuf {
    let path = Path::new(rel_path);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    root.join("sites-versions")
        .join("uploads")
        .join(rel_path)
        .join(format!("{ts}.{ext}"))
}

/// If `<root>/<rel_path>` exists, copies its current content to the
/// appropriate `sites-versions/...` destination before the caller performs
/// a destructive write. No-op (and not an error) if there's nothing to
/// back up — invariant I2 only requires a backup "when such contents
/// existed".
pub fn backup_if_exists(root: &Path, rel_path: &str, is_site: bool) -> Result<Option<PathBuf>> {
    let local_path = root.join(rel_path);
    if !local_path.exists() {
        return Ok(None);
    }
    let ts = backup_timestamp();
    let dest = if is_site {
        site_backup_path(root, rel_path, &ts)
    } else {
        upload_backup_path(root, rel_path, &ts)
    };
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create backup dir {}", parent.display()))?;
    }
    std::fs::copy(&local_path, &dest)
        .with_context(|| format!("copy {} to {}", local_path.display(), dest.display()))?;
    Ok(Some(dest))
}

/// Moves a server-deleted file into `.trash/<relPath>`, preserving the
/// original path structure. The engine never unlinks a user file (I3).
pub fn trash(root: &Path, rel_path: &str) -> Result<Option<PathBuf>> {
    let local_path = root.join(rel_path);
    if !local_path.exists() {
        return Ok(None);
    }
    let dest = root.join(".trash").join(rel_path);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create trash dir {}", parent.display()))?;
    }
    // A previous trash at the same path is overwritten; trash is a
    // destination, not an append log.
    if dest.exists() {
        std::fs::remove_file(&dest).with_context(|| format!("replace {}", dest.display()))?;
    }
    std::fs::rename(&local_path, &dest)
        .with_context(|| format!("move {} to {}", local_path.display(), dest.display()))?;
    Ok(Some(dest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_root(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("sitesync-backup-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn backs_up_existing_site_file_before_overwrite() {
        let root = tmp_root("site-backup");
        std::fs::create_dir_all(root.join("blog")).unwrap();
        std::fs::write(root.join("blog/intro.html"), "old content").unwrap();

        let backup = backup_if_exists(&root, "blog/intro.html", true).unwrap();
        let backup = backup.expect("backup created");
        assert!(backup.starts_with(root.join("sites-versions/blog/intro")));
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "old content");
        // Original is untouched; the caller performs the actual overwrite.
        assert_eq!(
            std::fs::read_to_string(root.join("blog/intro.html")).unwrap(),
            "old content"
        );
    }

    #[test]
    fn no_backup_when_file_did_not_previously_exist() {
        let root = tmp_root("no-backup");
        let backup = backup_if_exists(&root, "new.html", true).unwrap();
        assert!(backup.is_none());
    }

    #[test]
    fn upload_backup_preserves_extension_and_path() {
        let root = tmp_root("upload-backup");
        std::fs::create_dir_all(root.join("assets")).unwrap();
        std::fs::write(root.join("assets/photo.png"), b"old bytes").unwrap();

        let backup = backup_if_exists(&root, "assets/photo.png", false).unwrap().unwrap();
        assert!(backup
            .to_string_lossy()
            .ends_with(".png"));
        assert!(backup.starts_with(root.join("sites-versions/uploads/assets/photo.png")));
    }

    #[test]
    fn trash_moves_file_and_preserves_structure() {
        let root = tmp_root("trash");
        std::fs::create_dir_all(root.join("posts")).unwrap();
        std::fs::write(root.join("posts/a.html"), "content").unwrap();

        let trashed = trash(&root, "posts/a.html").unwrap().unwrap();
        assert_eq!(trashed, root.join(".trash/posts/a.html"));
        assert!(!root.join("posts/a.html").exists());
        assert_eq!(std::fs::read_to_string(&trashed).unwrap(), "content");
    }

    #[test]
    fn trash_is_noop_when_file_already_gone() {
        let root = tmp_root("trash-missing");
        let result = trash(&root, "ghost.html").unwrap();
        assert!(result.is_none());
    }
}
