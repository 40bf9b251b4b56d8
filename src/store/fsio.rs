#![forbid(unsafe_code)]

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use time::OffsetDateTime;
use time::macros::format_description;

use crate::error::{AppError, Result};

const BACKUP_STAMP: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]");

// Write-to-temp, fsync, rename-into-place. After the rename returns, readers
// only ever see the previous or the new content.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Internal(format!("no parent directory for {}", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| AppError::io(parent, e))?;

    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    let tmp = path.with_file_name(format!(
        "{}.tmp.{nanos}",
        path.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("snapshot")
    ));

    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()
    };
    write().map_err(|e| AppError::io(&tmp, e))?;

    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        AppError::io(path, e)
    })
}

// Best effort by contract: callers log a failure but never let it block the
// write it precedes.
pub fn create_backup(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }

    let backup = backup_path(path, &backup_stamp());
    std::fs::copy(path, &backup).map_err(|e| AppError::io(&backup, e))?;
    Ok(Some(backup))
}

pub fn restore_backup(path: &Path, backup: &Path) -> Result<()> {
    if !backup.exists() {
        return Err(AppError::Internal(format!(
            "backup does not exist: {}",
            backup.display()
        )));
    }
    std::fs::copy(backup, path).map_err(|e| AppError::io(path, e))?;
    Ok(())
}

// Removes `<file>.backup.*` siblings older than `max_age`. Returns how many
// were deleted.
pub fn cleanup_old_backups(path: &Path, max_age: Duration) -> Result<usize> {
    let Some(parent) = path.parent() else {
        return Ok(0);
    };
    if !parent.exists() {
        return Ok(0);
    }
    let prefix = format!(
        "{}.backup.",
        path.file_name().and_then(|s| s.to_str()).unwrap_or("")
    );

    let now = std::time::SystemTime::now();
    let mut removed = 0;
    for entry in std::fs::read_dir(parent).map_err(|e| AppError::io(parent, e))? {
        let entry = entry.map_err(|e| AppError::io(parent, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }

        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        let expired = now
            .duration_since(modified)
            .map_or(false, |age| age >= max_age);
        if expired && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[must_use]
pub fn backup_path(path: &Path, stamp: &str) -> PathBuf {
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("file");
    path.with_file_name(format!("{name}.backup.{stamp}"))
}

#[must_use]
pub fn backup_stamp() -> String {
    OffsetDateTime::now_utc()
        .format(&BACKUP_STAMP)
        .unwrap_or_else(|_| "00000000_000000".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join("plan").join("task.json");

        atomic_write(&path, b"[]").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"[]");

        atomic_write(&path, b"[1]").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"[1]");

        // No stray temp files are left behind.
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join("task.json");
        std::fs::write(&path, b"original").unwrap();

        let backup = create_backup(&path).unwrap().unwrap();
        assert!(
            backup
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("task.json.backup.")
        );

        std::fs::write(&path, b"clobbered").unwrap();
        restore_backup(&path, &backup).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
    }

    #[test]
    fn backup_of_missing_file_is_none() {
        let td = tempfile::tempdir().expect("tempdir");
        assert!(
            create_backup(&td.path().join("absent.json"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn cleanup_removes_expired_backups_only() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join("task.json");
        std::fs::write(&path, b"x").unwrap();
        let old = backup_path(&path, "20200101_000000");
        std::fs::write(&old, b"x").unwrap();
        std::fs::write(td.path().join("unrelated.txt"), b"x").unwrap();

        // Zero retention expires every backup; the data file and unrelated
        // siblings survive.
        let removed = cleanup_old_backups(&path, Duration::ZERO).unwrap();
        assert_eq!(removed, 1);
        assert!(path.exists());
        assert!(!old.exists());
        assert!(td.path().join("unrelated.txt").exists());

        // A generous retention removes nothing.
        let fresh = backup_path(&path, "20990101_000000");
        std::fs::write(&fresh, b"x").unwrap();
        let removed = cleanup_old_backups(&path, Duration::from_secs(86_400)).unwrap();
        assert_eq!(removed, 0);
        assert!(fresh.exists());
    }
}
