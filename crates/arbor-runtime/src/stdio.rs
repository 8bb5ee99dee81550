//! Captured stdout/stderr files with size-capped rotation.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use arbor_common::error::{ArborError, Result};

/// Stdout path inside a container's work directory.
#[must_use]
pub fn stdout_path(work_dir: &Path) -> PathBuf {
    work_dir.join("stdout")
}

/// Stderr path inside a container's work directory.
#[must_use]
pub fn stderr_path(work_dir: &Path) -> PathBuf {
    work_dir.join("stderr")
}

/// Halves a capture file once it outgrows the limit, keeping the tail.
///
/// # Errors
///
/// Returns an error when the file cannot be rewritten.
pub fn rotate(path: &Path, limit: u64) -> Result<()> {
    let Ok(meta) = std::fs::metadata(path) else {
        return Ok(());
    };
    if limit == 0 || meta.len() <= limit {
        return Ok(());
    }
    let keep = limit / 2;
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| ArborError::io(path, &e))?;
    file.seek(SeekFrom::End(i64::try_from(keep).unwrap_or(i64::MAX).saturating_neg()))
        .map_err(|e| ArborError::io(path, &e))?;
    let mut tail = Vec::with_capacity(keep as usize);
    file.read_to_end(&mut tail).map_err(|e| ArborError::io(path, &e))?;
    // start at the next full line so the head is not garbage
    let start = tail.iter().position(|b| *b == b'\n').map_or(0, |p| p + 1);
    file.set_len(0).map_err(|e| ArborError::io(path, &e))?;
    file.seek(SeekFrom::Start(0)).map_err(|e| ArborError::io(path, &e))?;
    file.write_all(&tail[start..]).map_err(|e| ArborError::io(path, &e))?;
    tracing::debug!(path = %path.display(), kept = tail.len() - start, "stdio rotated");
    Ok(())
}

/// Removes a capture file, tolerating its absence.
pub fn remove(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot remove stdio file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_files_stay_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stdout");
        std::fs::write(&path, "short\n").expect("seed");
        rotate(&path, 1024).expect("rotate");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "short\n");
    }

    #[test]
    fn oversized_file_keeps_recent_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stdout");
        let mut content = String::new();
        for i in 0..200 {
            content.push_str(&format!("line number {i}\n"));
        }
        std::fs::write(&path, &content).expect("seed");

        rotate(&path, 512).expect("rotate");
        let kept = std::fs::read_to_string(&path).expect("read");
        assert!(kept.len() <= 256);
        assert!(kept.contains("line number 199"));
        assert!(!kept.contains("line number 0\n"));
        assert!(kept.starts_with("line"), "rotation must land on a line boundary");
    }

    #[test]
    fn missing_file_is_fine() {
        let dir = tempfile::tempdir().expect("tempdir");
        rotate(&dir.path().join("stdout"), 512).expect("rotate");
        remove(&dir.path().join("stdout"));
    }
}
