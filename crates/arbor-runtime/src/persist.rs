//! Persistence adapter.
//!
//! Each container's non-default persisted properties become a flat record
//! set keyed by its id. The backend is a trait so the storage engine can
//! be swapped; the bundled implementation keeps one UTF-8 `key=value`
//! text file per container id.

use std::path::PathBuf;

use arbor_common::error::{ArborError, Result};
use arbor_common::types::CtId;

/// One persisted key/value pair.
pub type Record = (String, String);

/// Opaque record storage keyed by container id.
pub trait KvStore: Send + Sync {
    /// Replaces the record set of one container.
    ///
    /// # Errors
    ///
    /// Returns an error when the records cannot be stored.
    fn put(&self, id: CtId, records: &[Record]) -> Result<()>;

    /// Reads the record set of one container.
    ///
    /// # Errors
    ///
    /// Returns an error when the record set is missing or unreadable.
    fn get(&self, id: CtId) -> Result<Vec<Record>>;

    /// Deletes the record set of one container.
    ///
    /// # Errors
    ///
    /// Returns an error when deletion fails for reasons other than the
    /// record not existing.
    fn delete(&self, id: CtId) -> Result<()>;

    /// Ids with stored records, sorted ascending.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be enumerated.
    fn list(&self) -> Result<Vec<CtId>>;
}

/// One file per container id, `key=value` lines, newlines escaped.
#[derive(Debug)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    /// Opens (and creates) the store directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ArborError::io(&dir, &e))?;
        Ok(Self { dir })
    }

    fn path(&self, id: CtId) -> PathBuf {
        self.dir.join(id.0.to_string())
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

impl KvStore for FileKvStore {
    fn put(&self, id: CtId, records: &[Record]) -> Result<()> {
        let mut text = String::new();
        for (key, value) in records {
            text.push_str(key);
            text.push('=');
            text.push_str(&escape(value));
            text.push('\n');
        }
        let path = self.path(id);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text).map_err(|e| ArborError::io(&tmp, &e))?;
        std::fs::rename(&tmp, &path).map_err(|e| ArborError::io(&path, &e))?;
        Ok(())
    }

    fn get(&self, id: CtId) -> Result<Vec<Record>> {
        let path = self.path(id);
        let text = std::fs::read_to_string(&path).map_err(|e| ArborError::io(&path, &e))?;
        let mut records = Vec::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!(id = %id, line, "malformed persistence record skipped");
                continue;
            };
            records.push((key.to_string(), unescape(value)));
        }
        Ok(records)
    }

    fn delete(&self, id: CtId) -> Result<()> {
        let path = self.path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArborError::io(&path, &e)),
        }
    }

    fn list(&self) -> Result<Vec<CtId>> {
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| ArborError::io(&self.dir, &e))?;
        let mut ids: Vec<CtId> = entries
            .flatten()
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<u32>().ok())
                    .map(CtId)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileKvStore::open(dir.path()).expect("open");
        let records = vec![
            ("name".to_string(), "a/b".to_string()),
            ("command".to_string(), "/bin/true".to_string()),
            ("env".to_string(), "MOTD=line one\nline two".to_string()),
        ];
        store.put(CtId(7), &records).expect("put");
        assert_eq!(store.get(CtId(7)).expect("get"), records);
    }

    #[test]
    fn list_is_sorted_by_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileKvStore::open(dir.path()).expect("open");
        for id in [9, 4, 200] {
            store.put(CtId(id), &[("name".to_string(), "x".to_string())]).expect("put");
        }
        let ids: Vec<u32> = store.list().expect("list").iter().map(|id| id.0).collect();
        assert_eq!(ids, vec![4, 9, 200]);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileKvStore::open(dir.path()).expect("open");
        store.put(CtId(4), &[("name".to_string(), "a".to_string())]).expect("put");
        store.delete(CtId(4)).expect("delete");
        store.delete(CtId(4)).expect("delete again");
        assert!(store.get(CtId(4)).is_err());
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn stray_files_are_ignored_by_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileKvStore::open(dir.path()).expect("open");
        std::fs::write(dir.path().join("README"), "not a record").expect("stray");
        store.put(CtId(5), &[("name".to_string(), "a".to_string())]).expect("put");
        let ids = store.list().expect("list");
        assert_eq!(ids, vec![CtId(5)]);
    }

    #[test]
    fn escape_roundtrip() {
        for value in ["plain", "two\nlines", "back\\slash", "mix\\n\nreal"] {
            assert_eq!(unescape(&escape(value)), value);
        }
    }
}
