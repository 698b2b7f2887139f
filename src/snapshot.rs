//! Durable copy of the whole key space.
//!
//! The snapshot is a single JSON object mapping every key to its value. It is rewritten in full
//! after each mutation: the new contents go to `<path>.tmp`, are synced, and then renamed over
//! `<path>`, so a crash mid-write leaves the previous snapshot intact.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum SnapshotError {
    #[error("snapshot i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed snapshot: {0}")]
    Json(#[from] serde_json::Error),
    #[error("value of key {0:?} is not valid UTF-8")]
    NonUtf8Value(String),
}

/// Storage backend for the key space.
pub trait Snapshot: Send + Sync {
    /// Reads the persisted key space, or `None` when nothing was persisted yet.
    fn load(&self) -> Result<Option<HashMap<String, Bytes>>, SnapshotError>;

    /// Replaces the persisted key space with `entries`.
    fn save(&self, entries: &HashMap<String, Bytes>) -> Result<(), SnapshotError>;
}

// Sorted so that equal key spaces produce identical files.
#[derive(Debug, Default, Serialize)]
#[serde(transparent)]
struct SnapshotFile<'a> {
    entries: BTreeMap<&'a str, &'a str>,
}

/// A snapshot stored as a JSON object on the local filesystem.
#[derive(Debug, Clone)]
pub struct JsonSnapshot {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl JsonSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> JsonSnapshot {
        let path = path.into();
        let mut tmp_path = path.clone().into_os_string();
        tmp_path.push(".tmp");

        JsonSnapshot {
            path,
            tmp_path: tmp_path.into(),
        }
    }
}

impl Snapshot for JsonSnapshot {
    fn load(&self) -> Result<Option<HashMap<String, Bytes>>, SnapshotError> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Owned strings here: values may contain escapes, which cannot be borrowed.
        let entries: HashMap<String, String> = serde_json::from_slice(&contents)?;

        Ok(Some(
            entries
                .into_iter()
                .map(|(key, value)| (key, Bytes::from(value)))
                .collect(),
        ))
    }

    fn save(&self, entries: &HashMap<String, Bytes>) -> Result<(), SnapshotError> {
        let mut file = SnapshotFile::default();
        for (key, value) in entries {
            let value = std::str::from_utf8(value)
                .map_err(|_| SnapshotError::NonUtf8Value(key.clone()))?;
            file.entries.insert(key, value);
        }

        let result = write_atomically(&self.tmp_path, &self.path, &file);
        if result.is_err() {
            let _ = fs::remove_file(&self.tmp_path);
        }
        result
    }
}

fn write_atomically(
    tmp_path: &Path,
    path: &Path,
    file: &SnapshotFile<'_>,
) -> Result<(), SnapshotError> {
    let mut writer = BufWriter::new(File::create(tmp_path)?);
    serde_json::to_writer(&mut writer, file)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    fs::rename(tmp_path, path)?;
    Ok(())
}
