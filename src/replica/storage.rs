use crate::replica::chat_log::LogEntry;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("could not write log file: {0}")]
    Write(#[from] io::Error),
    #[error("could not encode log entries: {0}")]
    Encode(#[from] ciborium::ser::Error<io::Error>),
}

/// Durable home of the append-only log: one file, rewritten after every
/// append, read back before any endpoint is bound. A persistence failure is
/// logged and swallowed by callers; the in-memory log stays authoritative
/// until restart.
pub(crate) struct LogStorage {
    logger: slog::Logger,
    path: PathBuf,
}

impl LogStorage {
    pub(crate) fn new(logger: slog::Logger, data_dir: &Path) -> Self {
        LogStorage {
            logger,
            path: data_dir.join("logs.cbor"),
        }
    }

    /// Missing file means a fresh replica; an unreadable one degrades to
    /// empty with a warning rather than refusing to start.
    pub(crate) fn load(&self) -> Vec<LogEntry> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                slog::warn!(self.logger, "Could not read '{}': {}", self.path.display(), e);
                return Vec::new();
            }
        };

        match ciborium::de::from_reader::<Vec<LogEntry>, _>(raw.as_slice()) {
            Ok(entries) => entries,
            Err(_) => match serde_json::from_slice::<Vec<LogEntry>>(&raw) {
                Ok(entries) => entries,
                Err(_) => {
                    slog::warn!(
                        self.logger,
                        "Log file '{}' is truncated or corrupt; starting empty",
                        self.path.display()
                    );
                    Vec::new()
                }
            },
        }
    }

    pub(crate) fn persist(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut raw = Vec::new();
        ciborium::ser::into_writer(&entries, &mut raw)?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::test_logger;
    use crate::replica::chat_log::EntryKind;
    use serde_json::json;

    fn sample_entries() -> Vec<LogEntry> {
        vec![
            LogEntry {
                id: "a-1".to_string(),
                kind: EntryKind::UserCreated,
                timestamp: "2026-01-01T00:00:00Z".to_string(),
                clock: 1,
                data: match json!({"user": "alice"}) {
                    serde_json::Value::Object(map) => map,
                    _ => unreachable!(),
                },
            },
            LogEntry {
                id: "a-2".to_string(),
                kind: EntryKind::ChannelCreated,
                timestamp: "2026-01-01T00:00:01Z".to_string(),
                clock: 2,
                data: match json!({"name": "geral"}) {
                    serde_json::Value::Object(map) => map,
                    _ => unreachable!(),
                },
            },
        ]
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LogStorage::new(test_logger(), dir.path());

        let entries = sample_entries();
        storage.persist(&entries).expect("persist");
        assert_eq!(storage.load(), entries);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LogStorage::new(test_logger(), dir.path());
        assert!(storage.load().is_empty());
    }

    #[test]
    fn truncated_file_degrades_to_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LogStorage::new(test_logger(), dir.path());

        storage.persist(&sample_entries()).expect("persist");
        let raw = fs::read(dir.path().join("logs.cbor")).expect("read");
        fs::write(dir.path().join("logs.cbor"), &raw[..raw.len() / 2]).expect("truncate");

        assert!(storage.load().is_empty());
    }

    #[test]
    fn json_log_files_are_still_readable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LogStorage::new(test_logger(), dir.path());

        let entries = sample_entries();
        fs::write(
            dir.path().join("logs.cbor"),
            serde_json::to_vec(&entries).expect("encode json"),
        )
        .expect("write");

        assert_eq!(storage.load(), entries);
    }
}
