//! Best-effort JSONL fallback persistence.
//!
//! Each run appends records to `<dir>/YYYY-MM-DD/<prefix>(HH-MM-SS-mmm).jsonl`,
//! one JSON object per line. Write failures are logged and swallowed: the
//! fallback files must never take a run down.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::warn;

use celestialflow_shared::config::FallbackConfig;

/// Appender bound to one run's file.
#[derive(Debug, Clone)]
pub struct FallbackWriter {
    path: PathBuf,
}

impl FallbackWriter {
    /// `prefix` is the file family (`realtime_errors`, `leftover_tasks`);
    /// `started_at` names the file so every record of a run lands
    /// together.
    pub fn for_run(config: &FallbackConfig, prefix: &str, started_at: DateTime<Local>) -> Self {
        let day = started_at.format("%Y-%m-%d").to_string();
        let stamp = started_at.format("%H-%M-%S-%3f").to_string();
        let path = PathBuf::from(&config.dir)
            .join(day)
            .join(format!("{prefix}({stamp}).jsonl"));
        Self { path }
    }

    /// Append one record. Best-effort: errors are logged, not surfaced.
    pub fn append<T: Serialize>(&self, record: &T) {
        if let Err(err) = self.try_append(record) {
            warn!(path = %self.path.display(), error = %err, "fallback write failed");
        }
    }

    fn try_append<T: Serialize>(&self, record: &T) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn writer_in(dir: &std::path::Path) -> FallbackWriter {
        let config = FallbackConfig {
            dir: dir.to_string_lossy().into_owned(),
            persist_leftover_tasks: false,
        };
        FallbackWriter::for_run(&config, "realtime_errors", Local::now())
    }

    #[test]
    fn appends_one_json_record_per_line() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer_in(tmp.path());

        writer.append(&json!({"stage": "A", "error": "ValueError(x)"}));
        writer.append(&json!({"stage": "B", "error": "TypeError(y)"}));

        let contents = std::fs::read_to_string(writer.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["stage"], "A");
    }

    #[test]
    fn file_name_carries_prefix_and_day_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = writer_in(tmp.path());
        let path = writer.path().to_string_lossy().into_owned();
        assert!(path.contains("realtime_errors("));
        assert!(path.ends_with(".jsonl"));
    }

    #[test]
    fn write_failure_is_swallowed() {
        // A directory path that cannot be created (under a file).
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let config = FallbackConfig {
            dir: blocker.join("sub").to_string_lossy().into_owned(),
            persist_leftover_tasks: false,
        };
        let writer = FallbackWriter::for_run(&config, "realtime_errors", Local::now());
        // Must not panic.
        writer.append(&json!({"ok": false}));
    }
}
