//! Per-device append-only trace file
//!
//! Every admitted line is persisted, whether or not it is buffered for search.
//! The file is never rotated: once it grows past the configured cap, writes are
//! refused and the collector stops tracing for that device.

use crate::device::DeviceHandle;
use crate::error::TraceLogError;
use chrono::Utc;
use log::{debug, info, Level};
use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Suffix of every trace file name
pub const TRACE_LOG_FILE_NAME: &str = "settop_trace.log";

struct LogFile {
    writer: LineWriter<File>,
    size_bytes: u64,
}

/// Append-only trace file for one device
pub struct TraceLog {
    path: PathBuf,
    limit_bytes: u64,
    file: Mutex<LogFile>,
}

impl std::fmt::Debug for TraceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceLog")
            .field("path", &self.path)
            .field("limit_bytes", &self.limit_bytes)
            .finish()
    }
}

impl TraceLog {
    /// Path of the trace file for `device` under `directory`
    pub fn path_for(directory: &Path, device: &DeviceHandle) -> PathBuf {
        directory.join(format!("{}_{}", device.normalized_id(), TRACE_LOG_FILE_NAME))
    }

    /// Open (or create) the trace file for `device`, appending to existing content
    ///
    /// # Errors
    ///
    /// Returns `TraceLogError::IoError` if the directory or file cannot be created.
    pub fn open(
        directory: &Path,
        device: &DeviceHandle,
        limit_kb: u64,
    ) -> Result<Self, TraceLogError> {
        fs::create_dir_all(directory)?;
        let path = Self::path_for(directory, device);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size_bytes = file.metadata()?.len();

        info!("Trace file for {}: {}", device.mac, path.display());

        Ok(Self {
            path,
            limit_bytes: limit_kb.saturating_mul(1024),
            file: Mutex::new(LogFile {
                writer: LineWriter::new(file),
                size_bytes,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LogFile> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes currently in the file
    pub fn size_bytes(&self) -> u64 {
        self.lock().size_bytes
    }

    /// Whether the file has reached its cap
    pub fn is_over_limit(&self) -> bool {
        self.lock().size_bytes >= self.limit_bytes
    }

    /// Fail if the file has already reached its cap
    pub fn check_limit(&self) -> Result<(), TraceLogError> {
        let size_bytes = self.lock().size_bytes;
        if size_bytes >= self.limit_bytes {
            return Err(self.limit_error(size_bytes));
        }
        Ok(())
    }

    /// Append one entry
    ///
    /// # Errors
    ///
    /// Returns `TraceLogError::SizeLimitExceeded` once the file has reached its
    /// cap; the entry that crosses the cap is still written.
    pub fn append(&self, level: Level, text: &str) -> Result<(), TraceLogError> {
        let mut file = self.lock();
        if file.size_bytes >= self.limit_bytes {
            return Err(self.limit_error(file.size_bytes));
        }

        let entry = format!(
            "{} {:<5} {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            text
        );
        file.writer.write_all(entry.as_bytes())?;
        file.size_bytes += entry.len() as u64;

        if file.size_bytes >= self.limit_bytes {
            debug!("Trace file {} reached its cap", self.path.display());
            return Err(self.limit_error(file.size_bytes));
        }
        Ok(())
    }

    /// Flush buffered output to disk
    pub fn flush(&self) -> Result<(), TraceLogError> {
        self.lock().writer.flush()?;
        Ok(())
    }

    fn limit_error(&self, size_bytes: u64) -> TraceLogError {
        TraceLogError::SizeLimitExceeded {
            path: self.path.display().to_string(),
            size_kb: size_bytes / 1024,
            limit_kb: self.limit_bytes / 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceHandle {
        DeviceHandle::new("aa:bb:cc:dd:ee:ff", Some("10.0.0.1".to_string()), "XB6")
    }

    #[test]
    fn test_path_uses_normalized_mac() {
        let path = TraceLog::path_for(Path::new("/tmp/traces"), &device());
        assert_eq!(
            path,
            PathBuf::from("/tmp/traces/AABBCCDDEEFF_settop_trace.log")
        );
    }

    #[test]
    fn test_append_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = TraceLog::open(dir.path(), &device(), 1024).unwrap();

        log.append(Level::Trace, "[AABBCCDDEEFF][TC-1]BOOT COMPLETE").unwrap();
        log.append(Level::Info, "marker from test").unwrap();
        log.flush().unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("TRACE"));
        assert!(lines[0].ends_with("[AABBCCDDEEFF][TC-1]BOOT COMPLETE"));
        assert!(lines[1].contains("INFO"));
        assert_eq!(log.size_bytes(), contents.len() as u64);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = TraceLog::open(dir.path(), &device(), 1024).unwrap();
            log.append(Level::Trace, "first").unwrap();
        }
        let log = TraceLog::open(dir.path(), &device(), 1024).unwrap();
        assert!(log.size_bytes() > 0);
        log.append(Level::Trace, "second").unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_size_limit_stops_writes() {
        let dir = tempfile::tempdir().unwrap();
        let log = TraceLog::open(dir.path(), &device(), 1).unwrap();
        let chunk = "x".repeat(300);

        let mut results = Vec::new();
        for _ in 0..6 {
            results.push(log.append(Level::Trace, &chunk));
        }

        let first_err = results.iter().position(|r| r.is_err()).unwrap();
        assert!(first_err >= 2);
        assert!(results[first_err..]
            .iter()
            .all(|r| matches!(r, Err(TraceLogError::SizeLimitExceeded { .. }))));
        assert!(log.is_over_limit());
        assert!(log.check_limit().is_err());

        let size_after = log.size_bytes();
        assert!(log.append(Level::Trace, "more").is_err());
        assert_eq!(log.size_bytes(), size_after);
    }
}
