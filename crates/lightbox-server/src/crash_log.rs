//! Persistent log of fatal errors that forced a restart.

use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

/// Lines kept in the log.
pub const MAX_CRASH_LINES: usize = 20;

/// Append-only crash log trimmed to the most recent entries.
#[derive(Debug, Clone)]
pub struct CrashLog {
    path: PathBuf,
    max_lines: usize,
}

impl CrashLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_lines: MAX_CRASH_LINES,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, error: &dyn Display) -> io::Result<()> {
        self.record_at(error, Utc::now())
    }

    pub fn record_at(&self, error: &dyn Display, at: DateTime<Utc>) -> io::Result<()> {
        let mut lines = self.lines()?;
        lines.push(format!(
            "ERROR at {}: {} - Device restarting",
            at.to_rfc3339_opts(SecondsFormat::Secs, true),
            error
        ));
        let excess = lines.len().saturating_sub(self.max_lines);
        lines.drain(..excess);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut text = lines.join("\n");
        text.push('\n');
        fs::write(&self.path, text)?;
        debug!("Crash recorded in {}", self.path.display());
        Ok(())
    }

    /// Current entries, oldest first.
    pub fn lines(&self) -> io::Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_entry_format() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = CrashLog::new(dir.path().join("logg.txt"));
        let at = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();

        log.record_at(&"bind failed", at).unwrap();

        assert_eq!(
            log.lines().unwrap(),
            vec!["ERROR at 2024-05-17T08:30:00Z: bind failed - Device restarting".to_string()]
        );
    }

    #[test]
    fn test_keeps_most_recent_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = CrashLog::new(dir.path().join("logg.txt"));

        for i in 0..25 {
            log.record(&format!("error {}", i)).unwrap();
        }

        let lines = log.lines().unwrap();
        assert_eq!(lines.len(), MAX_CRASH_LINES);
        assert!(lines[0].contains("error 5 -"));
        assert!(lines[19].contains("error 24 -"));
    }
}
