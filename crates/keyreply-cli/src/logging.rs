//! Log files with daily rotation and retention cleanup

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub const LOG_RETENTION_DAYS: u64 = 7;
const LOG_PREFIX: &str = "keyreply";

pub struct LogManager {
    log_dir: PathBuf,
}

impl LogManager {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn current_log_path(&self) -> PathBuf {
        let today = chrono::Local::now().format("%Y-%m-%d");
        self.log_dir.join(format!("{}.{}.log", LOG_PREFIX, today))
    }

    fn is_log_file(path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(LOG_PREFIX) && n.ends_with(".log"))
                .unwrap_or(false)
    }

    /// Removes log files last modified more than `days` ago. Returns how many went.
    pub fn cleanup_older_than(&self, days: u64) -> Result<usize> {
        let cutoff = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
        let mut deleted = 0;
        for path in self.log_files()? {
            let modified = fs::metadata(&path)?.modified()?;
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => eprintln!("Failed to delete old log {}: {}", path.display(), e),
            }
        }
        if deleted > 0 {
            tracing::info!("Cleaned up {} old log file(s)", deleted);
        }
        Ok(deleted)
    }

    /// Log files, newest first. A missing log directory yields an empty list.
    pub fn log_files(&self) -> Result<Vec<PathBuf>> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            if Self::is_log_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        files.reverse();
        Ok(files)
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self
            .log_files()?
            .iter()
            .filter_map(|file| fs::metadata(file).ok())
            .map(|metadata| metadata.len())
            .sum())
    }

    /// Last `lines` lines of the newest log file, if any.
    pub fn tail(&self, lines: usize) -> Result<Option<(PathBuf, Vec<String>)>> {
        let Some(latest) = self.log_files()?.into_iter().next() else {
            return Ok(None);
        };
        let content = fs::read_to_string(&latest)?;
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(Some((
            latest,
            all[start..].iter().map(|l| l.to_string()).collect(),
        )))
    }

    pub fn format_size(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }
}

pub struct LoggingGuard {
    _guard: Option<WorkerGuard>,
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// File plus stderr logging for long-running `serve`. Stdout stays free for replies.
pub fn init_logging(log_dir: &Path, log_level: &str) -> Result<LoggingGuard> {
    fs::create_dir_all(log_dir)?;
    let manager = LogManager::new(log_dir.to_path_buf());
    manager.cleanup_older_than(LOG_RETENTION_DAYS)?;

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(manager.current_log_path())?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_filter(env_filter(log_level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_filter(env_filter(log_level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    Ok(LoggingGuard {
        _guard: Some(guard),
    })
}

/// Stderr-only logging for one-shot admin commands.
pub fn init_stderr_logging(log_level: &str) -> Result<LoggingGuard> {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(env_filter(log_level)),
        )
        .try_init()?;
    Ok(LoggingGuard { _guard: None })
}

#[cfg(test)]
mod tests {
    use super::LogManager;
    use std::fs;

    #[test]
    fn only_prefixed_log_files_are_listed() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("keyreply.2026-01-01.log"), "a\n").expect("write");
        fs::write(dir.path().join("keyreply.2026-01-02.log"), "b\n").expect("write");
        fs::write(dir.path().join("other.log"), "c\n").expect("write");
        fs::write(dir.path().join("keyreply.txt"), "d\n").expect("write");

        let manager = LogManager::new(dir.path().to_path_buf());
        let files = manager.log_files().expect("list");
        let names: Vec<_> = files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["keyreply.2026-01-02.log", "keyreply.2026-01-01.log"]);
        assert_eq!(manager.total_size().expect("size"), 4);
    }

    #[test]
    fn tail_returns_last_lines_of_newest_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("keyreply.2026-01-01.log"), "old\n").expect("write");
        fs::write(
            dir.path().join("keyreply.2026-01-02.log"),
            "one\ntwo\nthree\n",
        )
        .expect("write");

        let manager = LogManager::new(dir.path().to_path_buf());
        let (path, lines) = manager.tail(2).expect("tail").expect("some file");
        assert!(path.ends_with("keyreply.2026-01-02.log"));
        assert_eq!(lines, vec!["two", "three"]);
    }

    #[test]
    fn missing_log_dir_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = LogManager::new(dir.path().join("absent"));
        assert!(manager.log_files().expect("list").is_empty());
        assert!(manager.tail(10).expect("tail").is_none());
    }

    #[test]
    fn cleanup_keeps_fresh_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("keyreply.2026-01-01.log"), "x\n").expect("write");
        let manager = LogManager::new(dir.path().to_path_buf());
        assert_eq!(manager.cleanup_older_than(7).expect("cleanup"), 0);
        assert_eq!(manager.log_files().expect("list").len(), 1);
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(LogManager::format_size(512), "512 B");
        assert_eq!(LogManager::format_size(2048), "2.00 KB");
        assert_eq!(LogManager::format_size(3 * 1024 * 1024), "3.00 MB");
    }
}
