//! Logging setup for formgen binaries.
//!
//! Events go to a size-rotated file under `$FORMGEN_HOME/logs` and to stderr.
//! The file keeps everything the `RUST_LOG` filter admits; stderr stays at
//! `warn` unless the caller asks for verbose output.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const DEFAULT_LOG_FILTER: &str = "formgen=info,formgen_schema=info,formgen_db=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging options for one binary.
#[derive(Debug, Clone, Copy)]
pub struct LogConfig<'a> {
    /// Log file stem, e.g. `formgen` writes `formgen.log`.
    pub app_name: &'a str,
    /// Mirror the file filter on stderr instead of warn-only.
    pub verbose: bool,
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = SharedRollingWriter::open(&log_dir, config.app_name)
        .context("Failed to initialize rolling log writer")?;

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(console_filter),
        )
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(())
}

/// Home directory for config, the default SQLite store and logs.
///
/// `FORMGEN_HOME` wins; otherwise `~/.formgen`, falling back to `./.formgen`
/// when no home directory can be determined.
pub fn formgen_home() -> PathBuf {
    if let Some(override_path) = std::env::var_os("FORMGEN_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".formgen")
}

/// `$FORMGEN_HOME/logs`
pub fn logs_dir() -> PathBuf {
    formgen_home().join("logs")
}

/// Create the logs directory if needed and return it.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Append-only log file that rotates to `name.log.1 .. name.log.N-1` once it
/// would grow past `max_size`.
struct RotatingFile {
    dir: PathBuf,
    stem: String,
    max_files: usize,
    max_size: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    fn open(dir: &Path, stem: &str, max_files: usize, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut rotating = Self {
            dir: dir.to_path_buf(),
            stem: sanitize_stem(stem),
            max_files: max_files.max(1),
            max_size,
            file: None,
            written: 0,
        };
        rotating.reopen()?;
        if rotating.written > rotating.max_size {
            rotating.rotate()?;
        }
        Ok(rotating)
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.stem, index))
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
        self.shift_backups()?;
        self.reopen()
    }

    fn shift_backups(&self) -> io::Result<()> {
        let keep = self.max_files.saturating_sub(1);
        if keep == 0 {
            // No backups kept: truncate by removing the active file.
            let active = self.active_path();
            if active.exists() {
                fs::remove_file(active)?;
            }
            return Ok(());
        }

        let oldest = self.backup_path(keep);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for idx in (1..keep).rev() {
            let src = self.backup_path(idx);
            if src.exists() {
                fs::rename(&src, self.backup_path(idx + 1))?;
            }
        }
        let active = self.active_path();
        if active.exists() {
            fs::rename(active, self.backup_path(1))?;
        }
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
struct SharedRollingWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl SharedRollingWriter {
    fn open(dir: &Path, stem: &str) -> Result<Self> {
        let file = RotatingFile::open(dir, stem, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {}", stem))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

struct SharedRollingWriterGuard {
    inner: Arc<Mutex<RotatingFile>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRollingWriter {
    type Writer = SharedRollingWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedRollingWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedRollingWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .flush()
    }
}

fn sanitize_stem(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_when_size_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = RotatingFile::open(dir.path(), "engine", 3, 16).unwrap();

        file.write_all(b"0123456789").unwrap();
        file.write_all(b"abcdefghij").unwrap();
        file.write_all(b"ABCDEFGHIJ").unwrap();
        file.flush().unwrap();

        let active = fs::read_to_string(dir.path().join("engine.log")).unwrap();
        let first = fs::read_to_string(dir.path().join("engine.log.1")).unwrap();
        let second = fs::read_to_string(dir.path().join("engine.log.2")).unwrap();
        assert_eq!(active, "ABCDEFGHIJ");
        assert_eq!(first, "abcdefghij");
        assert_eq!(second, "0123456789");
    }

    #[test]
    fn oldest_backup_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = RotatingFile::open(dir.path(), "engine", 2, 4).unwrap();
        for chunk in [b"aaaa", b"bbbb", b"cccc"] {
            file.write_all(chunk).unwrap();
        }
        file.flush().unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("engine.log")).unwrap(), "cccc");
        assert_eq!(fs::read_to_string(dir.path().join("engine.log.1")).unwrap(), "bbbb");
        assert!(!dir.path().join("engine.log.2").exists());
    }

    #[test]
    fn stem_is_sanitized() {
        assert_eq!(sanitize_stem("form gen/cli"), "form_gen_cli");
        assert_eq!(sanitize_stem("formgen-cli_2"), "formgen-cli_2");
    }
}
