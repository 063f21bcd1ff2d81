//! Connection manager for Model Context Protocol tool servers.
//!
//! See [`mcp_client::McpClientManager`] for the public API.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub mod mcp_client;

pub use mcp_client::{ManagerOptions, McpClientManager, McpError};

/// Environment variable overriding [`data_dir`].
pub const DATA_DIR_ENV: &str = "HYDRA_DATA_DIR";

/// Return the data directory used for logs.
///
/// - `HYDRA_DATA_DIR` if set
/// - otherwise the platform data directory joined with `hydra`
///   (e.g. `~/.local/share/hydra`, `~/Library/Application Support/hydra`)
///
/// Falls back to `~/.hydra/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(dir) = dirs::data_dir() {
        return dir.join("hydra");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hydra")
}

/// Where log output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// `<data_dir>/mcp.log`, rotated on every start.
    File,
    Stderr,
}

/// Initialize the tracing subscriber.
///
/// [`LogTarget::File`] writes to `<data_dir>/mcp.log`. The previous runs are
/// kept as `mcp.log.1` (newest) through `mcp.log.3`. If the file cannot be
/// opened, logs go to stderr instead. `RUST_LOG` overrides the default
/// filter. Does nothing if a subscriber is already installed.
pub fn init_tracing(target: LogTarget) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hydra_mcp=info,warn"));
    let log_path = data_dir().join(LOG_FILE_NAME);

    let sink = match target {
        LogTarget::File => match SyncedLogFile::open_rotated(&log_path) {
            Ok(sink) => Some(sink),
            Err(e) => {
                eprintln!("hydra-mcp: cannot open {}: {e}", log_path.display());
                None
            }
        },
        LogTarget::Stderr => None,
    };
    let to_file = sink.is_some();

    let builder = fmt::fmt().with_env_filter(filter).with_target(true);
    let installed = match sink {
        Some(sink) => builder.with_writer(sink).with_ansi(false).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    if installed.is_err() {
        return;
    }

    if to_file {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %log_path.display(),
            pid = std::process::id(),
            "hydra-mcp started"
        );
    }
}

const LOG_FILE_NAME: &str = "mcp.log";
const KEPT_LOGS: u32 = 3;

/// `<path>.<n>`
fn numbered_log(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Shift `path.n` to `path.n+1` for every `n < keep`, then `path` to
/// `path.1`. Whatever sat at `path.keep` is dropped.
fn rotate_log_file(path: &Path, keep: u32) {
    let _ = std::fs::remove_file(numbered_log(path, keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(numbered_log(path, n), numbered_log(path, n + 1));
    }
    let _ = std::fs::rename(path, numbered_log(path, 1));
}

/// Log file handle shared by every subscriber writer. Each record is
/// flushed as soon as it is written, so the file is complete up to the last
/// event when the process dies.
#[derive(Clone)]
struct SyncedLogFile {
    file: Arc<Mutex<File>>,
}

impl SyncedLogFile {
    fn open_rotated(path: &Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        rotate_log_file(path, KEPT_LOGS);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }

    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn file(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for SyncedLogFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.file();
        file.write_all(buf)?;
        file.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SyncedLogFile {
    type Writer = SyncedLogFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_rotate_log_file_keeps_last_three() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("mcp.log");
        for round in 0..5 {
            std::fs::write(&base, format!("run {round}")).unwrap();
            rotate_log_file(&base, 3);
        }

        assert!(!base.exists());
        let newest = std::fs::read_to_string(dir.path().join("mcp.log.1")).unwrap();
        assert_eq!(newest, "run 4");
        assert!(dir.path().join("mcp.log.3").exists());
        assert!(!dir.path().join("mcp.log.4").exists());
    }

    #[test]
    fn test_synced_log_file_writes_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        let mut writer = SyncedLogFile::new(File::create(&path).unwrap());
        writer.write_all(b"line\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line\n");
    }

    #[test]
    fn test_open_rotated_creates_dir_and_shifts_previous() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join(LOG_FILE_NAME);

        SyncedLogFile::open_rotated(&path).unwrap();
        std::fs::write(&path, "first run").unwrap();
        SyncedLogFile::open_rotated(&path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        assert_eq!(
            std::fs::read_to_string(numbered_log(&path, 1)).unwrap(),
            "first run"
        );
    }

    #[test]
    #[serial]
    fn test_data_dir_env_override() {
        let dir = TempDir::new().unwrap();
        std::env::set_var(DATA_DIR_ENV, dir.path());
        assert_eq!(data_dir(), dir.path());
        std::env::remove_var(DATA_DIR_ENV);
        assert_ne!(data_dir(), dir.path());
    }
}
