use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ScriptLogLevel;

const MAX_LOG_SIZE: u64 = 1024 * 1024; // 1MB

/// Initialize logging for an embedding process.
///
/// - `component_name`: Name of the log file stem (e.g., "client", "editor")
/// - `file_enabled`: If true, also writes to `<data dir>/hearth/logs/<component>.log`.
///
/// - `script_level`: Level for the `script` target guest `logger` output is emitted under.
///   `RUST_LOG` overrides both levels.
///
/// Returns a guard that must be kept alive for the duration of the program.
pub fn init_logging(
    component_name: &str,
    file_enabled: bool,
    script_level: ScriptLogLevel,
) -> io::Result<Option<WorkerGuard>> {
    if !file_enabled {
        tracing_subscriber::fmt()
            .with_env_filter(default_filter(script_level))
            .init();
        return Ok(None);
    }

    let log_dir = log_directory()?;
    fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join(format!("{}.log", component_name));
    truncate_if_needed(&log_path)?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(BufWriter::new(file));

    tracing_subscriber::registry()
        .with(default_filter(script_level))
        .with(fmt::layer().with_writer(io::stdout).with_ansi(true))
        .with(
            fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    tracing::info!(target: "hearth", "Logging to file: {}", log_path.display());

    Ok(Some(guard))
}

fn default_filter(script_level: ScriptLogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(script_level)))
}

fn default_directives(script_level: ScriptLogLevel) -> String {
    format!("info,script={}", script_level.directive())
}

fn log_directory() -> io::Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "hearth")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Failed to find home directory"))?;
    Ok(dirs.data_dir().join("logs"))
}

/// Truncate log file if it exceeds MAX_LOG_SIZE.
fn truncate_if_needed(log_path: &Path) -> io::Result<()> {
    if log_path.exists() && fs::metadata(log_path)?.len() > MAX_LOG_SIZE {
        let file = File::create(log_path)?;
        file.set_len(0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_script_target_gets_its_own_level() {
        assert_eq!(default_directives(ScriptLogLevel::Debug), "info,script=debug");
        assert_eq!(default_directives(ScriptLogLevel::None), "info,script=off");
        assert!(EnvFilter::try_new(default_directives(ScriptLogLevel::Warn)).is_ok());
    }

    #[test]
    fn test_truncate_only_past_limit() {
        let dir = tempdir().unwrap();
        let small = dir.path().join("small.log");
        let large = dir.path().join("large.log");
        fs::write(&small, b"keep me").unwrap();
        fs::write(&large, vec![b'x'; (MAX_LOG_SIZE + 1) as usize]).unwrap();

        truncate_if_needed(&small).unwrap();
        truncate_if_needed(&large).unwrap();
        truncate_if_needed(&dir.path().join("absent.log")).unwrap();

        assert_eq!(fs::metadata(&small).unwrap().len(), 7);
        assert_eq!(fs::metadata(&large).unwrap().len(), 0);
    }
}
