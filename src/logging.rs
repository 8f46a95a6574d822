//! Tracing setup — stderr or a rotated, line-flushed log file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Filter used when neither `--log-level` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "tool_proxy=info,warn";

/// Rotated log files kept next to the active one.
pub const LOG_FILES_KEPT: u32 = 3;

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging options, usually taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Explicit filter directive. Overrides `RUST_LOG`.
    pub level: Option<String>,
    pub format: LogFormat,
    /// Write to this file instead of stderr.
    pub file: Option<PathBuf>,
}

/// Install the global tracing subscriber.
///
/// With a log file: rotates existing logs (`proxy.log` → `proxy.log.1` →
/// … → `.3`), then opens a fresh file behind a line-flushing writer.
pub fn init_tracing(options: &LogOptions) -> std::io::Result<()> {
    let filter = match &options.level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        None => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        }
    };

    match &options.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            rotate_log_file(path, LOG_FILES_KEPT);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            install(filter, options.format, FlushingWriter::new(file), false);
        }
        None => install(filter, options.format, std::io::stderr, true),
    }
    Ok(())
}

fn install<W>(filter: EnvFilter, format: LogFormat, writer: W, ansi: bool)
where
    W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(false);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = match format {
        LogFormat::Text => builder.with_ansi(ansi).try_init(),
        LogFormat::Json => builder.json().with_ansi(false).try_init(),
    };
}

/// Rotate log files: `base` → `base.1` → `.2` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files are skipped.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    let numbered = |i: u32| PathBuf::from(format!("{}.{i}", base_path.display()));
    let _ = std::fs::remove_file(numbered(keep));

    for i in (1..keep).rev() {
        let _ = std::fs::rename(numbered(i), numbered(i + 1));
    }

    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// A file writer that flushes after every write, so each log line is on
/// disk even if the proxy is killed.
#[derive(Clone)]
pub struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.file.lock();
        let n = file.write(buf)?;
        file.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.lock().flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
