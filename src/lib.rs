pub mod agent_core;
pub mod config;
pub mod evaluation;
pub mod inference;
pub mod mcp_client;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub use agent_core::{AgentError, ExecutionDriver, QueryResponse, RequestError, RequestResult};
pub use config::AgentConfig;

/// Return the platform-standard data directory for mcp-agent.
///
/// - macOS: `~/Library/Application Support/mcp-agent/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-agent\`
/// - Linux: `$XDG_DATA_HOME/mcp-agent/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-agent/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-agent");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-agent")
}

/// Where log output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// One JSON object per line instead of human-readable text.
    pub json: bool,
    /// Write to stderr instead of the rotated log file.
    pub stderr: bool,
}

/// Initialize the tracing subscriber.
///
/// By default logs go to `agent.log` in [`data_dir`]: existing logs are
/// rotated (agent.log → agent.log.1 → .2 → .3) and the fresh file is written
/// through a line-flushing writer. `RUST_LOG` overrides the default filter.
/// Returns the log file path, or `None` when logging to stderr.
pub fn init_tracing(options: LogOptions) -> io::Result<Option<PathBuf>> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_agent=info,warn"));

    let (log_path, writer) = if options.stderr {
        (None, fmt::writer::BoxMakeWriter::new(io::stderr))
    } else {
        let log_dir = data_dir();
        std::fs::create_dir_all(&log_dir)?;
        let log_path = log_dir.join("agent.log");
        rotate_log_file(&log_path, 3);

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        (
            Some(log_path),
            fmt::writer::BoxMakeWriter::new(FlushingWriter::new(log_file)),
        )
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);
    let installed = if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| io::Error::other(format!("tracing already initialized: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "stderr".into()),
        pid = std::process::id(),
        "=== mcp-agent starting ==="
    );

    Ok(log_path)
}

/// Rotate log files: `agent.log` → `agent.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Each log line reaches disk immediately, so the tail of the log survives a
/// crash or a killed process.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| io::Error::other(format!("lock poisoned: {e}")))?;
        let n = io::Write::write(&mut *f, buf)?;
        io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| io::Error::other(format!("lock poisoned: {e}")))?;
        io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
