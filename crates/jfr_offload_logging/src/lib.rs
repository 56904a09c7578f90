//! Shared logging setup for the JFR offload daemon.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Crates whose verbosity follows the configured level. Everything else stays at `warn`
/// so the AWS SDK and hyper do not flood the output at `debug`.
const DAEMON_TARGETS: &[&str] = &["jfr_offload", "jfr_offload_logging"];
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Console output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line, for log collectors.
    #[default]
    Json,
    /// Human readable text.
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" | "plain" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format '{other}' (expected json or text)")),
        }
    }
}

/// Logging configuration for the daemon binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Verbosity level name (`debug`, `info`, `warn`, `error`). Unknown values fall back to `info`.
    pub level: Option<&'a str>,
    pub format: LogFormat,
    /// When set, a size-rotated copy of the log is also written here.
    pub log_dir: Option<PathBuf>,
}

/// Map a user supplied level name onto a tracing level directive.
pub fn level_directive(level: Option<&str>) -> &'static str {
    match level.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

/// Default filter directives when `RUST_LOG` is not set.
pub fn default_filter(level: Option<&str>) -> String {
    let level = level_directive(level);
    let mut directives = vec!["warn".to_string()];
    directives.extend(DAEMON_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

fn build_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)))
}

/// Initialize tracing with console output and an optional rolling file writer.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_writer(io::stdout)
            .with_filter(build_filter(config.level))
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(io::stdout)
            .with_filter(build_filter(config.level))
            .boxed(),
    };
    layers.push(console);

    if let Some(dir) = config.log_dir {
        let log = SizeRotatedLog::open(&dir, config.app_name, RotationPolicy::default())
            .with_context(|| format!("Failed to open log file in {}", dir.display()))?;
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(log))
                .with_ansi(false)
                .with_filter(build_filter(config.level))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!(level = level_directive(config.level), "Logger initialized");
    Ok(())
}

/// Size cap and retained file count for the `--log-dir` copy.
#[derive(Debug, Clone, Copy)]
struct RotationPolicy {
    max_bytes: u64,
    keep: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: MAX_LOG_FILE_SIZE,
            keep: MAX_LOG_FILES,
        }
    }
}

/// `<dir>/<stem>.log`, shifted down to `<stem>.log.1`, `.log.2`, ... once full.
struct SizeRotatedLog {
    active: PathBuf,
    policy: RotationPolicy,
    file: File,
    written: u64,
}

impl SizeRotatedLog {
    fn open(dir: &Path, app_name: &str, policy: RotationPolicy) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let active = dir.join(format!("{}.log", log_stem(app_name)));
        let file = open_append(&active)?;
        let written = file.metadata()?.len();

        let mut log = Self {
            active,
            policy,
            file,
            written,
        };
        if log.written > policy.max_bytes {
            log.roll()?;
        }
        Ok(log)
    }

    fn generation(&self, n: usize) -> PathBuf {
        let mut name = self.active.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let generations = self.policy.keep.saturating_sub(1);
        if generations == 0 {
            self.file = File::create(&self.active)?;
        } else {
            remove_if_present(&self.generation(generations))?;
            for n in (1..generations).rev() {
                rename_if_present(&self.generation(n), &self.generation(n + 1))?;
            }
            rename_if_present(&self.active, &self.generation(1))?;
            self.file = open_append(&self.active)?;
        }

        self.written = 0;
        Ok(())
    }
}

impl Write for SizeRotatedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let incoming = buf.len() as u64;
        if self.written > 0 && self.written.saturating_add(incoming) > self.policy.max_bytes {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn rename_if_present(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// File stem for the app's logs: `[A-Za-z0-9_-]` only.
fn log_stem(app_name: &str) -> String {
    let stem: String = app_name
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect();
    if stem.is_empty() {
        "jfr-offload".to_string()
    } else {
        stem
    }
}
