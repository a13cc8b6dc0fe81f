//! Process logging: one console sink plus at most one per-project file sink.

use std::fs::{self, OpenOptions};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::subscriber::DefaultGuard;
use tracing::Subscriber;
use tracing_subscriber::fmt::{self, time::ChronoLocal};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

pub const LOGLEVEL_ENV: &str = "FASTMDS_LOGLEVEL";
pub const LOG_STYLE_ENV: &str = "FASTMDS_LOG_STYLE";
pub const PROJECT_LOG_FILE: &str = "fastmds.log";

const PRETTY_TIME: &str = "%H:%M:%S";
const PLAIN_TIME: &str = "%Y-%m-%d %H:%M:%S,%3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogStyle {
    #[default]
    Pretty,
    Plain,
}

impl FromStr for LogStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogStyle::Pretty),
            "plain" => Ok(LogStyle::Plain),
            other => Err(format!("unknown log style '{}'", other)),
        }
    }
}

impl LogStyle {
    /// First parseable candidate, then `FASTMDS_LOG_STYLE`, then pretty.
    pub fn resolve<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> LogStyle {
        candidates
            .into_iter()
            .flatten()
            .find_map(|s| s.parse().ok())
            .or_else(|| {
                std::env::var(LOG_STYLE_ENV)
                    .ok()
                    .and_then(|s| s.parse().ok())
            })
            .unwrap_or_default()
    }
}

type FileLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Identifies one attached file sink.
#[derive(Debug, PartialEq, Eq)]
pub struct FileSinkHandle {
    id: u64,
    path: PathBuf,
}

impl FileSinkHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Owns the reloadable file slot of the installed subscriber. Attaching a
/// file replaces the previous one; detaching a stale handle does nothing.
pub struct LogContext {
    style: LogStyle,
    slot: reload::Handle<Option<FileLayer>, Registry>,
    current: Mutex<Option<u64>>,
    next_id: AtomicU64,
}

impl LogContext {
    /// Installs the process-wide subscriber.
    pub fn install(style: LogStyle) -> io::Result<LogContext> {
        let (subscriber, ctx) = Self::build(style);
        tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;
        Ok(ctx)
    }

    /// Installs the subscriber for the current thread until the guard drops.
    pub fn scoped(style: LogStyle) -> (LogContext, DefaultGuard) {
        let (subscriber, ctx) = Self::build(style);
        let guard = tracing::subscriber::set_default(subscriber);
        (ctx, guard)
    }

    fn build(style: LogStyle) -> (impl Subscriber + Send + Sync + 'static, LogContext) {
        let (file_slot, slot) = reload::Layer::new(None::<FileLayer>);
        let filter = EnvFilter::try_from_env(LOGLEVEL_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
        let ansi = io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();

        let pretty = (style == LogStyle::Pretty).then(|| {
            fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(ansi)
                .with_target(false)
                .with_timer(ChronoLocal::new(PRETTY_TIME.to_string()))
                .compact()
        });
        let plain = (style == LogStyle::Plain).then(|| {
            fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(false)
                .with_target(false)
                .with_timer(ChronoLocal::new(PLAIN_TIME.to_string()))
        });

        let subscriber = tracing_subscriber::registry()
            .with(file_slot)
            .with(filter)
            .with(pretty)
            .with(plain);
        let ctx = LogContext {
            style,
            slot,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        };
        (subscriber, ctx)
    }

    pub fn style(&self) -> LogStyle {
        self.style
    }

    /// Appends plain-style records to `path`, replacing any file sink
    /// attached before.
    pub fn attach_file(&self, path: &Path) -> io::Result<FileSinkHandle> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let layer: FileLayer = fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_timer(ChronoLocal::new(PLAIN_TIME.to_string()))
            .boxed();
        self.slot.reload(Some(layer)).map_err(io::Error::other)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut current) = self.current.lock() {
            *current = Some(id);
        }
        Ok(FileSinkHandle {
            id,
            path: path.to_path_buf(),
        })
    }

    pub fn detach(&self, handle: FileSinkHandle) {
        let Ok(mut current) = self.current.lock() else {
            return;
        };
        if *current != Some(handle.id) {
            return;
        }
        if self.slot.reload(None).is_ok() {
            *current = None;
        }
    }
}
