//! Console + rotating-file logging for svckit hosts.
//!
//! Sections of [`LoggingConfig`] are keyed by tracing target prefix
//! (`svckit::resolver`, `demo`, ...); `default` covers everything else.
//! Console output goes to stderr through a non-blocking writer, file output
//! is JSON and routed per section to its own rotating file.

use crate::config::{LoggingConfig, Section};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    filter::Targets,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

const DEFAULT_SECTION: &str = "default";
const DEFAULT_MAX_SIZE_MB: u64 = 100;

static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// `None` means the sink is switched off for that section.
fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" | "none" => None,
        _ => Some(LevelFilter::INFO),
    }
}

/// True if `target` is `prefix` itself or a module below it.
fn target_matches(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ---------------------------------------------------------------------------
// rotating file writers

type Rotating = Arc<Mutex<FileRotate<AppendTimestamp>>>;

#[derive(Clone)]
struct FileHandle(Option<Rotating>);

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.0 {
            Some(file) => lock(file)?.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.0 {
            Some(file) => lock(file)?.flush(),
            None => Ok(()),
        }
    }
}

fn lock(file: &Rotating) -> std::io::Result<std::sync::MutexGuard<'_, FileRotate<AppendTimestamp>>> {
    file.lock()
        .map_err(|_| std::io::Error::other("log file writer poisoned"))
}

/// Picks the file of the longest matching section, else the default file.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<Rotating>,
    routes: Vec<(String, Rotating)>,
}

impl FileRouter {
    fn route(&self, target: &str) -> Option<Rotating> {
        self.routes
            .iter()
            .filter(|(prefix, _)| target_matches(target, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, file)| file.clone())
            .or_else(|| self.default.clone())
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.routes.is_empty()
    }
}

impl<'a> MakeWriter<'a> for FileRouter {
    type Writer = FileHandle;

    fn make_writer(&'a self) -> Self::Writer {
        FileHandle(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        FileHandle(self.route(meta.target()))
    }
}

fn open_rotating(section: &Section, base_dir: &Path) -> std::io::Result<Rotating> {
    let path = resolve_log_path(&section.file, base_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Backup count wins over age when both are set.
    let limit = match section.max_backups {
        Some(n) => FileLimit::MaxFiles(n),
        None => FileLimit::Age(chrono::Duration::days(
            i64::from(section.max_age_days.unwrap_or(1)),
        )),
    };
    let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) as usize * 1024 * 1024;

    let rot = FileRotate::new(
        &path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    );
    Ok(Arc::new(Mutex::new(rot)))
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn has_file(section: &Section) -> bool {
    !section.file.trim().is_empty()
}

// ---------------------------------------------------------------------------
// filters

struct Plan<'a> {
    default: Option<&'a Section>,
    sections: Vec<(&'a str, &'a Section)>,
}

impl<'a> Plan<'a> {
    fn new(cfg: &'a LoggingConfig) -> Self {
        let mut sections: Vec<_> = cfg
            .iter()
            .filter(|(k, _)| k.as_str() != DEFAULT_SECTION)
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        sections.sort_by_key(|(k, _)| *k);
        Self {
            default: cfg.get(DEFAULT_SECTION),
            sections,
        }
    }

    fn console_targets(&self) -> Targets {
        let default = self
            .default
            .map_or(Some(LevelFilter::INFO), |s| parse_level(&s.console_level))
            .unwrap_or(LevelFilter::OFF);
        self.sections
            .iter()
            .fold(Targets::new().with_default(default), |t, (target, s)| {
                t.with_target(*target, parse_level(&s.console_level).unwrap_or(LevelFilter::OFF))
            })
    }

    fn file_targets(&self, has_default_file: bool) -> Targets {
        let default = match self.default {
            Some(s) if has_default_file => parse_level(&s.file_level).unwrap_or(LevelFilter::OFF),
            _ => LevelFilter::OFF,
        };
        self.sections
            .iter()
            .filter(|(_, s)| has_file(s))
            .fold(Targets::new().with_default(default), |t, (target, s)| {
                t.with_target(*target, parse_level(&s.file_level).unwrap_or(LevelFilter::OFF))
            })
    }

    fn file_router(&self, base_dir: &Path) -> FileRouter {
        let mut router = FileRouter::default();
        if let Some(section) = self.default.filter(|s| has_file(s)) {
            match open_rotating(section, base_dir) {
                Ok(file) => router.default = Some(file),
                Err(e) => eprintln!("Failed to open default log file '{}': {e}", section.file),
            }
        }
        for (target, section) in self.sections.iter().filter(|(_, s)| has_file(s)) {
            match open_rotating(section, base_dir) {
                Ok(file) => router.routes.push((target.to_string(), file)),
                Err(e) => eprintln!("Failed to open log file for '{target}': {e}"),
            }
        }
        router
    }
}

// ---------------------------------------------------------------------------
// init

/// Install the global subscriber.
///
/// Relative file paths are resolved against `base_dir` (normally the runtime
/// home dir). `RUST_LOG`, when set, caps every sink. Calling this twice is
/// harmless; the second call leaves the first subscriber in place.
pub fn init_logging_unified(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` before installing the subscriber
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    let env = EnvFilter::try_from_default_env().ok();

    if cfg.is_empty() {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339());
        let _ = Registry::default().with(env).with(fmt_layer).try_init();
        return;
    }

    let plan = Plan::new(cfg);
    let router = plan.file_router(base_dir);

    let (stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = fmt::layer()
        .with_writer(stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(plan.console_targets());

    let file_layer = (!router.is_empty()).then(|| {
        let targets = plan.file_targets(router.default.is_some());
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(targets)
    });

    let _ = Registry::default()
        .with(env)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
