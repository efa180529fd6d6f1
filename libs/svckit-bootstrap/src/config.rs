use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::home_dir::resolve_home_dir;

/// Prefix of environment overrides, e.g. `SVCKIT__RUNTIME__TICK_MS=250`.
pub const ENV_PREFIX: &str = "SVCKIT__";

const DEFAULT_SUBDIR: &str = ".svckit";

/// Host configuration: runtime knobs, logging, and where the composition
/// tree comes from.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
    /// Path to a YAML file holding the composition tree.
    #[serde(default)]
    pub composition: Option<String>,
    /// Inline composition tree; wins over `composition`.
    #[serde(default)]
    pub app: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    pub home_dir: String, // will be normalized to absolute path
    /// Drive interval of `root_updater`; 0 disables ticking.
    #[serde(default)]
    pub tick_ms: u64,
    #[serde(default)]
    pub root_updater: Option<String>,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

const fn default_shutdown_timeout() -> u64 {
    30
}

/// Logging configuration - maps target prefixes to their logging settings.
/// Key "default" is the catch-all for targets without their own section.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // "logs/svckit.log"; empty disables the file sink
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>, // How many rotated files to keep
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            // Empty => $HOME/.svckit (%APPDATA%\.svckit on Windows)
            home_dir: String::new(),
            tick_ms: 0,
            root_updater: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl RuntimeConfig {
    pub fn tick(&self) -> Option<Duration> {
        (self.tick_ms > 0).then(|| Duration::from_millis(self.tick_ms))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Create a default logging configuration.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/svckit.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            logging: Some(default_logging_config()),
            composition: None,
            app: None,
        }
    }
}

impl AppConfig {
    /// Layered load: defaults → YAML file → `SVCKIT__*` environment.
    ///
    /// `runtime.home_dir` is normalized and created, and a relative
    /// `composition` path is taken relative to the config file.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let config_path = config_path.as_ref();
        if !config_path.is_file() {
            bail!("config file not found: {}", config_path.display());
        }

        // Optional sections stay None unless YAML or env provides them.
        let base = AppConfig {
            runtime: RuntimeConfig::default(),
            logging: None,
            composition: None,
            app: None,
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

        normalize_home_dir_inplace(&mut config.runtime)
            .context("Failed to resolve runtime.home_dir")?;

        if let Some(composition) = config.composition.as_mut() {
            let p = Path::new(composition.as_str());
            if p.is_relative() {
                if let Some(dir) = config_path.parent() {
                    *composition = dir.join(p).to_string_lossy().into_owned();
                }
            }
        }

        Ok(config)
    }

    /// Load configuration from file or fall back to defaults.
    /// Either way `runtime.home_dir` ends up absolute and created.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut c = Self::default();
                normalize_home_dir_inplace(&mut c.runtime)
                    .context("Failed to resolve runtime.home_dir (defaults)")?;
                Ok(c)
            }
        }
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(path) = &args.composition {
            self.composition = Some(path.clone());
            self.app = None;
        }
        if let Some(tick_ms) = args.tick_ms {
            self.runtime.tick_ms = tick_ms;
        }

        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            default_section.console_level = match args.verbose {
                0 => default_section.console_level.clone(), // keep
                1 => "debug".to_string(),
                _ => "trace".to_string(),
            };
        }
    }

    /// The composition tree as a generic value: the inline `app` section
    /// if present, otherwise the parsed `composition` file.
    pub fn composition_tree(&self) -> Result<serde_json::Value> {
        if let Some(app) = &self.app {
            return Ok(app.clone());
        }
        let Some(path) = &self.composition else {
            bail!("no composition configured: set `app`, `composition` or --composition");
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read composition {path}"))?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse composition {path}"))?;
        serde_json::to_value(yaml).context("Composition is not representable as a tree")
    }
}

/// Command line arguments structure.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub composition: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
    pub tick_ms: Option<u64>,
}

/// Normalize `runtime.home_dir` and store the absolute path back.
fn normalize_home_dir_inplace(runtime: &mut RuntimeConfig) -> Result<()> {
    let opt = if runtime.home_dir.trim().is_empty() {
        None
    } else {
        Some(runtime.home_dir.clone())
    };

    let resolved: PathBuf = resolve_home_dir(opt, DEFAULT_SUBDIR, /*create*/ true)
        .context("home_dir normalization failed")?;

    runtime.home_dir = resolved.to_string_lossy().to_string();
    Ok(())
}
