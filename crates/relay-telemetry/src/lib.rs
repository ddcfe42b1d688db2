//! Process-wide `tracing` setup for the relay binaries.
//!
//! One stdout fmt layer (JSON or human-readable) behind a reloadable
//! [`EnvFilter`]. Both the filter and the output format can be swapped at
//! runtime through [`TelemetryGuard`], so logging can start before settings
//! are loaded and pick up their levels afterwards. `RUST_LOG`, when set,
//! wins over the configured levels at startup.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

type FilteredRegistry = Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type FormatLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "relay_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per line instead of the compact text format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build a config from a textual level such as `"debug"`.
    ///
    /// Unknown level names fall back to `INFO`.
    pub fn from_level_str(level: &str, json: bool) -> Self {
        Self {
            log_level: Level::from_str(level.trim()).unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json,
        }
    }

    #[must_use]
    pub fn with_module_level(mut self, module: impl Into<String>, level: Level) -> Self {
        self.module_levels.push((module.into(), level));
        self
    }
}

/// Keeps the reload handles for the installed filter and format.
pub struct TelemetryGuard {
    base_level: RwLock<Level>,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    json: AtomicBool,
    from_env: bool,
    reload_handle: Option<reload::Handle<EnvFilter, Registry>>,
    format_handle: Option<reload::Handle<FormatLayer, FilteredRegistry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
        }
        self.reload_filter();
    }

    /// Change the default level for modules without an override.
    pub fn set_level(&self, level: Level) {
        *self.base_level.write() = level;
        self.reload_filter();
    }

    pub fn level(&self) -> Level {
        *self.base_level.read()
    }

    /// Switch between JSON and text output.
    pub fn set_json(&self, json: bool) {
        if self.json.swap(json, Ordering::AcqRel) == json {
            return;
        }
        if let Some(handle) = &self.format_handle {
            if let Err(e) = handle.reload(format_layer(json)) {
                tracing::warn!(error = %e, "failed to switch log format");
            }
        }
    }

    pub fn is_json(&self) -> bool {
        self.json.load(Ordering::Acquire)
    }

    /// Whether `RUST_LOG` supplied the filter at startup.
    pub fn env_filter_active(&self) -> bool {
        self.from_env
    }

    fn reload_filter(&self) {
        let directives = filter_directives(self.level(), &self.level_filter.read());
        let Some(handle) = &self.reload_handle else {
            return;
        };
        match EnvFilter::try_new(&directives) {
            Ok(filter) => {
                if let Err(e) = handle.reload(filter) {
                    tracing::warn!(error = %e, "failed to reload log filter");
                }
            }
            Err(e) => tracing::warn!(error = %e, directives, "invalid log filter"),
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }

    /// Whether this guard controls the process-wide subscriber.
    ///
    /// False when another subscriber was already installed (tests, embedding).
    pub fn is_installed(&self) -> bool {
        self.reload_handle.is_some()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call leaves the existing subscriber in place and returns a guard
/// whose level changes are only recorded.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let level_filter = Arc::new(RwLock::new(config.module_levels.clone()));

    let directives = filter_directives(config.log_level, &config.module_levels);
    let (env_filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(&directives), false),
    };
    let (filter_layer, reload_handle) = reload::Layer::new(env_filter);
    let (output_layer, format_handle) = reload::Layer::new(format_layer(config.json));

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(output_layer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        base_level: RwLock::new(config.log_level),
        level_filter,
        json: AtomicBool::new(config.json),
        from_env,
        reload_handle: installed.then_some(reload_handle),
        format_handle: installed.then_some(format_handle),
    }
}

fn format_layer(json: bool) -> FormatLayer {
    if json {
        Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_span_list(true),
        )
    } else {
        Box::new(tracing_subscriber::fmt::layer().with_target(true).compact())
    }
}

fn filter_directives(base: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter_str = base.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}
