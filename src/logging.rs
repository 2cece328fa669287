//! Compact timestamped logging with per-module levels.
//!
//! # Configuration
//!
//! ```toml
//! [logging]
//! default = "warn"  # quiet by default
//!
//! [logging.modules]
//! watchhub = "debug"
//! ```
//!
//! `RUST_LOG` takes precedence over config:
//! ```bash
//! RUST_LOG=watchhub=debug watchhub watch .
//! ```

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Compact time format: HH:MM:SS.mmm
struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Build the filter directive string from config.
fn filter_directives(config: &LoggingConfig) -> String {
    let mut directives = config.default.clone();
    let mut modules: Vec<_> = config.modules.iter().collect();
    modules.sort();
    for (module, level) in modules {
        directives.push_str(&format!(",{module}={level}"));
    }
    directives
}

/// Initialize logging with configuration.
///
/// Only the first call takes effect.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(filter_directives(config))
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_timer(CompactTime)
            .with_level(true)
            .with_writer(std::io::stderr)
            .with_filter(filter);

        // A subscriber installed elsewhere (e.g. by a host application) wins.
        let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
    });
}

/// Initialize logging with `LoggingConfig::default()` (warnings and errors).
pub fn init() {
    init_with_config(&LoggingConfig::default());
}

/// Info-level lifecycle line tagged with the emitting component.
///
/// Components in this crate are `registrar`, `hub`, `supervisor`, `branch`,
/// `bus` and `watch` (the CLI). The optional tail is a format string.
///
/// ```ignore
/// log_event!("supervisor", "watching", "{}", path.display());
/// log_event!("watch", "shutting down");
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:literal, $event:expr $(,)?) => {
        tracing::info!("[{}] {}", $component, $event)
    };
    ($component:literal, $event:expr, $($arg:tt)+) => {
        tracing::info!("[{}] {}: {}", $component, $event, format_args!($($arg)+))
    };
}

/// Debug-level counterpart of [`log_event!`], used for per-path churn such
/// as registrations, releases, drops and retry attempts.
///
/// ```ignore
/// debug_event!("registrar", "released", "{} ({active} active)", path.display());
/// debug_event!("hub", "dropped", "{ty} for {}", path.display());
/// ```
#[macro_export]
macro_rules! debug_event {
    ($component:literal, $event:expr $(,)?) => {
        tracing::debug!("[{}] {}", $component, $event)
    };
    ($component:literal, $event:expr, $($arg:tt)+) => {
        tracing::debug!("[{}] {}: {}", $component, $event, format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        let mut config = LoggingConfig::default();
        assert_eq!(filter_directives(&config), "warn");

        config.modules.insert("watchhub::watcher".to_string(), "debug".to_string());
        config.modules.insert("notify".to_string(), "error".to_string());
        assert_eq!(
            filter_directives(&config),
            "warn,notify=error,watchhub::watcher=debug"
        );
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init_with_config(&LoggingConfig::default());

        let path = std::path::Path::new("/plan.md");
        crate::log_event!("supervisor", "watching", "{}", path.display());
        crate::debug_event!("hub", "closed");
    }
}
