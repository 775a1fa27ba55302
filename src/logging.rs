use std::sync::Once;

use log::LevelFilter;

use crate::errors::{LinkError, Result};

static LOG_ONCE: Once = Once::new();

/// Filter directives from `SM1_LOG`, falling back to `RUST_LOG`.
fn env_filters() -> Option<String> {
    std::env::var("SM1_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

pub fn parse_level(input: &str) -> Result<LevelFilter> {
    input
        .trim()
        .parse::<LevelFilter>()
        .map_err(|_| LinkError::InvalidConfig(format!("unknown log level '{input}'")))
}

/// Install the stderr logger based on `SM1_LOG`/`RUST_LOG` (default `info`).
pub fn init_logging() {
    init_logging_with(None);
}

/// Install the stderr logger. An explicit `level` overrides the environment.
///
/// Only the first call installs a logger; later calls only adjust the level.
pub fn init_logging_with(level: Option<LevelFilter>) {
    LOG_ONCE.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder
            .filter_level(LevelFilter::Info)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false);
        match (level, env_filters()) {
            (Some(level), _) => {
                builder.filter_level(level);
            }
            (None, Some(filters)) => {
                builder.parse_filters(&filters);
            }
            (None, None) => {}
        }
        // Another logger may already be installed by the host application.
        let _ = builder.try_init();
    });
    if let Some(level) = level {
        set_level(level);
    }
}

/// Change the global maximum level at runtime.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
