use crate::core::errors::{TetherError, TetherResult};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Connection-level noise from the HTTP stack stays at warn unless asked for
const QUIET_DEPENDENCIES: &str = "hyper=warn,hyper_util=warn";

/// Build the filter: `RUST_LOG` when set, otherwise `log_level`
fn build_filter(log_level: &str) -> TetherResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(format!("{},{}", log_level, QUIET_DEPENDENCIES))
        .map_err(|e| TetherError::validation(format!("invalid log level '{}': {}", log_level, e)))
}

/// Install the global tracing subscriber
///
/// JSON output is one object per line with the service field flattened in;
/// the human format keeps targets and thread ids. Fails if a subscriber is
/// already installed.
pub fn init_logger(log_level: &str, json_logs: bool) -> TetherResult<()> {
    let env_filter = build_filter(log_level)?;

    let installed = if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
    };

    installed.map_err(|e| TetherError::validation(format!("logger already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_levels_and_rejects_garbage() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(build_filter("debug").is_ok());
        assert!(build_filter("tether_core=trace").is_ok());
        assert!(build_filter("tether_core=loud").is_err());
    }
}
