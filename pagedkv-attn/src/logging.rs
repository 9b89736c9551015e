use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Environment variable that turns on debug logging when it contains `1`.
pub const DEBUG_ENV_VAR: &str = "PAGEDKV_DEBUG";

/// Install a global `fmt` subscriber. The default level is INFO, or DEBUG when
/// [`DEBUG_ENV_VAR`] is set; `RUST_LOG` directives override both.
///
/// Calling this again after a subscriber is installed is a no-op.
pub fn initialize_logging() {
    let is_debug = std::env::var(DEBUG_ENV_VAR)
        .unwrap_or_default()
        .contains('1');

    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
