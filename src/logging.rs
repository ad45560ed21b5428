//! Diagnostic logging to stderr
//!
//! Library code logs through the `log` facade. The binary installs
//! `env_logger` with `warn` as the default level, raised to `debug` when
//! `FS_TRACER_DEBUG` is set. `RUST_LOG` takes precedence over both.

use env_logger::Env;

use crate::constants::DEBUG_ENV;

pub fn default_level(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "warn"
    }
}

/// Install the stderr logger; a second call is a no-op
pub fn init_logger() {
    let debug = std::env::var_os(DEBUG_ENV).is_some_and(|value| !value.is_empty());
    let env = Env::default().default_filter_or(default_level(debug));
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_target(false)
        .try_init();
}
