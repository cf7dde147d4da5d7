//! Process-wide logger setup.
//!
//! Logs go to stderr; stdout is reserved for passphrases and unlock status.

use env_logger::{Builder, Env, Target};
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialise `env_logger` once, honouring `RUST_LOG` and falling back to `default_level`.
pub fn init(default_level: &str) {
    INIT.call_once(|| {
        let env = Env::default().default_filter_or(default_level);
        let _ = Builder::from_env(env)
            .target(Target::Stderr)
            .format_timestamp_secs()
            .try_init();
    });
}
