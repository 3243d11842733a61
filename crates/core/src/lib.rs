//! Autonomous plan → review → execute → reflect → memorize → evolve loop.

pub mod config;
pub mod context;
pub mod conversation;
pub mod evolve;
pub mod failure;
pub mod model;
pub mod pipeline;
pub mod prompts;
pub mod runtime;
pub mod store;
pub mod types;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `EVOLOOP_LOG_FORMAT=json` switches to JSON
/// lines; the filter comes from `RUST_LOG` and defaults to `info`.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let result = match std::env::var("EVOLOOP_LOG_FORMAT").as_deref() {
        Ok("json") => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))
}
