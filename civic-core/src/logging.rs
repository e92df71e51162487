use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive, e.g. `CIVIC_LOG=debug`.
pub const LOG_ENV: &str = "CIVIC_LOG";

/// Install the global subscriber. Logs go to stderr so stdout stays machine readable.
pub fn init(default_directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow!("failed to install the logger: {err}"))
}
