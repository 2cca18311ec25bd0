use crate::error::Result;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber for the bootstrap process.
///
/// `RUST_LOG` wins when set; the default keeps this crate at `info` so stage
/// transitions and probe attempts are visible without flooding the console
/// with dependency chatter.
pub fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("aquila_bootstrap=info,info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}
