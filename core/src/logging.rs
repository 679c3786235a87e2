use crate::error::{Result, ShardError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize stdout logging.
///
/// `level` is an `EnvFilter` directive (`"info"`, `"shardstate=debug"`, ...);
/// `RUST_LOG` overrides it. Fails if a global subscriber is already installed.
pub fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .try_init()
        .map_err(|e| ShardError::Config(format!("failed to initialize logging: {}", e)))?;

    Ok(())
}
