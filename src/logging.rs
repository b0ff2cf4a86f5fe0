use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Configure the tracing subscriber for stdout logging.
///
/// The filter honours `RUST_LOG` and defaults to `info`.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false).compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}
