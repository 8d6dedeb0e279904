use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber.
///
/// The filter comes from `CHATVAULT_LOG`, then `RUST_LOG`, then `info`.
/// Calling this more than once is harmless.
pub fn init() {
    let filter = std::env::var("CHATVAULT_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
