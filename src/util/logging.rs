use tracing_subscriber::EnvFilter;

/// Installs a global fmt subscriber.
///
/// `RUST_LOG` wins over `default_filter` when it is set. Returns `false` when a
/// global subscriber was already installed, which is not an error: tests and
/// embedding applications may initialise logging more than once.
pub fn init(default_filter: &str) -> bool {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::new(default_filter),
    };
    return tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();
}
