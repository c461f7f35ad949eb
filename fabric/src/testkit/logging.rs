use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber writing through the test harness, filtered by `RUST_LOG` (default
/// `fabric=warn`). Safe to call from every test; only the first call installs anything.
pub fn init() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fabric=warn"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_test_writer()
    .try_init();
}
