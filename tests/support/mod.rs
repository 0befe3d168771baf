/// Installs a `tracing` subscriber writing to the test harness's captured
/// output, so `cargo test -- --nocapture` shows merge/lock diagnostics.
/// Safe to call from every test; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
