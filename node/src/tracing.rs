/// Installs the global subscriber. The filter comes from `RUST_LOG`; setting
/// `KEEP_LOG_JSON` switches to one JSON object per line.
pub fn init_logging() {
    let builder =
        tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env());
    if std::env::var_os("KEEP_LOG_JSON").is_some() {
        builder.json().try_init().ok();
    } else {
        builder.try_init().ok();
    }
}
