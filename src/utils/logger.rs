use env_logger::Env;

/// Logs go to stderr; stdout carries the wrapped task's output.
pub fn setup_logger() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();
}
