/// Install the process-wide logger. The `log` facade is the leveled sink the
/// rest of the crate writes to; tests can install their own logger instead.
pub fn init(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .try_init()
        .ok();
}
