pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

/// Builds a terminal logger writing to stderr.
pub fn terminal() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Logger configuration must parse");

    config.build_logger().expect("Logger construction failed")
}
