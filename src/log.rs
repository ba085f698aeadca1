//! Initialisation of the engine's logging, built on the `fern`
//! dispatcher over the `log` facade. The level can be overridden with
//! the `XPANSION_LOG_LEVEL` environment variable.

use chrono::Local;
use fern::colors::{Color, ColoredLevelConfig};
use fern::Dispatch;
use std::env;

/// Initialise the logger with timestamped, colourised output on
/// stdout.
///
/// The given level is the default; the `XPANSION_LOG_LEVEL` environment
/// variable (error, warn, info, debug, trace, off) takes precedence.
/// Fails if a logger has already been installed.
pub fn init(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    let level = match env::var("XPANSION_LOG_LEVEL") {
        Ok(value) => match value.to_lowercase().as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "info" => log::LevelFilter::Info,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => level,
        },
        Err(_) => level,
    };

    // Format timestamp as HH:MM:SS
    let timestamp_format = "%H:%M:%S";

    let colours = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::Magenta);

    Dispatch::new()
        .format(move |out, message, record| {
            let timestamp = Local::now().format(timestamp_format);
            out.finish(format_args!(
                "[{} {} {}] {}",
                timestamp,
                colours.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_second_initialisation_fails() {
        // the first call may race with other crates installing loggers,
        // so only the second call has a guaranteed outcome
        let _ = init(log::LevelFilter::Warn);
        assert!(init(log::LevelFilter::Warn).is_err());
    }
}
