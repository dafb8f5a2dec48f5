use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Target prefix shared by every workspace crate. Events under it follow
/// `--log-level`; everything else is capped at warn.
const JDWPMUX_TARGET: &str = "jdwpmux";

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

fn targets(level: LogLevel) -> Targets {
    let level = LevelFilter::from(level);
    Targets::new()
        .with_target(JDWPMUX_TARGET, level)
        .with_default(level.min(LevelFilter::WARN))
}

/// Install the stderr subscriber. Stdout stays reserved for command output.
///
/// Packet traces are only useful with their origin, so targets are shown
/// from `debug` up.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let verbose = LevelFilter::from(level) >= LevelFilter::DEBUG;
    let registry = tracing_subscriber::registry().with(targets(level));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(verbose);

    let _ = match format {
        LogFormat::Text => registry.with(layer).try_init(),
        LogFormat::Json => registry
            .with(layer.json().with_current_span(false).with_span_list(false))
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    fn enabled(targets: &Targets, target: &str, level: Level) -> bool {
        targets.would_enable(target, &level)
    }

    #[test]
    fn level_applies_to_own_crates_only() {
        let filter = targets(LogLevel::Trace);
        assert!(enabled(&filter, "jdwpmux_session::shared", Level::TRACE));
        assert!(enabled(&filter, "jdwpmux", Level::DEBUG));
        assert!(!enabled(&filter, "tokio::runtime", Level::INFO));
        assert!(enabled(&filter, "tokio::runtime", Level::WARN));
    }

    #[test]
    fn quiet_levels_also_quiet_dependencies() {
        let filter = targets(LogLevel::Error);
        assert!(!enabled(&filter, "jdwpmux_process::registry", Level::WARN));
        assert!(!enabled(&filter, "mio", Level::WARN));
        assert!(enabled(&filter, "mio", Level::ERROR));

        let off = targets(LogLevel::Off);
        assert!(!enabled(&off, "jdwpmux", Level::ERROR));
    }
}
