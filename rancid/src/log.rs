//! Logging setup shared by `rancid` binaries

pub use tracing_subscriber::{filter::ParseError as InvalidLogFilter, EnvFilter as LogFilter};

/// The environment variable read for the log filter.
pub const LOG_ENV: &str = "RANCID_LOG";

const DEFAULT_FILTER: &str = "rancid=info,warn";

/// Log filter and format flags.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct LogArgs {
    /// Which spans and events to emit, e.g. `rancid=debug,warn`
    #[cfg_attr(
        feature = "clap",
        clap(long, env = LOG_ENV, default_value = DEFAULT_FILTER, value_parser = parse_filter)
    )]
    pub log_level: String,

    /// `plain` or `json`
    #[cfg_attr(feature = "clap", clap(long, value_enum, default_value = "plain"))]
    pub log_format: LogFormat,
}

/// Log output format
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Plain,

    /// One JSON object per event
    Json,
}

/// Logging could not be set up
#[derive(Debug, thiserror::Error)]
pub enum LogInitError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] InvalidLogFilter),

    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// An unrecognized `--log-format` value
#[derive(Debug, thiserror::Error)]
#[error("invalid log format: {0} must be 'plain' or 'json'")]
pub struct InvalidLogFormat(String);

// === impl LogArgs ===

impl Default for LogArgs {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_FILTER.to_string(),
            log_format: LogFormat::Plain,
        }
    }
}

impl LogArgs {
    /// Builds the configured filter.
    pub fn filter(&self) -> Result<LogFilter, InvalidLogFilter> {
        LogFilter::try_new(&self.log_level)
    }

    /// Attempts to configure the global default tracing subscriber.
    pub fn try_init(&self) -> Result<(), LogInitError> {
        self.log_format.try_init(self.filter()?)
    }
}

#[cfg(feature = "clap")]
fn parse_filter(s: &str) -> Result<String, InvalidLogFilter> {
    LogFilter::try_new(s)?;
    Ok(s.to_string())
}

// === impl LogFormat ===

impl std::str::FromStr for LogFormat {
    type Err = InvalidLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            _ => Err(InvalidLogFormat(s.to_string())),
        }
    }
}

impl LogFormat {
    /// Installs a global subscriber writing to stderr.
    ///
    /// Fails if a subscriber or `log` logger is already installed.
    pub fn try_init(self, filter: LogFilter) -> Result<(), LogInitError> {
        use tracing_subscriber::{fmt, prelude::*};

        let logs = tracing_subscriber::registry().with(filter);
        match self {
            Self::Plain => logs
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .try_init()?,

            Self::Json => {
                let events = fmt::format()
                    .json()
                    .with_span_list(true)
                    .with_current_span(false);
                logs.with(
                    fmt::layer()
                        .event_format(events)
                        .fmt_fields(fmt::format::JsonFields::default())
                        .with_writer(std::io::stderr),
                )
                .try_init()?
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!("plain".parse::<LogFormat>().ok(), Some(LogFormat::Plain));
        assert_eq!("json".parse::<LogFormat>().ok(), Some(LogFormat::Json));
        assert_eq!("JSON".parse::<LogFormat>().ok(), Some(LogFormat::Json));
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn validates_filters() {
        assert!(LogArgs::default().filter().is_ok());
        let args = LogArgs {
            log_level: "rancid=notalevel".to_string(),
            ..Default::default()
        };
        assert!(args.filter().is_err());
    }
}
