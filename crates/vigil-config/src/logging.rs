use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Supported logging output formats.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// Structured JSON suitable for ingestion by logging stacks.
    Json,
    /// Human-readable single line output.
    #[default]
    Compact,
}

/// Errors encountered while parsing a [`LogFormat`] or [`LogLevel`] from text.
pub type LogFormatParseError = strum::ParseError;

/// Log level names understood by supervised daemons on their command line.
///
/// The ordering follows increasing verbosity so that `LogLevel::Garbage` is the
/// noisiest level a daemon can be asked for.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    EnumString,
    Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogLevel {
    /// Warnings and errors only.
    #[default]
    Warning,
    /// Informational messages.
    Info,
    /// Debug output.
    Debug,
    /// Trace output.
    Trace,
    /// Everything, including per-message wire dumps.
    Garbage,
}

impl LogLevel {
    /// Maps an integer verbosity count onto a daemon log level.
    ///
    /// The scale matches the `-v` count of the test runner: `2` is warning,
    /// `3` info, `4` debug, `5` trace and `6` garbage. Values above `6` clamp to
    /// garbage and values of `1` or below clamp to warning.
    #[must_use]
    pub const fn from_verbosity(verbosity: u8) -> Self {
        match verbosity {
            0..=2 => Self::Warning,
            3 => Self::Info,
            4 => Self::Debug,
            5 => Self::Trace,
            _ => Self::Garbage,
        }
    }

    /// Returns the level as passed to a daemon's `-l` flag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
            Self::Garbage => "garbage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, LogLevel::Warning)]
    #[case::one(1, LogLevel::Warning)]
    #[case::two(2, LogLevel::Warning)]
    #[case::three(3, LogLevel::Info)]
    #[case::four(4, LogLevel::Debug)]
    #[case::five(5, LogLevel::Trace)]
    #[case::six(6, LogLevel::Garbage)]
    #[case::clamped(42, LogLevel::Garbage)]
    fn verbosity_maps_to_level(#[case] verbosity: u8, #[case] expected: LogLevel) {
        assert_eq!(LogLevel::from_verbosity(verbosity), expected);
    }

    #[test]
    fn level_names_match_daemon_flags() {
        assert_eq!(LogLevel::Garbage.to_string(), "garbage");
        assert_eq!(LogLevel::Warning.as_str(), "warning");
        assert_eq!("TRACE".parse::<LogLevel>().ok(), Some(LogLevel::Trace));
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().ok(), Some(LogFormat::Json));
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
