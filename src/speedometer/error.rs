//! Configuration error types.

/// Error raised while loading or validating a [`SpeedometerConfig`](crate::SpeedometerConfig).
///
/// Metering itself never fails; every variant here is reported before a
/// controller or aggregator is constructed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The YAML document could not be parsed into a configuration.
    #[error("failed to parse speedometer configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A timestamp format contains a directive the formatter does not know.
    #[error("invalid timestamp format {format:?} for {scope}")]
    InvalidTimestampFormat {
        /// Where the format came from (`default` or a column name).
        scope: String,
        /// The offending format string.
        format: String,
    },

    /// A timezone is neither `UTC` nor a fixed `+HH:MM` offset.
    #[error("invalid timezone {timezone:?} for {scope}")]
    InvalidTimezone {
        /// Where the timezone came from (`default` or a column name).
        scope: String,
        /// The offending timezone string.
        timezone: String,
    },

    /// `column_options` names a column that is not in the schema.
    #[error("column_options refers to unknown column {column:?}")]
    UnknownColumn {
        /// The column name.
        column: String,
    },

    /// `label` is present but empty.
    #[error("label must not be empty when set")]
    EmptyLabel,
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
