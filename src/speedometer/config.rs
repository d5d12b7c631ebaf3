//! # Speedometer Configuration
//!
//! This module holds the settings that shape throttling, telemetry and record
//! metering. Think of it as the "settings panel" of a speedometer run.
//!
//! ```text
//!     speed_limit ────────────► shared byte budget for ALL workers (0 = off)
//!     max_sleep_millisec ─────► upper bound of a single throttling sleep
//!     log_interval_seconds ───► period between progress lines (0 = off)
//!     delimiter ──────────────► metered once between columns (length only)
//!     record_padding_size ────► metered once per record (e.g. newline)
//!     label ──────────────────► optional tag in every log line
//!     column_options ─────────► per-column timestamp rendering
//! ```
//!
//! The configuration is usually read from YAML:
//!
//! ```rust
//! use speedometer::SpeedometerConfig;
//!
//! let config = SpeedometerConfig::from_yaml_str(
//!     "speed_limit: 250000\nlog_interval_seconds: 5\nlabel: nightly",
//! ).unwrap();
//!
//! assert_eq!(config.speed_limit, 250_000);
//! assert_eq!(config.controller_config().log_interval_millisec, 5_000);
//! ```

use super::error::{ConfigError, ConfigResult};
use super::meter::Schema;
use chrono::format::{Item, StrftimeItems};
use chrono::FixedOffset;
use serde::Deserialize;
use std::collections::HashMap;

/// Default upper bound of one throttling sleep.
pub const DEFAULT_MAX_SLEEP_MILLISEC: u32 = 1000;

/// Default period between progress log lines.
pub const DEFAULT_LOG_INTERVAL_SECONDS: u32 = 10;

/// Default timestamp rendering, `%N` meaning nanoseconds.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S.%N %z";

/// Settings a single [`SpeedController`](crate::SpeedController) needs.
///
/// This is the subset of [`SpeedometerConfig`] that is fixed at controller
/// construction time and never changes afterwards.
///
/// ```rust
/// use speedometer::ControllerConfig;
///
/// let config = ControllerConfig::new(1_000_000, 200, 0);
/// assert!(config.is_throttling());
/// assert!(!config.is_reporting());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Global byte budget per second shared by all live controllers.
    /// 0 disables throttling; metering still happens.
    pub speed_limit: u64,

    /// Upper bound of a single throttling sleep.
    pub max_sleep_millisec: u32,

    /// Milliseconds between progress lines. 0 disables periodic reports.
    pub log_interval_millisec: u64,
}

impl Default for ControllerConfig {
    /// Unlimited speed, 1s max sleep, a report every 10s.
    fn default() -> Self {
        Self {
            speed_limit: 0,
            max_sleep_millisec: DEFAULT_MAX_SLEEP_MILLISEC,
            log_interval_millisec: u64::from(DEFAULT_LOG_INTERVAL_SECONDS) * 1000,
        }
    }
}

impl ControllerConfig {
    /// Creates a controller configuration.
    pub fn new(speed_limit: u64, max_sleep_millisec: u32, log_interval_millisec: u64) -> Self {
        Self {
            speed_limit,
            max_sleep_millisec,
            log_interval_millisec,
        }
    }

    /// Sets the shared speed limit in bytes per second.
    pub fn with_speed_limit(mut self, speed_limit: u64) -> Self {
        self.speed_limit = speed_limit;
        self
    }

    /// Sets the upper bound of a single throttling sleep.
    pub fn with_max_sleep_millisec(mut self, max_sleep_millisec: u32) -> Self {
        self.max_sleep_millisec = max_sleep_millisec;
        self
    }

    /// Sets the progress report interval.
    pub fn with_log_interval_millisec(mut self, log_interval_millisec: u64) -> Self {
        self.log_interval_millisec = log_interval_millisec;
        self
    }

    /// Returns `true` when a positive speed limit is configured.
    #[inline]
    pub fn is_throttling(&self) -> bool {
        self.speed_limit > 0
    }

    /// Returns `true` when periodic progress lines are enabled.
    #[inline]
    pub fn is_reporting(&self) -> bool {
        self.log_interval_millisec > 0
    }
}

/// Timestamp rendering override for one column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimestampColumnOption {
    /// strftime-style format; `%N` is nanoseconds.
    pub format: Option<String>,

    /// `UTC` or a fixed `+HH:MM` offset.
    pub timezone: Option<String>,
}

/// Full configuration of a speedometer run.
///
/// Every field has a default, so an empty
/// document is a valid (unthrottled, reporting every 10s) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpeedometerConfig {
    /// Shared byte budget per second. 0 = unlimited.
    pub speed_limit: u64,

    /// Upper bound of one throttling sleep.
    pub max_sleep_millisec: u32,

    /// Column delimiter; only its length is metered.
    pub delimiter: String,

    /// Bytes metered at the end of each record.
    pub record_padding_size: u32,

    /// Seconds between progress lines. 0 = no periodic lines.
    pub log_interval_seconds: u32,

    /// Per-column timestamp options keyed by column name.
    pub column_options: HashMap<String, TimestampColumnOption>,

    /// Optional tag printed in every log line.
    pub label: Option<String>,

    /// Timezone for timestamp columns without their own option.
    pub default_timezone: String,

    /// Format for timestamp columns without their own option.
    pub default_timestamp_format: String,
}

impl Default for SpeedometerConfig {
    fn default() -> Self {
        Self {
            speed_limit: 0,
            max_sleep_millisec: DEFAULT_MAX_SLEEP_MILLISEC,
            delimiter: ",".to_string(),
            record_padding_size: 1,
            log_interval_seconds: DEFAULT_LOG_INTERVAL_SECONDS,
            column_options: HashMap::new(),
            label: None,
            default_timezone: "UTC".to_string(),
            default_timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
        }
    }
}

impl SpeedometerConfig {
    /// Parses and validates a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed YAML, unknown keys or
    /// negative numbers, and the [`validate`](Self::validate) errors otherwise.
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the shared speed limit.
    pub fn with_speed_limit(mut self, speed_limit: u64) -> Self {
        self.speed_limit = speed_limit;
        self
    }

    /// Sets the log line label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the progress report interval.
    pub fn with_log_interval_seconds(mut self, seconds: u32) -> Self {
        self.log_interval_seconds = seconds;
        self
    }

    /// Checks the parts of the configuration serde cannot check.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::EmptyLabel`] for `label: ""`
    /// - [`ConfigError::InvalidTimestampFormat`] for unknown strftime directives
    /// - [`ConfigError::InvalidTimezone`] for anything but `UTC`/fixed offsets
    pub fn validate(&self) -> ConfigResult<()> {
        if matches!(self.label.as_deref(), Some("")) {
            return Err(ConfigError::EmptyLabel);
        }

        check_timestamp_format("default", &self.default_timestamp_format)?;
        check_timezone("default", &self.default_timezone)?;

        for (column, option) in &self.column_options {
            let scope = format!("column {}", column);
            if let Some(format) = &option.format {
                check_timestamp_format(&scope, format)?;
            }
            if let Some(timezone) = &option.timezone {
                check_timezone(&scope, timezone)?;
            }
        }

        Ok(())
    }

    /// Validates the configuration against the record layout it will meter.
    ///
    /// # Errors
    ///
    /// Everything [`validate`](Self::validate) reports, plus
    /// [`ConfigError::UnknownColumn`] when `column_options` names a column
    /// absent from `schema`.
    pub fn validate_schema(&self, schema: &Schema) -> ConfigResult<()> {
        self.validate()?;
        for column in self.column_options.keys() {
            if schema.column_index(column).is_none() {
                return Err(ConfigError::UnknownColumn {
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }

    /// Projects the settings a single controller needs.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            speed_limit: self.speed_limit,
            max_sleep_millisec: self.max_sleep_millisec,
            log_interval_millisec: u64::from(self.log_interval_seconds) * 1000,
        }
    }

    /// Metered length of one delimiter, in bytes.
    #[inline]
    pub fn delimiter_length(&self) -> u64 {
        self.delimiter.len() as u64
    }

    /// Returns the format and offset used to render `column`.
    pub(crate) fn timestamp_rendering(&self, column: &str) -> ConfigResult<(String, FixedOffset)> {
        let option = self.column_options.get(column);
        let format = option
            .and_then(|o| o.format.as_deref())
            .unwrap_or(&self.default_timestamp_format);
        let timezone = option
            .and_then(|o| o.timezone.as_deref())
            .unwrap_or(&self.default_timezone);

        let scope = format!("column {}", column);
        check_timestamp_format(&scope, format)?;
        let offset = check_timezone(&scope, timezone)?;
        Ok((translate_timestamp_format(format), offset))
    }

    /// Format and offset for timestamps outside any configured column.
    pub(crate) fn default_timestamp_rendering(&self) -> ConfigResult<(String, FixedOffset)> {
        check_timestamp_format("default", &self.default_timestamp_format)?;
        let offset = check_timezone("default", &self.default_timezone)?;
        Ok((translate_timestamp_format(&self.default_timestamp_format), offset))
    }
}

/// Rewrites `%N` (nanoseconds) and `%L` (milliseconds) into chrono syntax.
pub(crate) fn translate_timestamp_format(format: &str) -> String {
    let mut out = String::with_capacity(format.len() + 4);
    let mut chars = format.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('N') => out.push_str("%9f"),
            Some('L') => out.push_str("%3f"),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Parses `UTC`, `Z`, `GMT`, `+HH:MM`, `-HH:MM`, `+HHMM` or `-HHMM`.
pub(crate) fn parse_timezone(timezone: &str) -> Option<FixedOffset> {
    if matches!(timezone, "UTC" | "utc" | "Z" | "GMT") {
        return FixedOffset::east_opt(0);
    }

    let sign = match timezone.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits: String = timezone[1..].chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn check_timestamp_format(scope: &str, format: &str) -> ConfigResult<()> {
    let translated = translate_timestamp_format(format);
    if StrftimeItems::new(&translated).any(|item| matches!(item, Item::Error)) {
        return Err(ConfigError::InvalidTimestampFormat {
            scope: scope.to_string(),
            format: format.to_string(),
        });
    }
    Ok(())
}

fn check_timezone(scope: &str, timezone: &str) -> ConfigResult<FixedOffset> {
    parse_timezone(timezone).ok_or_else(|| ConfigError::InvalidTimezone {
        scope: scope.to_string(),
        timezone: timezone.to_string(),
    })
}
