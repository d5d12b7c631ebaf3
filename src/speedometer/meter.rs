//! # Record Metering
//!
//! Adapts column-oriented records to the byte-oriented controller. Each
//! record is metered as the text it would occupy in a delimited file:
//!
//! ```text
//!     record:   42  │ "héllo" │ null │ 2024-01-02 03:04:05.000000000 +0000
//!     metered:  2  ,   6    ,  -   ,              35                  \n
//!               │  │        │      │                                  │
//!               │  └ delimiter before every column but the first      └ padding, end of record
//!               └ value text length (nulls meter only the delimiter)
//! ```
//!
//! All units of one record are metered with the timestamp captured by
//! [`RecordMeter::start_record`], so a slow record cannot skew the period
//! rate halfway through.

use super::{
    aggregator::SharedAggregator,
    config::SpeedometerConfig,
    controller::SpeedController,
    error::ConfigResult,
    format::to_digits_text_length,
    utils::current_time_ms,
};
use chrono::{format::StrftimeItems, DateTime, FixedOffset, Utc};
use std::fmt::{self, Write as _};
use std::io;
use tracing::warn;

const TRUE_LENGTH: u64 = 4;
const FALSE_LENGTH: u64 = 5;

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// `true` / `false`.
    Boolean,
    /// Signed 64-bit integer.
    Long,
    /// 64-bit float.
    Double,
    /// UTF-8 text.
    String,
    /// Point in time, rendered with the column's timestamp format.
    Timestamp,
    /// Arbitrary JSON document.
    Json,
}

/// One named column of a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name, as referenced by `column_options`.
    pub name: String,
    /// Logical type.
    pub column_type: ColumnType,
}

impl Column {
    /// Creates a column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered column layout of the records being metered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Creates a schema from columns in record order.
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Columns in record order.
    #[inline]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column at `index`, if any.
    #[inline]
    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    /// Index of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Number of columns.
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` for a schema without columns.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A borrowed column value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnValue<'a> {
    /// Missing value.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// Integer value.
    Long(i64),
    /// Floating point value.
    Double(f64),
    /// Text value.
    String(&'a str),
    /// Timestamp value.
    Timestamp(DateTime<Utc>),
    /// JSON value.
    Json(&'a serde_json::Value),
}

/// Chrono format string and offset for one timestamp column.
#[derive(Debug, Clone)]
struct TimestampRendering {
    format: String,
    offset: FixedOffset,
}

impl TimestampRendering {
    fn new((format, offset): (String, FixedOffset)) -> Self {
        Self { format, offset }
    }

    fn text_length(&self, value: &DateTime<Utc>) -> u64 {
        let local = value.with_timezone(&self.offset);
        let mut counter = LengthCounter::default();
        match write!(counter, "{}", local.format_with_items(StrftimeItems::new(&self.format))) {
            Ok(()) => counter.0,
            Err(_) => {
                warn!(format = %self.format, "timestamp could not be rendered; metered as 0 bytes");
                0
            }
        }
    }
}

/// Counts bytes written through `fmt::Write` or `io::Write` without storing them.
#[derive(Debug, Default)]
struct LengthCounter(u64);

impl fmt::Write for LengthCounter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 = self.0.saturating_add(s.len() as u64);
        Ok(())
    }
}

impl io::Write for LengthCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 = self.0.saturating_add(buf.len() as u64);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Metered text length of `value` in a column rendered by `rendering`.
fn value_length(value: &ColumnValue<'_>, rendering: &TimestampRendering) -> u64 {
    match value {
        ColumnValue::Null => 0,
        ColumnValue::Boolean(true) => TRUE_LENGTH,
        ColumnValue::Boolean(false) => FALSE_LENGTH,
        ColumnValue::Long(v) => to_digits_text_length(*v) as u64,
        ColumnValue::Double(v) => {
            // `{:?}` is the shortest text that parses back to the same f64.
            let mut counter = LengthCounter::default();
            let _ = write!(counter, "{:?}", v);
            counter.0
        }
        ColumnValue::String(s) => s.len() as u64,
        ColumnValue::Timestamp(t) => rendering.text_length(t),
        ColumnValue::Json(v) => {
            let mut counter = LengthCounter::default();
            match serde_json::to_writer(&mut counter, v) {
                Ok(()) => counter.0,
                Err(err) => {
                    warn!(error = %err, "json value could not be serialized; metered as 0 bytes");
                    0
                }
            }
        }
    }
}

/// Feeds whole records into a [`SpeedController`].
///
/// One `RecordMeter` per worker. Records pass through untouched; only their
/// text length is counted, and the worker is slowed down when the run goes
/// over its speed limit.
///
/// # Example
///
/// ```rust
/// use speedometer::{
///     Column, ColumnType, ColumnValue, RecordMeter, Schema, SpeedAggregator, SpeedometerConfig,
/// };
/// use std::sync::Arc;
///
/// let schema = Schema::new(vec![
///     Column::new("id", ColumnType::Long),
///     Column::new("name", ColumnType::String),
/// ]);
/// let config = SpeedometerConfig::default();
/// let aggregator = Arc::new(SpeedAggregator::from_config(&config));
///
/// let mut meter = RecordMeter::new(&config, &schema, aggregator.clone()).unwrap();
/// meter.meter_record(&[ColumnValue::Long(42), ColumnValue::String("abc")]);
///
/// // "42" + "," + "abc" + padding
/// assert_eq!(meter.controller().total_bytes(), 7);
/// meter.finish();
/// assert_eq!(aggregator.global_total_records(), 1);
/// ```
#[derive(Debug)]
pub struct RecordMeter {
    controller: SpeedController,
    delimiter_length: u64,
    record_padding_size: u64,
    renderings: Vec<TimestampRendering>,
    default_rendering: TimestampRendering,
    record_time_ms: u64,
}

impl RecordMeter {
    /// Creates a meter for records shaped like `schema`.
    ///
    /// The first period starts here. The controller joins the aggregator on
    /// the first metered unit.
    ///
    /// # Errors
    ///
    /// Any error from [`SpeedometerConfig::validate_schema`].
    pub fn new(
        config: &SpeedometerConfig,
        schema: &Schema,
        aggregator: SharedAggregator,
    ) -> ConfigResult<Self> {
        config.validate_schema(schema)?;

        let renderings = schema
            .columns()
            .iter()
            .map(|column| config.timestamp_rendering(&column.name).map(TimestampRendering::new))
            .collect::<ConfigResult<Vec<_>>>()?;
        let default_rendering = TimestampRendering::new(config.default_timestamp_rendering()?);

        let mut controller = SpeedController::new(config.controller_config(), aggregator);
        controller.start(current_time_ms());

        Ok(Self {
            controller,
            delimiter_length: config.delimiter_length(),
            record_padding_size: u64::from(config.record_padding_size),
            renderings,
            default_rendering,
            record_time_ms: 0,
        })
    }

    /// Captures the clock for the next record.
    #[inline]
    pub fn start_record(&mut self) {
        self.start_record_at(current_time_ms());
    }

    /// Like [`start_record`](Self::start_record) with an explicit time.
    #[inline]
    pub fn start_record_at(&mut self, now_ms: u64) {
        self.record_time_ms = now_ms;
    }

    /// Meters the value of the column at `index`.
    ///
    /// Every column but the first is preceded by one delimiter. A null value
    /// meters the delimiter only.
    pub fn meter_column(&mut self, index: usize, value: &ColumnValue<'_>) {
        let now = self.record_time_ms;
        if index > 0 {
            self.controller
                .check_speed_limit(now, self.delimiter_length, false);
        }
        if matches!(value, ColumnValue::Null) {
            return;
        }

        let rendering = self.renderings.get(index).unwrap_or(&self.default_rendering);
        let length = value_length(value, rendering);
        self.controller.check_speed_limit(now, length, false);
    }

    /// Meters the record padding and closes the record.
    pub fn end_record(&mut self) {
        self.controller
            .check_speed_limit(self.record_time_ms, self.record_padding_size, true);
    }

    /// Meters a full record in one call.
    pub fn meter_record(&mut self, values: &[ColumnValue<'_>]) {
        self.start_record();
        for (index, value) in values.iter().enumerate() {
            self.meter_column(index, value);
        }
        self.end_record();
    }

    /// Stops the underlying controller.
    pub fn finish(&mut self) {
        self.controller.stop();
    }

    /// The controller this meter feeds.
    #[inline]
    pub fn controller(&self) -> &SpeedController {
        &self.controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speedometer::aggregator::SpeedAggregator;
    use crate::speedometer::config::TimestampColumnOption;
    use crate::speedometer::controller::ControllerState;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn quiet() -> SharedAggregator {
        Arc::new(SpeedAggregator::with_sink(None, None))
    }

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("flag", ColumnType::Boolean),
            Column::new("id", ColumnType::Long),
            Column::new("score", ColumnType::Double),
            Column::new("name", ColumnType::String),
            Column::new("at", ColumnType::Timestamp),
            Column::new("doc", ColumnType::Json),
        ])
    }

    fn utc_rendering() -> TimestampRendering {
        TimestampRendering::new((
            "%Y-%m-%d %H:%M:%S.%9f %z".to_string(),
            FixedOffset::east_opt(0).unwrap(),
        ))
    }

    #[test]
    fn test_schema_lookup() {
        let schema = schema();
        assert_eq!(schema.len(), 6);
        assert!(!schema.is_empty());
        assert_eq!(schema.column_index("name"), Some(3));
        assert_eq!(schema.column_index("nope"), None);
        assert_eq!(schema.column(4).map(|c| c.column_type), Some(ColumnType::Timestamp));
        assert!(Schema::default().is_empty());
    }

    #[test]
    fn test_value_lengths() {
        let rendering = utc_rendering();
        let json = serde_json::json!({"a": [1, 2], "b": "x"});

        assert_eq!(value_length(&ColumnValue::Null, &rendering), 0);
        assert_eq!(value_length(&ColumnValue::Boolean(true), &rendering), 4);
        assert_eq!(value_length(&ColumnValue::Boolean(false), &rendering), 5);
        assert_eq!(value_length(&ColumnValue::Long(-120), &rendering), 4);
        assert_eq!(value_length(&ColumnValue::Double(1.5), &rendering), 3);
        assert_eq!(value_length(&ColumnValue::Double(2.0), &rendering), 3);
        assert_eq!(value_length(&ColumnValue::String("héllo"), &rendering), 6);
        assert_eq!(
            value_length(&ColumnValue::Json(&json), &rendering),
            r#"{"a":[1,2],"b":"x"}"#.len() as u64
        );
    }

    #[test]
    fn test_timestamp_length_follows_format() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        // "2024-01-02 03:04:05.000000000 +0000"
        assert_eq!(utc_rendering().text_length(&at), 35);

        let short = TimestampRendering::new(("%Y-%m-%d".to_string(), FixedOffset::east_opt(0).unwrap()));
        assert_eq!(short.text_length(&at), 10);
    }

    #[test]
    fn test_meter_record_sums_units() {
        let mut meter = RecordMeter::new(&SpeedometerConfig::default(), &schema(), quiet()).unwrap();
        let json = serde_json::json!([1]);
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        meter.meter_record(&[
            ColumnValue::Boolean(true),
            ColumnValue::Long(7),
            ColumnValue::Double(0.5),
            ColumnValue::String("abc"),
            ColumnValue::Timestamp(at),
            ColumnValue::Json(&json),
        ]);

        // values 4 + 1 + 3 + 3 + 35 + 3, five delimiters, one padding byte
        assert_eq!(meter.controller().total_bytes(), 49 + 5 + 1);
        assert_eq!(meter.controller().total_records(), 1);
    }

    #[test]
    fn test_nulls_meter_only_delimiters() {
        let mut meter = RecordMeter::new(&SpeedometerConfig::default(), &schema(), quiet()).unwrap();

        meter.meter_record(&[ColumnValue::Null; 6]);
        assert_eq!(meter.controller().total_bytes(), 5 + 1);
    }

    #[test]
    fn test_custom_delimiter_and_padding() {
        let config = SpeedometerConfig {
            delimiter: "||".to_string(),
            record_padding_size: 2,
            ..SpeedometerConfig::default()
        };
        let schema = Schema::new(vec![
            Column::new("a", ColumnType::String),
            Column::new("b", ColumnType::String),
        ]);
        let mut meter = RecordMeter::new(&config, &schema, quiet()).unwrap();

        meter.start_record_at(1_000);
        meter.meter_column(0, &ColumnValue::String("x"));
        meter.meter_column(1, &ColumnValue::String("y"));
        meter.end_record();

        assert_eq!(meter.controller().total_bytes(), 1 + 2 + 1 + 2);
    }

    #[test]
    fn test_column_timestamp_option() {
        let mut config = SpeedometerConfig::default();
        config.column_options.insert(
            "at".to_string(),
            TimestampColumnOption {
                format: Some("%Y".to_string()),
                timezone: Some("+09:00".to_string()),
            },
        );
        let schema = Schema::new(vec![Column::new("at", ColumnType::Timestamp)]);
        let mut meter = RecordMeter::new(&config, &schema, quiet()).unwrap();

        let at = Utc.with_ymd_and_hms(2024, 12, 31, 20, 0, 0).unwrap();
        meter.meter_record(&[ColumnValue::Timestamp(at)]);

        // "2025" in +09:00, plus padding.
        assert_eq!(meter.controller().total_bytes(), 4 + 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = SpeedometerConfig::default();
        config
            .column_options
            .insert("ghost".to_string(), TimestampColumnOption::default());

        assert!(RecordMeter::new(&config, &schema(), quiet()).is_err());
    }

    #[test]
    fn test_new_meter_starts_period_without_registering() {
        let aggregator = quiet();
        let before = current_time_ms();
        let mut meter = RecordMeter::new(&SpeedometerConfig::default(), &schema(), aggregator.clone()).unwrap();

        assert_eq!(meter.controller().state(), ControllerState::Unregistered);
        assert!(meter.controller().stats().period_start_ms() >= before);
        assert_eq!(aggregator.active_controller_count(), 0);

        let started = meter.controller().stats().period_start_ms();
        meter.meter_record(&[ColumnValue::Boolean(true)]);
        assert_eq!(meter.controller().state(), ControllerState::Active);
        assert_eq!(meter.controller().stats().period_start_ms(), started);
        meter.finish();
    }

    #[test]
    fn test_finish_stops_controller() {
        let aggregator = quiet();
        let mut meter = RecordMeter::new(&SpeedometerConfig::default(), &schema(), aggregator.clone()).unwrap();

        meter.meter_record(&[ColumnValue::Boolean(false)]);
        assert_eq!(aggregator.active_controller_count(), 1);

        meter.finish();
        assert_eq!(aggregator.active_controller_count(), 0);
        assert_eq!(aggregator.global_total_bytes(), 6);
        assert_eq!(aggregator.global_total_records(), 1);
    }
}
