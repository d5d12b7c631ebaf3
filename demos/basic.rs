//! Basic usage example for the speedometer crate.
//!
//! Four workers share a 200 kB/s budget and print a progress line every
//! second. Run with `cargo run --example basic`.

use speedometer::{
    Column, ColumnType, ColumnValue, RecordMeter, Schema, SpeedAggregator, SpeedometerConfig,
};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{info, Level};

const CONFIG: &str = r#"
speed_limit: 200000
max_sleep_millisec: 100
log_interval_seconds: 1
label: demo
column_options:
  created_at:
    format: "%Y-%m-%dT%H:%M:%S%.3f"
    timezone: "+09:00"
"#;

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let config = match SpeedometerConfig::from_yaml_str(CONFIG) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("bad configuration: {}", err);
            return;
        }
    };
    let schema = Schema::new(vec![
        Column::new("id", ColumnType::Long),
        Column::new("name", ColumnType::String),
        Column::new("active", ColumnType::Boolean),
        Column::new("created_at", ColumnType::Timestamp),
        Column::new("payload", ColumnType::Json),
    ]);

    let aggregator = Arc::new(SpeedAggregator::from_config(&config));
    let started = Instant::now();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let config = config.clone();
            let schema = schema.clone();
            let aggregator = aggregator.clone();
            thread::spawn(move || run_worker(worker, &config, &schema, aggregator))
        })
        .collect();

    for handle in handles {
        if handle.join().is_err() {
            eprintln!("worker panicked");
        }
    }

    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "all workers finished"
    );
    println!("{}", aggregator.stats());
}

fn run_worker(
    worker: u64,
    config: &SpeedometerConfig,
    schema: &Schema,
    aggregator: speedometer::SharedAggregator,
) {
    let mut meter = match RecordMeter::new(config, schema, aggregator) {
        Ok(meter) => meter,
        Err(err) => {
            eprintln!("worker {}: {}", worker, err);
            return;
        }
    };

    let payload = serde_json::json!({"worker": worker, "tags": ["a", "b", "c"]});
    let name = format!("worker-{}", worker);

    for id in 0..5_000i64 {
        meter.meter_record(&[
            ColumnValue::Long(id),
            ColumnValue::String(&name),
            ColumnValue::Boolean(id % 2 == 0),
            ColumnValue::Timestamp(chrono::Utc::now()),
            ColumnValue::Json(&payload),
        ]);
    }

    println!("{}", meter.controller().metrics());
    meter.finish();
}
