//! # Human-Readable Number Formatting
//!
//! Stateless renderers used to build telemetry lines, plus the digit-length
//! helper the record meter uses for integer columns.
//!
//! ```text
//!     to_byte_text(1_500_000)      ──► "1.5mb"
//!     to_decimal_text(269_748)     ──► "269,748"
//!     to_time_text(111_000)        ──► "1:51"
//!     to_digits_text_length(-120)  ──► 4
//! ```
//!
//! The exact output of these functions is part of the log-line contract:
//! downstream tooling matches `{speedometer: {...}}` lines by shape, so
//! changing a unit suffix or a separator is a breaking change.

/// Decimal (power of 1000) unit suffixes for byte counts.
const BYTE_UNITS: [&str; 9] = ["b", "kb", "mb", "gb", "tb", "pb", "eb", "zb", "yb"];

const BYTE_UNIT_BASE: f64 = 1000.0;

/// Renders a byte count with a decimal unit suffix.
///
/// Values below 100 of their unit keep one decimal place, values from 100
/// to 999 are printed as integers.
///
/// # Example
///
/// ```rust
/// use speedometer::format::to_byte_text;
///
/// assert_eq!(to_byte_text(0), "0.0b");
/// assert_eq!(to_byte_text(100), "100b");
/// assert_eq!(to_byte_text(1_500_000), "1.5mb");
/// ```
pub fn to_byte_text(bytes: u64) -> String {
    let mut num = bytes as f64;
    for unit in BYTE_UNITS {
        if num < BYTE_UNIT_BASE {
            return if num < BYTE_UNIT_BASE / 10.0 {
                format!("{:.1}{}", num, unit)
            } else {
                format!("{:>2}{}", num as u64, unit)
            };
        }
        num /= BYTE_UNIT_BASE;
    }
    bytes.to_string()
}

/// Renders a count with `,` thousands separators.
///
/// ```rust
/// use speedometer::format::to_decimal_text;
///
/// assert_eq!(to_decimal_text(1_000_000), "1,000,000");
/// ```
pub fn to_decimal_text(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Renders an elapsed time in milliseconds.
///
/// | Range | Output |
/// |-------|--------|
/// | under 10s | `9.00` |
/// | under 1 min | `10.0` |
/// | under 1 hour | `10:01` |
/// | under 1 day | `1:10:01` |
/// | under 10 days | `1.0 days` |
/// | otherwise | `100 days` |
pub fn to_time_text(millis: u64) -> String {
    let mut num = millis;

    let msecs = num % 1000;
    num /= 1000;

    if num < 10 {
        return format!("{:.2}", num as f64 + msecs as f64 / 1000.0);
    }
    if num < 60 {
        return format!("{:.1}", num as f64 + msecs as f64 / 1000.0);
    }

    let seconds = num % 60;
    num /= 60;
    if num < 60 {
        return format!("{}:{:02}", num, seconds);
    }

    let mins = num % 60;
    num /= 60;
    if num < 24 {
        return format!("{}:{:02}:{:02}", num, mins, seconds);
    }

    let hours = num % 24;
    num /= 24;
    if num < 10 {
        return format!("{:.1} days", num as f64 + hours as f64 / 24.0);
    }

    format!("{} days", num)
}

/// Length of the decimal text of `value`, including a leading `-`.
///
/// Equivalent to `value.to_string().len()` without allocating.
pub fn to_digits_text_length(value: i64) -> usize {
    let mut len = usize::from(value < 0);
    let mut rest = value.unsigned_abs();
    loop {
        len += 1;
        rest /= 10;
        if rest == 0 {
            return len;
        }
    }
}
