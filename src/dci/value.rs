//! Collected values and the type-correct arithmetic run on them.
//!
//! An [`ItemValue`] keeps the text exactly as it was collected and parses it
//! on demand into the representation dictated by the owning DCI's
//! [`DataType`]. All arithmetic (delta, average, deviation, sum) happens in
//! that type's own domain: unsigned types use modular unsigned arithmetic,
//! signed types wrap instead of panicking on overflow.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Data type of a collection item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    String,
}

impl DataType {
    /// Decode the persisted numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Int32),
            1 => Some(Self::UInt32),
            2 => Some(Self::Int64),
            3 => Some(Self::UInt64),
            4 => Some(Self::String),
            5 => Some(Self::Float),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Int32 => 0,
            Self::UInt32 => 1,
            Self::Int64 => 2,
            Self::UInt64 => 3,
            Self::String => 4,
            Self::Float => 5,
        }
    }

    pub fn is_numeric(self) -> bool {
        self != Self::String
    }
}

/// A value parsed into a concrete type.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub enum TypedValue {
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f64),
    String(String),
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int32(v) => write!(f, "{}", v),
            Self::UInt32(v) => write!(f, "{}", v),
            Self::Int64(v) => write!(f, "{}", v),
            Self::UInt64(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(v) => f.write_str(v),
        }
    }
}

/// A collected value with its collection timestamp (unix seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct ItemValue {
    raw: String,
    timestamp: i64,
    placeholder: bool,
}

impl ItemValue {
    pub fn new(raw: impl Into<String>, timestamp: i64) -> Self {
        Self {
            raw: raw.into(),
            timestamp,
            placeholder: false,
        }
    }

    /// Empty value used to pad a cache that history could not fill.
    pub fn placeholder() -> Self {
        Self {
            raw: String::new(),
            timestamp: 1,
            placeholder: true,
        }
    }

    pub fn from_typed(value: TypedValue, timestamp: i64) -> Self {
        Self::new(value.to_string(), timestamp)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    pub fn as_i32(&self) -> i32 {
        parse_i64(&self.raw) as i32
    }

    pub fn as_u32(&self) -> u32 {
        parse_u64(&self.raw) as u32
    }

    pub fn as_i64(&self) -> i64 {
        parse_i64(&self.raw)
    }

    pub fn as_u64(&self) -> u64 {
        parse_u64(&self.raw)
    }

    pub fn as_f64(&self) -> f64 {
        self.raw.trim().parse::<f64>().unwrap_or(0.0)
    }

    /// Parse the raw text as the given data type.
    pub fn typed(&self, data_type: DataType) -> TypedValue {
        match data_type {
            DataType::Int32 => TypedValue::Int32(self.as_i32()),
            DataType::UInt32 => TypedValue::UInt32(self.as_u32()),
            DataType::Int64 => TypedValue::Int64(self.as_i64()),
            DataType::UInt64 => TypedValue::UInt64(self.as_u64()),
            DataType::Float => TypedValue::Float(self.as_f64()),
            DataType::String => TypedValue::String(self.raw.clone()),
        }
    }

    /// Re-render the value in the canonical text form of `data_type`,
    /// keeping the timestamp.
    pub fn normalized(&self, data_type: DataType) -> Self {
        Self::from_typed(self.typed(data_type), self.timestamp)
    }
}

impl fmt::Display for ItemValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_i64(s: &str) -> i64 {
    let s = s.trim();
    if let Ok(v) = s.parse::<i64>() {
        return v;
    }
    if let Ok(v) = s.parse::<u64>() {
        return v as i64;
    }
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => v as i64,
        _ => 0,
    }
}

fn parse_u64(s: &str) -> u64 {
    let s = s.trim();
    if let Ok(v) = s.parse::<u64>() {
        return v;
    }
    if let Ok(v) = s.parse::<i64>() {
        return v as u64;
    }
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() && v < 0.0 => (v as i64) as u64,
        Ok(v) if v.is_finite() => v as u64,
        _ => 0,
    }
}

/// Difference `current - previous` in the arithmetic of `data_type`.
///
/// Unsigned types subtract modulo 2^32 / 2^64, so a counter that went
/// backwards produces a large positive delta. For strings the result is
/// an `Int32` flag: 0 when the values are equal, 1 otherwise.
pub fn diff(data_type: DataType, current: &ItemValue, previous: &ItemValue) -> TypedValue {
    match data_type {
        DataType::Int32 => TypedValue::Int32(current.as_i32().wrapping_sub(previous.as_i32())),
        DataType::UInt32 => TypedValue::UInt32(current.as_u32().wrapping_sub(previous.as_u32())),
        DataType::Int64 => TypedValue::Int64(current.as_i64().wrapping_sub(previous.as_i64())),
        DataType::UInt64 => TypedValue::UInt64(current.as_u64().wrapping_sub(previous.as_u64())),
        DataType::Float => TypedValue::Float(current.as_f64() - previous.as_f64()),
        DataType::String => TypedValue::Int32(i32::from(current.as_str() != previous.as_str())),
    }
}

/// Divide a numeric value by a positive divisor in its own arithmetic.
/// Strings pass through unchanged.
pub fn divide(value: TypedValue, divisor: i64) -> TypedValue {
    let divisor = divisor.max(1);
    match value {
        TypedValue::Int32(v) => TypedValue::Int32(v.wrapping_div(i32::try_from(divisor).unwrap_or(i32::MAX))),
        TypedValue::UInt32(v) => TypedValue::UInt32(v / u32::try_from(divisor).unwrap_or(u32::MAX)),
        TypedValue::Int64(v) => TypedValue::Int64(v.wrapping_div(divisor)),
        TypedValue::UInt64(v) => TypedValue::UInt64(v / divisor as u64),
        TypedValue::Float(v) => TypedValue::Float(v / divisor as f64),
        other => other,
    }
}

/// Sum of the given samples. `None` when there are no samples.
pub fn sum(data_type: DataType, values: &[&ItemValue]) -> Option<TypedValue> {
    if values.is_empty() {
        return None;
    }
    Some(match data_type {
        DataType::Int32 => TypedValue::Int32(values.iter().fold(0i32, |acc, v| acc.wrapping_add(v.as_i32()))),
        DataType::UInt32 => TypedValue::UInt32(values.iter().fold(0u32, |acc, v| acc.wrapping_add(v.as_u32()))),
        DataType::Int64 => TypedValue::Int64(values.iter().fold(0i64, |acc, v| acc.wrapping_add(v.as_i64()))),
        DataType::UInt64 => TypedValue::UInt64(values.iter().fold(0u64, |acc, v| acc.wrapping_add(v.as_u64()))),
        DataType::Float => TypedValue::Float(values.iter().map(|v| v.as_f64()).sum()),
        DataType::String => TypedValue::String(String::new()),
    })
}

/// Arithmetic mean of the given samples, computed over exactly the samples
/// passed in. Integer types use a widened accumulator and truncate.
pub fn average(data_type: DataType, values: &[&ItemValue]) -> Option<TypedValue> {
    if values.is_empty() {
        return None;
    }
    let n = values.len();
    Some(match data_type {
        DataType::Int32 => {
            let total: i64 = values.iter().map(|v| i64::from(v.as_i32())).sum();
            TypedValue::Int32((total / n as i64) as i32)
        }
        DataType::UInt32 => {
            let total: u64 = values.iter().map(|v| u64::from(v.as_u32())).sum();
            TypedValue::UInt32((total / n as u64) as u32)
        }
        DataType::Int64 => {
            let total: i128 = values.iter().map(|v| i128::from(v.as_i64())).sum();
            TypedValue::Int64((total / n as i128) as i64)
        }
        DataType::UInt64 => {
            let total: u128 = values.iter().map(|v| u128::from(v.as_u64())).sum();
            TypedValue::UInt64((total / n as u128) as u64)
        }
        DataType::Float => {
            let total: f64 = values.iter().map(|v| v.as_f64()).sum();
            TypedValue::Float(total / n as f64)
        }
        DataType::String => TypedValue::String(String::new()),
    })
}

/// Mean absolute deviation of the given samples.
pub fn mean_deviation(data_type: DataType, values: &[&ItemValue]) -> Option<TypedValue> {
    let mean = average(data_type, values)?;
    let n = values.len();
    Some(match mean {
        TypedValue::Int32(mean) => {
            let dev: i64 = values.iter().map(|v| (i64::from(v.as_i32()) - i64::from(mean)).abs()).sum();
            TypedValue::Int32((dev / n as i64) as i32)
        }
        TypedValue::UInt32(mean) => {
            let dev: u64 = values.iter().map(|v| u64::from(v.as_u32().abs_diff(mean))).sum();
            TypedValue::UInt32((dev / n as u64) as u32)
        }
        TypedValue::Int64(mean) => {
            let dev: u128 = values.iter().map(|v| u128::from(v.as_i64().abs_diff(mean))).sum();
            TypedValue::Int64((dev / n as u128) as i64)
        }
        TypedValue::UInt64(mean) => {
            let dev: u128 = values.iter().map(|v| u128::from(v.as_u64().abs_diff(mean))).sum();
            TypedValue::UInt64((dev / n as u128) as u64)
        }
        TypedValue::Float(mean) => {
            let dev: f64 = values.iter().map(|v| (v.as_f64() - mean).abs()).sum();
            TypedValue::Float(dev / n as f64)
        }
        other => other,
    })
}
