use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// A single cell of a result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Number(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the cell. Text cells are parsed, so `"1700000000.250"` works.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Positionally aligned with [`DataSet::fields`].
pub type Row = Vec<Value>;

/// Time value of `row` at `time_index`, NaN when missing or non-numeric.
pub fn row_time(row: &Row, time_index: usize) -> f64 {
    row.get(time_index)
        .and_then(Value::as_f64)
        .unwrap_or(f64::NAN)
}

/// Ordered result set. Every row has exactly `fields.len()` values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDataSet")]
pub struct DataSet {
    fields: Vec<String>,
    rows: Vec<Row>,
}

#[derive(Deserialize)]
struct RawDataSet {
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    rows: Vec<Row>,
}

impl TryFrom<RawDataSet> for DataSet {
    type Error = SyncError;

    fn try_from(raw: RawDataSet) -> Result<Self> {
        DataSet::new(raw.fields, raw.rows)
    }
}

impl DataSet {
    pub fn new(fields: Vec<String>, rows: Vec<Row>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(fields.len());
        for field in &fields {
            if !seen.insert(field.as_str()) {
                return Err(SyncError::DuplicateField(field.clone()));
            }
        }
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != fields.len() {
                return Err(SyncError::MalformedRow {
                    row: idx,
                    expected: fields.len(),
                    found: row.len(),
                });
            }
        }
        Ok(Self { fields, rows })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Callers guarantee the row-length invariant.
    pub(crate) fn from_parts(fields: Vec<String>, rows: Vec<Row>) -> Self {
        debug_assert!(rows.iter().all(|row| row.len() == fields.len()));
        Self { fields, rows }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field == name)
    }

    pub fn column_times(&self, index: usize) -> Vec<f64> {
        self.rows.iter().map(|row| row_time(row, index)).collect()
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Row>) {
        (self.fields, self.rows)
    }
}

/// Earliest/latest bound of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeSpec {
    Now,
    /// Epoch seconds.
    Absolute(f64),
    /// Backend-relative expression such as `-20m` or `-1260s`.
    Relative(String),
}

impl TimeSpec {
    pub fn is_now(&self) -> bool {
        matches!(self, TimeSpec::Now)
    }

    /// Relative lookback of `secs` seconds, formatted the way refresh lookbacks are.
    pub fn lookback(secs: f64) -> Self {
        TimeSpec::Relative(format!("-{}s", secs))
    }
}

impl FromStr for TimeSpec {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(SyncError::InvalidTimeSpec(s.to_string()));
        }
        if trimmed.eq_ignore_ascii_case("now") {
            return Ok(TimeSpec::Now);
        }
        if let Ok(epoch) = trimmed.parse::<f64>() {
            if epoch.is_finite() {
                return Ok(TimeSpec::Absolute(epoch));
            }
            return Err(SyncError::InvalidTimeSpec(s.to_string()));
        }
        Ok(TimeSpec::Relative(trimmed.to_string()))
    }
}

impl TryFrom<String> for TimeSpec {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeSpec> for String {
    fn from(value: TimeSpec) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSpec::Now => f.write_str("now"),
            TimeSpec::Absolute(epoch) => write!(f, "{}", epoch),
            TimeSpec::Relative(expr) => f.write_str(expr),
        }
    }
}

#[cfg(test)]
pub(crate) fn series(fields: &[&str], rows: Vec<Vec<f64>>) -> DataSet {
    DataSet::new(
        fields.iter().map(|f| f.to_string()).collect(),
        rows.into_iter()
            .map(|row| row.into_iter().map(Value::Number).collect())
            .collect(),
    )
    .unwrap()
}
