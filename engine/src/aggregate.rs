//! Totals computed over the rows of a live collection.
//!
//! Dashboards show sums such as expenses per category or tonnage shipped;
//! these helpers compute them from whatever rows are currently held.

use crate::Row;
use std::collections::BTreeMap;

/// Sum a numeric column. Non-numeric and missing values count as zero.
pub fn sum<'a>(rows: impl IntoIterator<Item = &'a Row>, column: &str) -> f64 {
    rows.into_iter()
        .filter_map(|row| row.field(column).and_then(|v| v.as_f64()))
        .sum()
}

/// Sum a numeric column grouped by the string form of another column.
///
/// Rows whose group column is missing or null are grouped under `""`.
pub fn sum_by<'a>(
    rows: impl IntoIterator<Item = &'a Row>,
    group: &str,
    column: &str,
) -> BTreeMap<String, f64> {
    let mut totals = BTreeMap::new();
    for row in rows {
        let key = match row.get(group) {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let value = row.field(column).and_then(|v| v.as_f64()).unwrap_or(0.0);
        *totals.entry(key).or_insert(0.0) += value;
    }
    totals
}

/// Count rows grouped by the string form of a column.
pub fn count_by<'a>(rows: impl IntoIterator<Item = &'a Row>, group: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for row in rows {
        let key = match row.get(group) {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}
