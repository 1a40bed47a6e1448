//! Query descriptors: which rows of a table a live collection mirrors, in what
//! order, and with which columns.
//!
//! The same descriptor drives the server's read path, the in-memory backend
//! and the client-side filtering of stream events, so all three agree on what
//! "the slice" is.

use crate::{error::Result, Error, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Column selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Every column (`*`)
    #[default]
    All,
    /// The listed columns; `id` is always kept
    Columns(Vec<String>),
}

impl Selection {
    /// Parse `*` or a comma separated column list such as `"id, name, created_at"`.
    pub fn parse(select: &str) -> Result<Self> {
        let select = select.trim();
        if select.is_empty() || select == "*" {
            return Ok(Selection::All);
        }
        let columns: Vec<String> = select
            .split(',')
            .map(|c| c.trim().to_string())
            .collect();
        if columns.iter().any(|c| c.is_empty()) {
            return Err(Error::InvalidQuery(format!("empty column in select '{select}'")));
        }
        Ok(Selection::Columns(columns))
    }
}

impl std::fmt::Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selection::All => f.write_str("*"),
            Selection::Columns(columns) => f.write_str(&columns.join(",")),
        }
    }
}

/// Ordering column and direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

impl OrderBy {
    /// Parse `column`, `column.asc` or `column.desc`.
    pub fn parse(order: &str) -> Result<Self> {
        let (column, ascending) = match order.rsplit_once('.') {
            Some((column, "asc")) => (column, true),
            Some((column, "desc")) => (column, false),
            _ => (order, true),
        };
        let column = column.trim();
        if column.is_empty() {
            return Err(Error::InvalidQuery(format!("invalid order '{order}'")));
        }
        Ok(Self {
            column: column.to_string(),
            ascending,
        })
    }
}

impl std::fmt::Display for OrderBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dir = if self.ascending { "asc" } else { "desc" };
        write!(f, "{}.{}", self.column, dir)
    }
}

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            _ => return None,
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
        }
    }
}

/// An equality or range predicate on one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Parse the `op.value` half of a `column=op.value` pair.
    ///
    /// The value is read as JSON when it parses (`5`, `true`, `null`, `"5"`)
    /// and as a plain string otherwise.
    pub fn parse(column: &str, expr: &str) -> Result<Self> {
        let (op, raw) = expr
            .split_once('.')
            .ok_or_else(|| Error::InvalidQuery(format!("filter '{column}={expr}' has no operator")))?;
        let op = FilterOp::parse(op)
            .ok_or_else(|| Error::InvalidQuery(format!("unknown filter operator '{op}'")))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok(Self::new(column, op, value))
    }

    /// Whether the row satisfies this predicate. A missing column reads as null.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.column).unwrap_or(Value::Null);
        match self.op {
            FilterOp::Eq => loosely_equal(&actual, &self.value),
            FilterOp::Neq => !loosely_equal(&actual, &self.value),
            FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
                // Range predicates never match null.
                if actual.is_null() || self.value.is_null() {
                    return false;
                }
                let ord = compare_values(&actual, &self.value);
                match self.op {
                    FilterOp::Gt => ord == Ordering::Greater,
                    FilterOp::Gte => ord != Ordering::Less,
                    FilterOp::Lt => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                }
            }
        }
    }

    fn value_param(&self) -> String {
        match &self.value {
            // Strings that would read back as JSON go out quoted so they stay strings.
            Value::String(s) if serde_json::from_str::<Value>(s).is_ok() => {
                format!("{}.{}", self.op.as_str(), Value::String(s.clone()))
            }
            Value::String(s) => format!("{}.{}", self.op.as_str(), s),
            other => format!("{}.{}", self.op.as_str(), other),
        }
    }
}

/// What a live collection mirrors: columns, order and filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    #[serde(default)]
    pub select: Selection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
}

impl QueryDescriptor {
    /// Every column, no filters, ordered by id.
    pub fn all() -> Self {
        Self::default()
    }

    /// Select columns from a `"id, name"` style list.
    pub fn select(mut self, select: &str) -> Result<Self> {
        self.select = Selection::parse(select)?;
        Ok(self)
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order_by = Some(OrderBy {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn filter(mut self, column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(column, op, value));
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(column, FilterOp::Eq, value)
    }

    /// Whether a row belongs to the slice.
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Total order over rows: the order-by column, then id ascending.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        let primary = match &self.order_by {
            Some(order) => {
                let left = a.get(&order.column).unwrap_or(Value::Null);
                let right = b.get(&order.column).unwrap_or(Value::Null);
                let ord = compare_values(&left, &right);
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            }
            None => Ordering::Equal,
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }

    /// Drop columns the caller did not select.
    ///
    /// `id`, the order-by column and filtered columns are kept so projected
    /// rows can still be ordered and re-checked against the filters.
    pub fn project(&self, mut row: Row) -> Row {
        if let Selection::Columns(columns) = &self.select {
            row.fields.retain(|key, _| {
                columns.iter().any(|c| c == key)
                    || self.order_by.as_ref().is_some_and(|o| &o.column == key)
                    || self.filters.iter().any(|f| &f.column == key)
            });
        }
        row
    }

    /// Filter, order and project a full table.
    pub fn apply(&self, rows: impl IntoIterator<Item = Row>) -> Vec<Row> {
        let mut rows: Vec<Row> = rows
            .into_iter()
            .filter(|r| self.matches(r))
            .map(|r| self.project(r))
            .collect();
        rows.sort_by(|a, b| self.compare(a, b));
        rows
    }

    /// Encode as URL query pairs: `select`, `order` and one `column=op.value`
    /// pair per filter.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), self.select.to_string())];
        if let Some(order) = &self.order_by {
            params.push(("order".to_string(), order.to_string()));
        }
        for filter in &self.filters {
            params.push((filter.column.clone(), filter.value_param()));
        }
        params
    }

    /// Decode the pairs produced by [`QueryDescriptor::to_params`].
    pub fn from_params<'a>(params: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut query = Self::default();
        for (key, value) in params {
            match key {
                "select" => query.select = Selection::parse(value)?,
                "order" => query.order_by = Some(OrderBy::parse(value)?),
                column => query.filters.push(Filter::parse(column, value)?),
            }
        }
        Ok(query)
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Order JSON values: null < bool < number < string < array < object.
///
/// Numbers compare numerically, strings lexicographically (so ISO-8601
/// timestamps order chronologically).
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Equality that tolerates a number or bool compared to its string form, as
/// happens when filter values arrive through a URL.
fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(s), other @ (Value::Number(_) | Value::Bool(_)))
        | (other @ (Value::Number(_) | Value::Bool(_)), Value::String(s)) => {
            *s == other.to_string()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        Row::from_value(value).unwrap()
    }

    #[test]
    fn parse_select() {
        assert_eq!(Selection::parse("*").unwrap(), Selection::All);
        assert_eq!(Selection::parse("").unwrap(), Selection::All);
        assert_eq!(
            Selection::parse("id, name ,created_at").unwrap(),
            Selection::Columns(vec!["id".into(), "name".into(), "created_at".into()])
        );
        assert!(Selection::parse("id,,name").is_err());
    }

    #[test]
    fn parse_order() {
        let order = OrderBy::parse("created_at.desc").unwrap();
        assert_eq!(order.column, "created_at");
        assert!(!order.ascending);

        let order = OrderBy::parse("name").unwrap();
        assert!(order.ascending);
        assert_eq!(order.to_string(), "name.asc");

        assert!(OrderBy::parse(".desc").is_err());
    }

    #[test]
    fn parse_filter() {
        let f = Filter::parse("status", "eq.open").unwrap();
        assert_eq!(f.op, FilterOp::Eq);
        assert_eq!(f.value, json!("open"));

        let f = Filter::parse("tonnage", "gte.12.5").unwrap();
        assert_eq!(f.op, FilterOp::Gte);
        assert_eq!(f.value, json!(12.5));

        assert!(Filter::parse("status", "open").is_err());
        assert!(Filter::parse("status", "like.o%").is_err());
    }

    #[test]
    fn filter_matching() {
        let r = row(json!({"id": "1", "status": "open", "tonnage": 30, "ref": "42"}));

        assert!(Filter::new("status", FilterOp::Eq, "open").matches(&r));
        assert!(Filter::new("status", FilterOp::Neq, "closed").matches(&r));
        assert!(Filter::new("tonnage", FilterOp::Gt, 20).matches(&r));
        assert!(Filter::new("tonnage", FilterOp::Lte, 30).matches(&r));
        assert!(!Filter::new("tonnage", FilterOp::Lt, 30).matches(&r));
        // String form of a number matches the number.
        assert!(Filter::new("ref", FilterOp::Eq, 42).matches(&r));
        // Missing columns are null: never in range, equal to null.
        assert!(!Filter::new("grade", FilterOp::Gt, 1).matches(&r));
        assert!(Filter::new("grade", FilterOp::Eq, Value::Null).matches(&r));
    }

    #[test]
    fn compare_orders_then_ids() {
        let query = QueryDescriptor::all().order_by("created_at", false);
        let a = row(json!({"id": "a", "created_at": "2024-01-02"}));
        let b = row(json!({"id": "b", "created_at": "2024-01-01"}));
        let c = row(json!({"id": "c", "created_at": "2024-01-02"}));

        assert_eq!(query.compare(&a, &b), Ordering::Less);
        assert_eq!(query.compare(&a, &c), Ordering::Less);
        assert_eq!(query.compare(&c, &a), Ordering::Greater);
    }

    #[test]
    fn compare_values_across_types() {
        assert_eq!(compare_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(1.5), &json!(1)), Ordering::Greater);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&json!(10), &json!("1")), Ordering::Less);
    }

    #[test]
    fn project_keeps_order_and_filter_columns() {
        let query = QueryDescriptor::all()
            .select("name")
            .unwrap()
            .order_by("created_at", true)
            .eq("status", "open");
        let r = row(json!({"id": "1", "name": "x", "created_at": 1, "status": "open", "notes": "n"}));

        let projected = query.project(r);
        assert_eq!(projected.id, "1");
        assert!(projected.field("name").is_some());
        assert!(projected.field("created_at").is_some());
        assert!(projected.field("status").is_some());
        assert!(projected.field("notes").is_none());
    }

    #[test]
    fn apply_filters_orders_projects() {
        let query = QueryDescriptor::all()
            .order_by("amount", false)
            .filter("amount", FilterOp::Gt, 10);
        let rows = vec![
            row(json!({"id": "1", "amount": 5})),
            row(json!({"id": "2", "amount": 50})),
            row(json!({"id": "3", "amount": 20})),
        ];
        let ids: Vec<_> = query.apply(rows).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["2", "3"]);
    }

    #[test]
    fn params_roundtrip() {
        let query = QueryDescriptor::all()
            .select("id, name")
            .unwrap()
            .order_by("created_at", false)
            .eq("status", "open")
            .filter("tonnage", FilterOp::Gte, 12);

        let params = query.to_params();
        assert!(params.contains(&("order".to_string(), "created_at.desc".to_string())));
        assert!(params.contains(&("status".to_string(), "eq.open".to_string())));

        let parsed =
            QueryDescriptor::from_params(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .unwrap();
        assert_eq!(parsed, query);
    }

    #[test]
    fn json_lookalike_strings_stay_strings() {
        for text in ["100", "050", "true", "null", " 7", "\"x\"", "[1]"] {
            let query = QueryDescriptor::all().eq("grade", text);
            let params = query.to_params();
            let parsed =
                QueryDescriptor::from_params(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                    .unwrap();
            assert_eq!(parsed, query, "filter value {text:?}");
        }

        // Plain words still travel unquoted.
        let params = QueryDescriptor::all().eq("status", "open").to_params();
        assert!(params.contains(&("status".to_string(), "eq.open".to_string())));
    }

    #[test]
    fn string_range_filter_survives_the_wire() {
        let query = QueryDescriptor::all().filter("grade", FilterOp::Gt, "100");
        let params = query.to_params();
        assert!(params.contains(&("grade".to_string(), "gt.\"100\"".to_string())));

        let parsed =
            QueryDescriptor::from_params(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .unwrap();
        let row = row(json!({ "id": "a", "grade": "050" }));
        // "050" sorts before "100" as text, so both sides agree it is excluded.
        assert_eq!(parsed.filters[0].matches(&row), query.filters[0].matches(&row));
        assert!(!parsed.filters[0].matches(&row));
    }
}
