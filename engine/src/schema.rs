//! Table schemas and write-boundary validation.
//!
//! Schemas declare the columns of each table so inserts and updates are
//! rejected with a `ValidationError` before anything is written, rather than
//! leaving readers to cope with malformed rows.

use crate::{error::Result, fields, Error, Fields, Mutation, TableName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// ISO-8601 string or epoch milliseconds
    Timestamp,
    /// Arbitrary nested JSON
    Json,
    /// A [`crate::Location`] object
    Location,
    /// A [`crate::QualitySpecifications`] object
    QualitySpecifications,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
            FieldType::Location => write!(f, "Location"),
            FieldType::QualitySpecifications => write!(f, "QualitySpecifications"),
        }
    }
}

/// Definition of a column in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Column name
    pub name: String,
    /// Column type
    pub field_type: FieldType,
    /// Whether inserts must provide a non-null value
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.as_str().is_some_and(is_timestamp),
            FieldType::Json => true,
            FieldType::Location => return fields::validate_location(&self.name, value),
            FieldType::QualitySpecifications => {
                return fields::validate_quality(&self.name, value)
            }
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

/// RFC 3339 date-times and `YYYY-MM-DD` dates. Epoch numbers are refused so a
/// column never mixes representations.
fn is_timestamp(text: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(text).is_ok()
        || chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub name: TableName,
    /// Column definitions (`id` is implicit)
    pub fields: Vec<FieldDef>,
    /// Reject columns that are not declared
    #[serde(default)]
    pub strict: bool,
}

impl TableSchema {
    /// Create a new, non-strict table schema.
    pub fn new(name: impl Into<TableName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            strict: false,
        }
    }

    /// Reject undeclared columns.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Get a column definition.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn check_unknown(&self, fields: &Fields) -> Result<()> {
        if !self.strict {
            return Ok(());
        }
        for key in fields.keys() {
            if key != "id" && self.field(key).is_none() {
                return Err(Error::UnknownField {
                    table: self.name.clone(),
                    field: key.clone(),
                });
            }
        }
        Ok(())
    }

    /// Validate the fields of a new row: every required column present.
    pub fn validate_insert(&self, fields: &Fields) -> Result<()> {
        self.check_unknown(fields)?;
        for field in &self.fields {
            field.validate(fields.get(&field.name))?;
        }
        Ok(())
    }

    /// Validate a partial update: only the sent columns are checked, and a
    /// required column cannot be cleared.
    pub fn validate_update(&self, fields: &Fields) -> Result<()> {
        self.check_unknown(fields)?;
        for (key, value) in fields {
            if let Some(def) = self.field(key) {
                def.validate(Some(value))?;
            }
        }
        Ok(())
    }
}

/// Schema for every table a backend serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema version
    pub version: u32,
    /// Table schemas by name
    pub tables: HashMap<TableName, TableSchema>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            tables: HashMap::new(),
        }
    }

    /// Add a table to the schema.
    pub fn add_table(&mut self, table: TableSchema) -> &mut Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    /// Get a table schema by name.
    pub fn get_table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Look a table up, failing with `TableNotFound`.
    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.get_table(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Validate a mutation against the schema.
    pub fn validate_mutation(&self, table: &str, mutation: &Mutation) -> Result<()> {
        let table = self.table(table)?;
        match mutation {
            Mutation::Insert { fields } => table.validate_insert(fields),
            Mutation::Update { fields, .. } => table.validate_update(fields),
            Mutation::Delete { .. } => Ok(()),
        }
    }

    /// The tables of the back-office suite.
    pub fn back_office() -> Self {
        use FieldType::*;

        let created_at = || FieldDef::optional("created_at", Timestamp);
        let status = || FieldDef::optional("status", String);

        Schema::new(1)
            .with_table(
                TableSchema::new(
                    "purchases",
                    vec![
                        FieldDef::required("supplier_name", String),
                        FieldDef::required("commodity", String),
                        FieldDef::required("quantity_tons", Float),
                        FieldDef::optional("price_per_ton", Float),
                        FieldDef::optional("total_amount", Float),
                        FieldDef::optional("currency", String),
                        FieldDef::optional("purchase_date", Timestamp),
                        FieldDef::optional("location", Location),
                        FieldDef::optional("quality_specifications", QualitySpecifications),
                        FieldDef::optional("notes", String),
                        status(),
                        created_at(),
                    ],
                )
                .strict(),
            )
            .with_table(
                TableSchema::new(
                    "sales",
                    vec![
                        FieldDef::required("buyer_name", String),
                        FieldDef::required("commodity", String),
                        FieldDef::required("quantity_tons", Float),
                        FieldDef::optional("price_per_ton", Float),
                        FieldDef::optional("total_amount", Float),
                        FieldDef::optional("currency", String),
                        FieldDef::optional("sale_date", Timestamp),
                        FieldDef::optional("quality_specifications", QualitySpecifications),
                        FieldDef::optional("notes", String),
                        status(),
                        created_at(),
                    ],
                )
                .strict(),
            )
            .with_table(
                TableSchema::new(
                    "shipments",
                    vec![
                        FieldDef::required("reference", String),
                        FieldDef::optional("sale_id", String),
                        FieldDef::optional("vessel_name", String),
                        FieldDef::optional("origin_port", String),
                        FieldDef::optional("destination_port", String),
                        FieldDef::optional("departure_date", Timestamp),
                        FieldDef::optional("arrival_date", Timestamp),
                        FieldDef::optional("quantity_tons", Float),
                        status(),
                        created_at(),
                    ],
                )
                .strict(),
            )
            .with_table(
                TableSchema::new(
                    "equipment",
                    vec![
                        FieldDef::required("name", String),
                        FieldDef::optional("category", String),
                        FieldDef::optional("serial_number", String),
                        FieldDef::optional("purchase_date", Timestamp),
                        FieldDef::optional("purchase_cost", Float),
                        FieldDef::optional("operating_hours", Float),
                        FieldDef::optional("location", Location),
                        status(),
                        created_at(),
                    ],
                )
                .strict(),
            )
            .with_table(
                TableSchema::new(
                    "fuel_logs",
                    vec![
                        FieldDef::required("equipment_id", String),
                        FieldDef::required("litres", Float),
                        FieldDef::optional("cost", Float),
                        FieldDef::optional("operator", String),
                        FieldDef::optional("log_date", Timestamp),
                        created_at(),
                    ],
                )
                .strict(),
            )
            .with_table(
                TableSchema::new(
                    "employees",
                    vec![
                        FieldDef::required("full_name", String),
                        FieldDef::optional("position", String),
                        FieldDef::optional("department", String),
                        FieldDef::optional("email", String),
                        FieldDef::optional("phone", String),
                        FieldDef::optional("salary", Float),
                        FieldDef::optional("hire_date", Timestamp),
                        status(),
                        created_at(),
                    ],
                )
                .strict(),
            )
            .with_table(
                TableSchema::new(
                    "expenses",
                    vec![
                        FieldDef::required("category", String),
                        FieldDef::required("amount", Float),
                        FieldDef::optional("currency", String),
                        FieldDef::optional("description", String),
                        FieldDef::optional("expense_date", Timestamp),
                        FieldDef::optional("approved", Bool),
                        created_at(),
                    ],
                )
                .strict(),
            )
            .with_table(
                TableSchema::new(
                    "concessions",
                    vec![
                        FieldDef::required("name", String),
                        FieldDef::required("license_number", String),
                        FieldDef::optional("mineral", String),
                        FieldDef::optional("area_hectares", Float),
                        FieldDef::optional("expiry_date", Timestamp),
                        FieldDef::optional("location", Location),
                        status(),
                        created_at(),
                    ],
                )
                .strict(),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn test_schema() -> Schema {
        Schema::new(1).with_table(TableSchema::new(
            "employees",
            vec![
                FieldDef::required("full_name", FieldType::String),
                FieldDef::required("salary", FieldType::Int),
                FieldDef::optional("email", FieldType::String),
            ],
        ))
    }

    #[test]
    fn validate_valid_insert() {
        let schema = test_schema();
        let table = schema.get_table("employees").unwrap();

        assert!(table
            .validate_insert(&fields(json!({"full_name": "Amina", "salary": 3000})))
            .is_ok());
        assert!(table
            .validate_insert(&fields(
                json!({"full_name": "Joseph", "salary": 2500, "email": "j@example.com"})
            ))
            .is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let schema = test_schema();
        let table = schema.get_table("employees").unwrap();

        let result = table.validate_insert(&fields(json!({"full_name": "Amina"})));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "salary"));
    }

    #[test]
    fn validate_wrong_type() {
        let schema = test_schema();
        let table = schema.get_table("employees").unwrap();

        let result = table.validate_insert(&fields(json!({"full_name": "Amina", "salary": "lots"})));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "salary"));
    }

    #[test]
    fn update_checks_only_sent_fields() {
        let schema = test_schema();
        let table = schema.get_table("employees").unwrap();

        assert!(table.validate_update(&fields(json!({"email": "a@b.c"}))).is_ok());

        let result = table.validate_update(&fields(json!({"full_name": null})));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "full_name"));
    }

    #[test]
    fn validate_table_not_found() {
        let schema = test_schema();
        let mutation = Mutation::Insert {
            fields: fields(json!({"title": "Hello"})),
        };

        let result = schema.validate_mutation("posts", &mutation);
        assert!(matches!(result, Err(Error::TableNotFound(t)) if t == "posts"));
    }

    #[test]
    fn strict_table_rejects_unknown_columns() {
        let schema = Schema::back_office();
        let mutation = Mutation::Insert {
            fields: fields(json!({"category": "fuel", "amount": 120.5, "colour": "red"})),
        };

        let result = schema.validate_mutation("expenses", &mutation);
        assert!(matches!(result, Err(Error::UnknownField { field, .. }) if field == "colour"));
    }

    #[test]
    fn back_office_structured_fields() {
        let schema = Schema::back_office();

        let ok = Mutation::Insert {
            fields: fields(json!({
                "name": "Nyakafuru North",
                "license_number": "PML-0042",
                "location": {"latitude": -3.2, "longitude": 32.1, "region": "Geita"}
            })),
        };
        assert!(schema.validate_mutation("concessions", &ok).is_ok());

        let bad = Mutation::Update {
            id: "p-1".into(),
            fields: fields(json!({"quality_specifications": {"purity_percent": 140}})),
        };
        let err = schema.validate_mutation("purchases", &bad).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);

        let delete = Mutation::Delete { id: "p-1".into() };
        assert!(schema.validate_mutation("purchases", &delete).is_ok());

        for table in [
            "purchases",
            "sales",
            "shipments",
            "equipment",
            "fuel_logs",
            "employees",
            "expenses",
            "concessions",
        ] {
            assert!(schema.get_table(table).is_some(), "missing {table}");
        }
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::Location.to_string(), "Location");
        assert_eq!(FieldType::Json.to_string(), "Json");
    }

    #[test]
    fn schema_serialization() {
        let schema = test_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let parsed: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(schema, parsed);
    }

    #[test]
    fn json_field_accepts_any() {
        let table = TableSchema::new("events", vec![FieldDef::required("data", FieldType::Json)]);

        assert!(table.validate_insert(&fields(json!({"data": "string"}))).is_ok());
        assert!(table.validate_insert(&fields(json!({"data": 123}))).is_ok());
        assert!(table.validate_insert(&fields(json!({"data": [1, 2, 3]}))).is_ok());
        assert!(table
            .validate_insert(&fields(json!({"data": {"nested": "object"}})))
            .is_ok());
    }

    #[test]
    fn timestamp_field_takes_dates_and_rfc3339() {
        let table = TableSchema::new(
            "fuel_logs",
            vec![FieldDef::required("log_date", FieldType::Timestamp)],
        );

        for ok in ["2024-03-01", "2024-03-01T08:00:00Z", "2024-03-01T08:00:00.250+02:00"] {
            assert!(
                table.validate_insert(&fields(json!({ "log_date": ok }))).is_ok(),
                "{ok}"
            );
        }

        for bad in [json!("yesterday"), json!("2024-13-01"), json!(""), json!(1709280000)] {
            let result = table.validate_insert(&fields(json!({ "log_date": bad })));
            assert!(
                matches!(&result, Err(Error::TypeMismatch { field, expected, .. })
                    if field == "log_date" && expected == "Timestamp"),
                "{result:?}"
            );
        }
    }
}
