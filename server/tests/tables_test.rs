//! Request and response shapes of the table endpoints.

use quarry_engine::{Committed, Error, QueryDescriptor, Row, RowId, Schema, Snapshot};
use serde_json::json;

fn rows() -> Vec<Row> {
    [
        json!({"id": "p1", "supplier_name": "Kivu", "commodity": "coltan", "quantity_tons": 12.5, "created_at": "2024-03-01T08:00:00Z"}),
        json!({"id": "p2", "supplier_name": "Lualaba", "commodity": "cobalt", "quantity_tons": 40.0, "created_at": "2024-03-03T08:00:00Z"}),
        json!({"id": "p3", "supplier_name": "Kivu", "commodity": "cobalt", "quantity_tons": 7.0, "created_at": "2024-03-02T08:00:00Z"}),
    ]
    .into_iter()
    .map(|v| Row::from_value(v).unwrap())
    .collect()
}

fn ids(rows: &[Row]) -> Vec<&str> {
    rows.iter().map(|r| r.id.as_str()).collect()
}

#[test]
fn test_query_string_drives_the_slice() {
    // ?select=id,commodity&order=created_at.desc&commodity=eq.cobalt
    let params = [
        ("select", "id,commodity"),
        ("order", "created_at.desc"),
        ("commodity", "eq.cobalt"),
    ];
    let query = QueryDescriptor::from_params(params).unwrap();
    let slice = query.apply(rows());

    assert_eq!(ids(&slice), ["p2", "p3"]);
    // Order and filter columns survive projection.
    let mut columns: Vec<&str> = slice[0].fields.keys().map(String::as_str).collect();
    columns.sort();
    assert_eq!(columns, ["commodity", "created_at"]);
}

#[test]
fn test_range_filter_from_query_string() {
    let query = QueryDescriptor::from_params([("quantity_tons", "gte.10"), ("order", "id")]).unwrap();
    assert_eq!(ids(&query.apply(rows())), ["p1", "p2"]);
}

#[test]
fn test_client_params_are_understood() {
    let query = QueryDescriptor::all()
        .order_by("created_at", false)
        .eq("supplier_name", "Kivu");
    let pairs = query.to_params();
    let parsed =
        QueryDescriptor::from_params(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))).unwrap();
    assert_eq!(ids(&parsed.apply(rows())), ["p3", "p1"]);
}

#[test]
fn test_malformed_filter_is_invalid_query() {
    let err = QueryDescriptor::from_params([("commodity", "cobalt")]).unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));
}

#[test]
fn test_response_bodies() {
    let snapshot = Snapshot::new(rows().into_iter().take(1).collect(), 12);
    let value = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(value["seq"], 12);
    assert_eq!(value["rows"][0]["id"], "p1");
    assert_eq!(value["rows"][0]["commodity"], "coltan");

    let inserted = Committed::new(rows().remove(1), 13);
    let value = serde_json::to_value(&inserted).unwrap();
    assert_eq!(value["data"]["id"], "p2");
    assert_eq!(value["seq"], 13);

    let deleted: Committed<RowId> = serde_json::from_value(json!({"data": "p2", "seq": 14})).unwrap();
    assert_eq!(deleted, Committed::new("p2".to_string(), 14));
}

#[test]
fn test_write_validation() {
    let schema = Schema::back_office();
    let purchases = schema.table("purchases").unwrap();

    let missing = json!({"supplier_name": "Kivu", "commodity": "coltan"});
    let err = purchases
        .validate_insert(missing.as_object().unwrap())
        .unwrap_err();
    assert_eq!(err, Error::MissingRequiredField("quantity_tons".into()));

    let patch = json!({"quantity_tons": "many"});
    let err = purchases
        .validate_update(patch.as_object().unwrap())
        .unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { ref field, .. } if field == "quantity_tons"));

    assert!(matches!(schema.table("ore_bodies"), Err(Error::TableNotFound(_))));
}
