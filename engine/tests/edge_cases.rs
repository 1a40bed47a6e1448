//! Edge case tests for quarry-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use quarry_engine::{
    Change, ChangeEvent, Committed, Error, ErrorKind, FilterOp, LiveCollection, Mutation,
    QueryDescriptor, Row, Schema, Snapshot,
};
use serde_json::json;

fn row(value: serde_json::Value) -> Row {
    Row::from_value(value).unwrap()
}

fn fields(value: serde_json::Value) -> quarry_engine::Fields {
    value.as_object().cloned().unwrap()
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn unicode_ids_and_values() {
    let mut collection = LiveCollection::new(QueryDescriptor::all().order_by("name", true));
    let names = ["Kahama", "Mwadui \u{1F48E}", "\u{0428}\u{0430}\u{0445}\u{0442}\u{0430}", "\u{9271}\u{5C71}", ""];

    for (i, name) in names.iter().enumerate() {
        collection.apply_change(Change::new(
            i as u64 + 1,
            ChangeEvent::Inserted(row(json!({"id": format!("\u{00FC}-{}", i), "name": name}))),
        ));
    }

    assert_eq!(collection.len(), names.len());
    // Empty string sorts first.
    assert_eq!(collection.rows()[0].field("name"), Some(&json!("")));
}

#[test]
fn very_long_strings() {
    let mut collection = LiveCollection::new(QueryDescriptor::all());
    let long_string = "x".repeat(1024 * 1024);

    collection.apply_change(Change::new(
        1,
        ChangeEvent::Inserted(row(json!({"id": "note-1", "notes": long_string.clone()}))),
    ));

    let held = collection.get("note-1").unwrap();
    assert_eq!(held.field("notes").unwrap().as_str().unwrap().len(), 1024 * 1024);
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[test]
fn integer_boundaries_order() {
    let mut collection = LiveCollection::new(QueryDescriptor::all().order_by("amount", true));
    let values = [i64::MAX, 0, i64::MIN, -1, 1];

    for (i, value) in values.iter().enumerate() {
        collection.apply_change(Change::new(
            i as u64 + 1,
            ChangeEvent::Inserted(row(json!({"id": format!("n{}", i), "amount": value}))),
        ));
    }

    let amounts: Vec<i64> = collection
        .rows()
        .iter()
        .map(|r| r.field("amount").unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(amounts, [i64::MIN, -1, 0, 1, i64::MAX]);
}

#[test]
fn seq_high_values() {
    let mut collection = LiveCollection::new(QueryDescriptor::all());
    collection.load_snapshot(Snapshot::new(vec![], u64::MAX - 1));

    let applied =
        collection.apply_change(Change::new(u64::MAX, ChangeEvent::Inserted(row(json!({"id": "a"})))));
    assert!(applied.is_visible());
    assert_eq!(collection.seq(), u64::MAX);
}

// ============================================================================
// Ordering Edge Cases
// ============================================================================

#[test]
fn missing_order_column_sorts_as_null() {
    let mut collection = LiveCollection::new(QueryDescriptor::all().order_by("created_at", false));
    collection.load_snapshot(Snapshot::new(
        vec![
            row(json!({"id": "a", "created_at": "2024-03-01T10:00:00Z"})),
            row(json!({"id": "b"})),
            row(json!({"id": "c", "created_at": null})),
            row(json!({"id": "d", "created_at": "2024-03-02T08:00:00Z"})),
        ],
        1,
    ));

    let ids: Vec<_> = collection.rows().iter().map(|r| r.id.as_str()).collect();
    // Descending: newest first, nulls last, ties by id.
    assert_eq!(ids, ["d", "a", "b", "c"]);
}

#[test]
fn mixed_type_order_column() {
    let query = QueryDescriptor::all().order_by("ref", true);
    let rows = vec![
        row(json!({"id": "1", "ref": "A-1"})),
        row(json!({"id": "2", "ref": 7})),
        row(json!({"id": "3", "ref": true})),
        row(json!({"id": "4"})),
    ];
    let ids: Vec<_> = query.apply(rows).into_iter().map(|r| r.id).collect();
    assert_eq!(ids, ["4", "3", "2", "1"]);
}

// ============================================================================
// Reconciliation Edge Cases
// ============================================================================

#[test]
fn own_insert_before_and_after_echo() {
    let new_row = row(json!({"id": "new-id", "name": "x"}));

    // Response first.
    let mut first = LiveCollection::new(QueryDescriptor::all());
    first.apply_inserted(Committed::new(new_row.clone(), 5));
    first.apply_change(Change::new(5, ChangeEvent::Inserted(new_row.clone())));

    // Echo first.
    let mut second = LiveCollection::new(QueryDescriptor::all());
    second.apply_change(Change::new(5, ChangeEvent::Inserted(new_row.clone())));
    second.apply_inserted(Committed::new(new_row, 5));

    assert_eq!(first.len(), 1);
    assert_eq!(first.rows(), second.rows());
}

#[test]
fn delete_then_reinsert_same_id() {
    let mut collection = LiveCollection::new(QueryDescriptor::all());
    collection.apply_change(Change::new(1, ChangeEvent::Inserted(row(json!({"id": "x", "v": 1})))));
    collection.apply_change(Change::new(2, ChangeEvent::Deleted("x".into())));
    collection.apply_change(Change::new(3, ChangeEvent::Inserted(row(json!({"id": "x", "v": 2})))));

    assert_eq!(collection.get("x").unwrap().field("v"), Some(&json!(2)));
}

#[test]
fn range_filter_on_timestamps() {
    let query = QueryDescriptor::all()
        .filter("log_date", FilterOp::Gte, "2024-01-01")
        .filter("log_date", FilterOp::Lt, "2024-02-01");
    let mut collection = LiveCollection::new(query);
    collection.load_snapshot(Snapshot::new(
        vec![
            row(json!({"id": "1", "log_date": "2023-12-31"})),
            row(json!({"id": "2", "log_date": "2024-01-15"})),
            row(json!({"id": "3", "log_date": "2024-02-01"})),
            row(json!({"id": "4"})),
        ],
        1,
    ));

    let ids: Vec<_> = collection.rows().iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["2"]);
}

// ============================================================================
// Validation Edge Cases
// ============================================================================

#[test]
fn back_office_validation_errors_are_typed() {
    let schema = Schema::back_office();

    let missing = Mutation::Insert {
        fields: fields(json!({"equipment_id": "eq-1"})),
    };
    let err = schema.validate_mutation("fuel_logs", &missing).unwrap_err();
    assert!(matches!(err, Error::MissingRequiredField(ref f) if f == "litres"));
    assert_eq!(err.kind(), ErrorKind::Validation);

    let unknown_table = Mutation::Delete { id: "1".into() };
    let err = schema.validate_mutation("compliance_checks", &unknown_table).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn deeply_nested_json_field() {
    let mut nested = json!({"value": "leaf"});
    for _ in 0..50 {
        nested = json!({"nested": nested});
    }

    let r = row(json!({"id": "deep", "data": nested}));
    let parsed: Row = serde_json::from_str(&serde_json::to_string(&r).unwrap()).unwrap();
    assert_eq!(parsed, r);
}
