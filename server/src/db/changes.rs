//! Database operations for the change log.
//!
//! Every committed write appends one entry; its `seq` is the ordering key
//! clients reconcile by.

use quarry_engine::{Change, ChangeEvent, Row, Seq};
use sqlx::{PgConnection, PgPool, Row as _};

/// A stored change-log entry.
#[derive(Debug)]
pub struct StoredChange {
    pub seq: i64,
    pub row_id: String,
    pub op: String,
    pub data: Option<serde_json::Value>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredChange {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredChange {
            seq: row.try_get("seq")?,
            row_id: row.try_get("row_id")?,
            op: row.try_get("op")?,
            data: row.try_get("data")?,
        })
    }
}

impl StoredChange {
    /// Convert a log entry back into the change clients receive.
    pub fn to_change(&self) -> Result<Change, String> {
        let row = || -> Result<Row, String> {
            let data = self
                .data
                .clone()
                .ok_or_else(|| format!("change {} has no row data", self.seq))?;
            Row::from_value(data).map_err(|e| e.to_string())
        };

        let event = match self.op.as_str() {
            "inserted" => ChangeEvent::Inserted(row()?),
            "updated" => ChangeEvent::Updated(row()?),
            "deleted" => ChangeEvent::Deleted(self.row_id.clone()),
            other => return Err(format!("Unknown change type: {}", other)),
        };
        Ok(Change::new(self.seq as Seq, event))
    }
}

fn op_name(event: &ChangeEvent) -> &'static str {
    match event {
        ChangeEvent::Inserted(_) => "inserted",
        ChangeEvent::Updated(_) => "updated",
        ChangeEvent::Deleted(_) => "deleted",
    }
}

/// Append a change inside the caller's transaction and return its seq.
pub async fn append_change(
    conn: &mut PgConnection,
    table: &str,
    event: &ChangeEvent,
) -> Result<Seq, sqlx::Error> {
    let data = match event {
        ChangeEvent::Inserted(row) | ChangeEvent::Updated(row) => Some(row.to_value()),
        ChangeEvent::Deleted(_) => None,
    };

    let result: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO changes (table_name, row_id, op, data)
        VALUES ($1, $2, $3, $4)
        RETURNING seq
        "#,
    )
    .bind(table)
    .bind(event.row_id())
    .bind(op_name(event))
    .bind(data)
    .fetch_one(conn)
    .await?;

    Ok(result.0 as Seq)
}

/// Highest seq committed so far, across all tables.
pub async fn latest_seq(conn: &mut PgConnection) -> Result<Seq, sqlx::Error> {
    let result: (i64,) = sqlx::query_as(r#"SELECT COALESCE(MAX(seq), 0) FROM changes"#)
        .fetch_one(conn)
        .await?;

    Ok(result.0 as Seq)
}

/// Changes of one table after `since`, oldest first.
pub async fn changes_since(
    pool: &PgPool,
    table: &str,
    since: Seq,
    limit: i64,
) -> Result<Vec<StoredChange>, sqlx::Error> {
    sqlx::query_as::<_, StoredChange>(
        r#"
        SELECT seq, row_id, op, data
        FROM changes
        WHERE table_name = $1 AND seq > $2
        ORDER BY seq ASC
        LIMIT $3
        "#,
    )
    .bind(table)
    .bind(since as i64)
    .bind(limit)
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(op: &str, data: Option<serde_json::Value>) -> StoredChange {
        StoredChange {
            seq: 7,
            row_id: "r1".into(),
            op: op.into(),
            data,
        }
    }

    #[test]
    fn log_entries_become_changes() {
        let change = stored("inserted", Some(json!({"id": "r1", "litres": 40.0})))
            .to_change()
            .unwrap();
        assert_eq!(change.seq, 7);
        match change.event {
            ChangeEvent::Inserted(row) => assert_eq!(row.field("litres"), Some(&json!(40.0))),
            other => panic!("expected insert, got {other:?}"),
        }

        let change = stored("deleted", None).to_change().unwrap();
        assert_eq!(change.event, ChangeEvent::Deleted("r1".into()));
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(stored("updated", None).to_change().is_err());
        assert!(stored("merged", None).to_change().is_err());
    }
}
