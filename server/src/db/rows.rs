//! Database operations for the rows table.
//!
//! Each write runs in one transaction with its change-log entry, so a row's
//! stored `seq` is always the seq of the change that produced it.

use quarry_engine::{ChangeEvent, Fields, Row, Seq, Snapshot};
use sqlx::{PgPool, Row as _};

use super::changes::{append_change, latest_seq};

/// A stored row from the database.
#[derive(Debug)]
pub struct StoredRow {
    pub id: String,
    pub fields: serde_json::Value,
    #[allow(dead_code)]
    pub seq: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRow {
            id: row.try_get("id")?,
            fields: row.try_get("fields")?,
            seq: row.try_get("seq")?,
        })
    }
}

impl StoredRow {
    /// Convert database row to an engine `Row`.
    pub fn to_row(&self) -> Row {
        let fields = match &self.fields {
            serde_json::Value::Object(map) => map.clone(),
            _ => Fields::new(),
        };
        Row::new(&self.id, fields)
    }
}

/// Read every row of a table together with the seq they reflect.
///
/// Both reads share one repeatable-read transaction, so no write can land
/// between them.
pub async fn fetch_snapshot(pool: &PgPool, table: &str) -> Result<Snapshot, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await?;

    let stored = sqlx::query_as::<_, StoredRow>(
        r#"
        SELECT id, fields, seq
        FROM rows
        WHERE table_name = $1
        "#,
    )
    .bind(table)
    .fetch_all(&mut *tx)
    .await?;

    let seq = latest_seq(&mut tx).await?;
    tx.commit().await?;

    Ok(Snapshot::new(
        stored.iter().map(StoredRow::to_row).collect(),
        seq,
    ))
}

/// Insert a new row. Returns `None` when the id is already taken.
pub async fn insert_row(pool: &PgPool, table: &str, row: &Row) -> Result<Option<Seq>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let seq = append_change(&mut tx, table, &ChangeEvent::Inserted(row.clone())).await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO rows (table_name, id, fields, seq)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (table_name, id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(table)
    .bind(&row.id)
    .bind(serde_json::Value::Object(row.fields.clone()))
    .bind(seq as i64)
    .fetch_optional(&mut *tx)
    .await?;

    if inserted.is_none() {
        tx.rollback().await?;
        return Ok(None);
    }

    tx.commit().await?;
    Ok(Some(seq))
}

/// Overwrite the given fields of a row. Returns `None` when it does not exist.
pub async fn update_row(
    pool: &PgPool,
    table: &str,
    id: &str,
    patch: &Fields,
) -> Result<Option<(Row, Seq)>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query_as::<_, StoredRow>(
        r#"
        SELECT id, fields, seq
        FROM rows
        WHERE table_name = $1 AND id = $2
        FOR UPDATE
        "#,
    )
    .bind(table)
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(current) = current else {
        tx.rollback().await?;
        return Ok(None);
    };

    let mut row = current.to_row();
    row.merge(patch);
    let seq = append_change(&mut tx, table, &ChangeEvent::Updated(row.clone())).await?;

    sqlx::query(
        r#"
        UPDATE rows
        SET fields = $3, seq = $4, updated_at = NOW()
        WHERE table_name = $1 AND id = $2
        "#,
    )
    .bind(table)
    .bind(id)
    .bind(serde_json::Value::Object(row.fields.clone()))
    .bind(seq as i64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some((row, seq)))
}

/// Delete a row. Returns `None` when it does not exist.
pub async fn delete_row(pool: &PgPool, table: &str, id: &str) -> Result<Option<Seq>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let deleted = sqlx::query(
        r#"
        DELETE FROM rows
        WHERE table_name = $1 AND id = $2
        RETURNING id
        "#,
    )
    .bind(table)
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;

    if deleted.is_none() {
        tx.rollback().await?;
        return Ok(None);
    }

    let seq = append_change(&mut tx, table, &ChangeEvent::Deleted(id.to_string())).await?;
    tx.commit().await?;
    Ok(Some(seq))
}
