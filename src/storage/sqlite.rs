//! SQLite class repository.

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::schema::{Classes, CREATE_CLASSES_TABLE};
use super::{ClassRepository, Result, StorageError};
use crate::model::ClassRecord;

/// SQLite implementation of `ClassRepository`.
pub struct SqliteClassRepository {
    pool: SqlitePool,
}

impl SqliteClassRepository {
    /// Create a new SQLite class repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the classes table if it does not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_CLASSES_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> ClassRecord {
    ClassRecord {
        id: Some(row.get("id")),
        name: row.get("name"),
    }
}

#[async_trait]
impl ClassRepository for SqliteClassRepository {
    async fn save(&self, record: ClassRecord) -> Result<ClassRecord> {
        let query = match record.id {
            Some(id) => Query::insert()
                .into_table(Classes::Table)
                .columns([Classes::Id, Classes::Name])
                .values_panic([id.into(), record.name.clone().into()])
                .on_conflict(
                    OnConflict::column(Classes::Id)
                        .update_column(Classes::Name)
                        .to_owned(),
                )
                .to_string(SqliteQueryBuilder),
            None => Query::insert()
                .into_table(Classes::Table)
                .columns([Classes::Name])
                .values_panic([record.name.clone().into()])
                .to_string(SqliteQueryBuilder),
        };

        let result = sqlx::query(&query).execute(&self.pool).await?;
        let id = record.id.unwrap_or_else(|| result.last_insert_rowid());
        debug!(id, "Saved class");

        Ok(ClassRecord {
            id: Some(id),
            name: record.name,
        })
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<ClassRecord>> {
        let query = Query::select()
            .columns([Classes::Id, Classes::Name])
            .from(Classes::Table)
            .and_where(Expr::col(Classes::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(record_from_row))
    }

    async fn delete_by_id(&self, id: i64) -> Result<()> {
        let query = Query::delete()
            .from_table(Classes::Table)
            .and_where(Expr::col(Classes::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<ClassRecord>> {
        let query = Query::select()
            .columns([Classes::Id, Classes::Name])
            .from(Classes::Table)
            .order_by(Classes::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(record_from_row).collect())
    }
}
