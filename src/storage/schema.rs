//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Classes table schema.
#[derive(Iden)]
pub enum Classes {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "name"]
    Name,
}

/// SQL for creating the classes table.
pub const CREATE_CLASSES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS classes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL
);
"#;
