use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::info;
use crate::backend::db::{self, Database};
use crate::backend::dependency::{self, DependencyKind};
use crate::backend::{column, lease};
use crate::util::error;

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
/// The most bare-bones version of table metadata, used for listing the tables of a database.
pub struct BasicMetadata {
    pub oid: i64,
    pub database_oid: i64,
    pub name: String,
    pub created_at: i64,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// Table metadata together with its ordered columns.
pub struct Metadata {
    #[serde(flatten)]
    pub table: BasicMetadata,
    pub columns: Vec<column::Metadata>,
}

fn from_row(row: &Row<'_>) -> Result<BasicMetadata, rusqlite::Error> {
    return Ok(BasicMetadata {
        oid: row.get("OID")?,
        database_oid: row.get("DATABASE_OID")?,
        name: row.get("NAME")?,
        created_at: row.get("CREATED_AT")?,
    });
}

/// Creates a new table.
pub fn create(db: &Database, database_oid: i64, name: &str) -> Result<BasicMetadata, error::Error> {
    let name = name.trim();
    if name.is_empty() {
        return Err(error::Error::Validation("table name cannot be empty".into()));
    }

    let mut conn = db.connect()?;
    let trans = db::begin_write(&mut conn)?;

    // Add metadata for the table
    trans.execute(
        "INSERT INTO METADATA_TABLE (DATABASE_OID, NAME, CREATED_AT) VALUES (?1, ?2, ?3)",
        params![database_oid, name, db::now()]
    )?;
    let table_oid = trans.last_insert_rowid();
    let table = get_basic(&trans, table_oid)?;

    // Commit the transaction
    trans.commit()?;
    info!(database_oid, table_oid, name, "created table");
    return Ok(table);
}

/// Checks whether a table exists.
pub fn exists(conn: &Connection, table_oid: i64) -> Result<bool, error::Error> {
    let found: Option<i64> = conn.query_row(
        "SELECT OID FROM METADATA_TABLE WHERE OID = ?1",
        params![table_oid],
        |row| row.get(0)
    ).optional()?;
    return Ok(found.is_some());
}

/// Fails with a not-found error if the table does not exist.
pub fn ensure_exists(conn: &Connection, table_oid: i64) -> Result<(), error::Error> {
    if !exists(conn, table_oid)? {
        return Err(error::Error::not_found(error::ResourceType::Table, table_oid));
    }
    return Ok(());
}

pub fn get_basic(conn: &Connection, table_oid: i64) -> Result<BasicMetadata, error::Error> {
    let table = conn.query_row(
        "SELECT OID, DATABASE_OID, NAME, CREATED_AT FROM METADATA_TABLE WHERE OID = ?1",
        params![table_oid],
        from_row
    ).optional()?;
    return match table {
        Some(t) => Ok(t),
        None => Err(error::Error::not_found(error::ResourceType::Table, table_oid))
    };
}

/// Gets a table with its columns.
pub fn get(db: &Database, table_oid: i64) -> Result<Metadata, error::Error> {
    let conn = db.connect()?;
    let table = get_basic(&conn, table_oid)?;
    let columns = column::list_for_table(&conn, table_oid)?;
    return Ok(Metadata { table, columns });
}

/// Lists the tables of a database.
pub fn list(db: &Database, database_oid: i64) -> Result<Vec<BasicMetadata>, error::Error> {
    let conn = db.connect()?;
    let mut tables: Vec<BasicMetadata> = Vec::new();
    db::query_iterate(
        &conn,
        "SELECT OID, DATABASE_OID, NAME, CREATED_AT FROM METADATA_TABLE WHERE DATABASE_OID = ?1 ORDER BY OID",
        params![database_oid],
        &mut |row| {
            tables.push(from_row(row)?);
            return Ok(());
        }
    )?;
    return Ok(tables);
}

/// Deletes a table together with its columns, records and jobs.
/// Linked and lookup columns of other tables that referenced it are flagged invalid.
pub fn delete(db: &Database, table_oid: i64) -> Result<(), error::Error> {
    let mut conn = db.connect()?;
    let trans = db::begin_write(&mut conn)?;
    let table = get_basic(&trans, table_oid)?;
    lease::ensure_free(&trans, table_oid)?;

    // Flag every column elsewhere that referenced the table
    let mut invalidated: Vec<i64> = Vec::new();
    for dependent in dependency::dependents_of_table(&trans, table_oid)? {
        if invalidated.contains(&dependent.dependent_column_oid) {
            continue;
        }
        let reason = match dependent.kind {
            DependencyKind::Link => format!("linked table '{}' was deleted", table.name),
            DependencyKind::LookupSource | DependencyKind::LookupTarget => format!("lookup table '{}' was deleted", table.name),
        };
        dependency::mark_invalid(&trans, dependent.dependent_column_oid, &reason)?;
        invalidated.push(dependent.dependent_column_oid);
    }
    trans.execute("DELETE FROM METADATA_COLUMN_DEPENDENCY WHERE TARGET_TABLE_OID = ?1", params![table_oid])?;

    // Delete the table; columns, records, jobs and reports cascade
    trans.execute("DELETE FROM METADATA_TABLE WHERE OID = ?1", params![table_oid])?;

    // Commit the transaction
    trans.commit()?;
    info!(table_oid, name = %table.name, invalidated = ?invalidated, "deleted table");
    return Ok(());
}
