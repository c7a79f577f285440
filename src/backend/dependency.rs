use rusqlite::{params, Connection};
use tracing::info;
use crate::backend::column_type::ColumnType;
use crate::backend::db;
use crate::util::error;

/// How a column depends on another table or column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyKind {
    /// A linked column on the table it links to.
    Link,
    /// A lookup column on the linked column it follows.
    LookupSource,
    /// A lookup column on the column it projects.
    LookupTarget,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        return match self {
            Self::Link => "link",
            Self::LookupSource => "lookup_source",
            Self::LookupTarget => "lookup_target",
        };
    }

    pub fn from_database(kind: &str) -> Option<DependencyKind> {
        return match kind {
            "link" => Some(Self::Link),
            "lookup_source" => Some(Self::LookupSource),
            "lookup_target" => Some(Self::LookupTarget),
            _ => None
        };
    }
}

/// One entry of the reverse dependency index.
#[derive(Clone, Debug, PartialEq)]
pub struct Dependency {
    pub dependent_column_oid: i64,
    pub kind: DependencyKind,
    pub target_table_oid: i64,
    pub target_column_oid: Option<i64>,
}

/// Replaces the index entries of a column with those implied by its type.
pub fn register(conn: &Connection, table_oid: i64, column_oid: i64, column_type: &ColumnType) -> Result<(), error::Error> {
    clear(conn, column_oid)?;

    let entries: Vec<(DependencyKind, i64, Option<i64>)> = match column_type {
        ColumnType::LinkedTable(cfg) => vec![
            (DependencyKind::Link, cfg.linked_table_id, None)
        ],
        ColumnType::Lookup(cfg) => {
            let mut entries = vec![(DependencyKind::LookupTarget, cfg.linked_table_id, Some(cfg.lookup_column_id))];
            if let Some(link_column_oid) = cfg.link_column_id {
                entries.push((DependencyKind::LookupSource, table_oid, Some(link_column_oid)));
            }
            entries
        },
        _ => Vec::new()
    };
    for (kind, target_table_oid, target_column_oid) in entries {
        conn.execute(
            "INSERT INTO METADATA_COLUMN_DEPENDENCY (DEPENDENT_COLUMN_OID, KIND, TARGET_TABLE_OID, TARGET_COLUMN_OID) VALUES (?1, ?2, ?3, ?4)",
            params![column_oid, kind.as_str(), target_table_oid, target_column_oid]
        )?;
    }
    return Ok(());
}

/// Removes every index entry of a column.
pub fn clear(conn: &Connection, column_oid: i64) -> Result<(), error::Error> {
    conn.execute("DELETE FROM METADATA_COLUMN_DEPENDENCY WHERE DEPENDENT_COLUMN_OID = ?1", params![column_oid])?;
    return Ok(());
}

/// Removes the index entries that point at a column, once that column is gone.
pub fn clear_targeting_column(conn: &Connection, column_oid: i64) -> Result<usize, error::Error> {
    let removed = conn.execute("DELETE FROM METADATA_COLUMN_DEPENDENCY WHERE TARGET_COLUMN_OID = ?1", params![column_oid])?;
    return Ok(removed);
}

fn query(conn: &Connection, sql: &str, target_oid: i64) -> Result<Vec<Dependency>, error::Error> {
    let mut dependencies: Vec<Dependency> = Vec::new();
    db::query_iterate(conn, sql, params![target_oid], &mut |row| {
        let kind: String = row.get("KIND")?;
        let kind = match DependencyKind::from_database(&kind) {
            Some(k) => k,
            None => {
                return Err(error::Error::Validation(format!("unknown dependency kind '{kind}'")));
            }
        };
        dependencies.push(Dependency {
            dependent_column_oid: row.get("DEPENDENT_COLUMN_OID")?,
            kind,
            target_table_oid: row.get("TARGET_TABLE_OID")?,
            target_column_oid: row.get("TARGET_COLUMN_OID")?,
        });
        return Ok(());
    })?;
    return Ok(dependencies);
}

/// Columns that depend on the given column.
pub fn dependents_of_column(conn: &Connection, column_oid: i64) -> Result<Vec<Dependency>, error::Error> {
    return query(
        conn,
        "SELECT DEPENDENT_COLUMN_OID, KIND, TARGET_TABLE_OID, TARGET_COLUMN_OID FROM METADATA_COLUMN_DEPENDENCY WHERE TARGET_COLUMN_OID = ?1 ORDER BY DEPENDENT_COLUMN_OID",
        column_oid
    );
}

/// Columns of other tables that depend on the given table or any of its columns.
pub fn dependents_of_table(conn: &Connection, table_oid: i64) -> Result<Vec<Dependency>, error::Error> {
    return query(
        conn,
        "SELECT d.DEPENDENT_COLUMN_OID, d.KIND, d.TARGET_TABLE_OID, d.TARGET_COLUMN_OID
        FROM METADATA_COLUMN_DEPENDENCY d
        INNER JOIN METADATA_TABLE_COLUMN c ON c.OID = d.DEPENDENT_COLUMN_OID
        WHERE d.TARGET_TABLE_OID = ?1 AND c.TABLE_OID <> ?1
        ORDER BY d.DEPENDENT_COLUMN_OID",
        table_oid
    );
}

/// Linked columns (on any table) whose values reference records of the given table.
pub fn linking_columns_to_table(conn: &Connection, table_oid: i64) -> Result<Vec<i64>, error::Error> {
    let dependencies = query(
        conn,
        "SELECT DEPENDENT_COLUMN_OID, KIND, TARGET_TABLE_OID, TARGET_COLUMN_OID FROM METADATA_COLUMN_DEPENDENCY WHERE TARGET_TABLE_OID = ?1 AND KIND = 'link' ORDER BY DEPENDENT_COLUMN_OID",
        table_oid
    )?;
    return Ok(dependencies.into_iter().map(|d| d.dependent_column_oid).collect());
}

/// Flags a column as invalid.
pub fn mark_invalid(conn: &Connection, column_oid: i64, reason: &str) -> Result<(), error::Error> {
    conn.execute(
        "UPDATE METADATA_TABLE_COLUMN SET IS_INVALID = 1, INVALID_REASON = ?1 WHERE OID = ?2",
        params![reason, column_oid]
    )?;
    return Ok(());
}

/// Flags every lookup that follows or projects the given column as invalid.
/// Returns the OIDs of the invalidated columns.
pub fn invalidate_dependents_of_column(conn: &Connection, column_oid: i64, reason: &str) -> Result<Vec<i64>, error::Error> {
    let mut invalidated: Vec<i64> = Vec::new();
    for dependency in dependents_of_column(conn, column_oid)? {
        if invalidated.contains(&dependency.dependent_column_oid) {
            continue;
        }
        mark_invalid(conn, dependency.dependent_column_oid, reason)?;
        invalidated.push(dependency.dependent_column_oid);
    }
    if !invalidated.is_empty() {
        info!(column_oid, dependents = ?invalidated, reason, "invalidated dependent columns");
    }
    return Ok(invalidated);
}
