use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use crate::backend::cell_value::CellValue;
use crate::backend::coerce::{self, Coercion};
use crate::backend::column_type::{ColumnType, ColumnTypeParts, DataType, LinkedTableConfig, LookupConfig, RatingConfig, SelectConfig};
use crate::backend::db::{self, Database};
use crate::backend::dependency::{self, DependencyKind};
use crate::backend::sync::{self, JobHandle, SyncStep};
use crate::backend::{data, lease, table};
use crate::util::config::CoercionPolicy;
use crate::util::error;

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Metadata of a table column.
pub struct Metadata {
    pub oid: i64,
    pub table_oid: i64,
    pub name: String,
    #[serde(flatten)]
    pub column_type: ColumnType,
    #[serde(rename = "order")]
    pub column_ordering: i64,
    pub is_required: bool,
    pub is_unique: bool,
    pub default_value: Option<Value>,
    pub is_invalid: bool,
    pub invalid_reason: Option<String>,
}

impl Metadata {
    pub fn data_type(&self) -> DataType {
        return self.column_type.data_type();
    }

    pub fn is_computed(&self) -> bool {
        return self.column_type.is_computed();
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// The definition of a column to be created.
pub struct ColumnSpec {
    pub name: String,
    #[serde(flatten)]
    pub column_type: ColumnType,
    /// Position among the table's columns; appended at the end when absent.
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> ColumnSpec {
        return ColumnSpec {
            name: name.into(),
            column_type,
            order: None,
            is_required: false,
            is_unique: false,
            default_value: None,
        };
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
/// A partial change to a column. Absent fields are left unchanged.
pub struct ColumnUpdate {
    pub name: Option<String>,
    pub data_type: Option<DataType>,
    pub select_config: Option<SelectConfig>,
    pub linked_table_config: Option<LinkedTableConfig>,
    pub lookup_config: Option<LookupConfig>,
    pub rating_config: Option<RatingConfig>,
    pub is_required: Option<bool>,
    pub is_unique: Option<bool>,
    /// Overrides the configured coercion policy for this change only.
    pub coercion_policy: Option<CoercionPolicy>,
}

impl ColumnUpdate {
    fn changes_type(&self) -> bool {
        return self.data_type.is_some()
            || self.select_config.is_some()
            || self.linked_table_config.is_some()
            || self.lookup_config.is_some()
            || self.rating_config.is_some();
    }
}

#[derive(Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ColumnOrder {
    pub column_id: i64,
    pub order: i64,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// The result of a schema mutation: the column as committed plus the job synchronizing its records, if any.
pub struct ColumnMutation {
    pub column: Metadata,
    pub job: Option<JobHandle>,
}

const SELECT_COLUMNS: &str = "SELECT OID, TABLE_OID, NAME, DATA_TYPE, CONFIG, COLUMN_ORDERING, IS_REQUIRED, IS_UNIQUE, DEFAULT_VALUE, IS_INVALID, INVALID_REASON FROM METADATA_TABLE_COLUMN";

fn from_row(row: &Row<'_>) -> Result<Metadata, error::Error> {
    let data_type: String = row.get("DATA_TYPE")?;
    let config: Option<String> = row.get("CONFIG")?;
    let default_value: Option<String> = row.get("DEFAULT_VALUE")?;
    let default_value = match default_value {
        Some(s) => Some(serde_json::from_str::<Value>(&s)?),
        None => None
    };
    return Ok(Metadata {
        oid: row.get("OID")?,
        table_oid: row.get("TABLE_OID")?,
        name: row.get("NAME")?,
        column_type: ColumnType::from_database(&data_type, config.as_deref())?,
        column_ordering: row.get("COLUMN_ORDERING")?,
        is_required: row.get("IS_REQUIRED")?,
        is_unique: row.get("IS_UNIQUE")?,
        default_value,
        is_invalid: row.get("IS_INVALID")?,
        invalid_reason: row.get("INVALID_REASON")?,
    });
}

/// Gets the metadata of a single column.
pub fn get_metadata(conn: &Connection, column_oid: i64) -> Result<Metadata, error::Error> {
    let sql = format!("{SELECT_COLUMNS} WHERE OID = ?1");
    let mut column: Option<Metadata> = None;
    db::query_iterate(conn, &sql, params![column_oid], &mut |row| {
        column = Some(from_row(row)?);
        return Ok(());
    })?;
    return match column {
        Some(c) => Ok(c),
        None => Err(error::Error::not_found(error::ResourceType::Column, column_oid))
    };
}

/// Gets the metadata of a single column.
pub fn get(db: &Database, column_oid: i64) -> Result<Metadata, error::Error> {
    let conn = db.connect()?;
    return get_metadata(&conn, column_oid);
}

/// Lists the columns of a table in display order.
pub fn list_for_table(conn: &Connection, table_oid: i64) -> Result<Vec<Metadata>, error::Error> {
    let sql = format!("{SELECT_COLUMNS} WHERE TABLE_OID = ?1 ORDER BY COLUMN_ORDERING, OID");
    let mut columns: Vec<Metadata> = Vec::new();
    db::query_iterate(conn, &sql, params![table_oid], &mut |row| {
        columns.push(from_row(row)?);
        return Ok(());
    })?;
    return Ok(columns);
}

/// Lists the columns of a table in display order.
pub fn list(db: &Database, table_oid: i64) -> Result<Vec<Metadata>, error::Error> {
    let conn = db.connect()?;
    table::ensure_exists(&conn, table_oid)?;
    return list_for_table(&conn, table_oid);
}

fn normalize_name(name: &str) -> Result<String, error::Error> {
    let name = name.trim();
    if name.is_empty() {
        return Err(error::Error::Validation("column name cannot be empty".into()));
    }
    return Ok(name.to_string());
}

/// Fails with `DuplicateColumnName` if another column of the table already has the name.
fn ensure_name_free(conn: &Connection, table_oid: i64, name: &str, except_column_oid: Option<i64>) -> Result<(), error::Error> {
    let existing: Option<i64> = conn.query_row(
        "SELECT OID FROM METADATA_TABLE_COLUMN WHERE TABLE_OID = ?1 AND NAME = ?2",
        params![table_oid, name],
        |row| row.get(0)
    ).optional()?;
    return match existing {
        Some(oid) if Some(oid) != except_column_oid => Err(error::Error::DuplicateColumnName { table_oid, name: name.to_string() }),
        _ => Ok(())
    };
}

/// Checks a column type against the current schema and fills in derived configuration.
fn validate_type(conn: &Connection, table_oid: i64, column_oid: Option<i64>, column_type: ColumnType) -> Result<ColumnType, error::Error> {
    match column_type {
        ColumnType::LinkedTable(cfg) => {
            table::ensure_exists(conn, cfg.linked_table_id)?;
            for referenced in [cfg.linked_column_id, cfg.display_column_id].into_iter().flatten() {
                let target = get_metadata(conn, referenced)?;
                if target.table_oid != cfg.linked_table_id {
                    return Err(error::Error::Validation(format!("column {referenced} does not belong to linked table {}", cfg.linked_table_id)));
                }
            }
            return Ok(ColumnType::LinkedTable(cfg));
        },
        ColumnType::Lookup(mut cfg) => {
            table::ensure_exists(conn, cfg.linked_table_id)?;

            // The projected column must be a stored column of the target table
            let target = get_metadata(conn, cfg.lookup_column_id)?;
            if target.table_oid != cfg.linked_table_id {
                return Err(error::Error::Validation(format!("lookup column {} does not belong to table {}", cfg.lookup_column_id, cfg.linked_table_id)));
            }
            if target.is_computed() {
                return Err(error::Error::Validation("a lookup cannot project another lookup column".into()));
            }
            cfg.lookup_column_name = target.name;

            // Resolve the linked column that is followed
            let link_column_oid = match cfg.link_column_id {
                Some(oid) => {
                    let link = get_metadata(conn, oid)?;
                    let links_to_target = match link.column_type.linked_table_config() {
                        Some(link_cfg) => link_cfg.linked_table_id == cfg.linked_table_id,
                        None => false
                    };
                    if link.table_oid != table_oid || !links_to_target {
                        return Err(error::Error::Validation(format!("column {oid} is not a linked column of this table targeting table {}", cfg.linked_table_id)));
                    }
                    oid
                },
                None => {
                    let candidate = list_for_table(conn, table_oid)?.into_iter()
                        .filter(|c| Some(c.oid) != column_oid)
                        .find(|c| match c.column_type.linked_table_config() {
                            Some(link_cfg) => link_cfg.linked_table_id == cfg.linked_table_id,
                            None => false
                        });
                    match candidate {
                        Some(c) => c.oid,
                        None => {
                            return Err(error::Error::Validation(format!("no linked column of this table links to table {}", cfg.linked_table_id)));
                        }
                    }
                }
            };
            cfg.link_column_id = Some(link_column_oid);
            return Ok(ColumnType::Lookup(cfg));
        },
        other => {
            return Ok(other);
        }
    }
}

/// Normalizes a default value for a column type.
fn validate_default(default_value: Option<Value>, column_type: &ColumnType) -> Result<Option<Value>, error::Error> {
    let value = match default_value {
        Some(v) if !v.is_null() => v,
        _ => { return Ok(None); }
    };
    if column_type.is_computed() || column_type.linked_table_config().is_some() {
        return Err(error::Error::Validation(format!("{} columns cannot have a default value", column_type.data_type())));
    }
    return match CellValue::from_json(&value, column_type) {
        Ok(Some(v)) => Ok(Some(v.to_json())),
        Ok(None) => Ok(None),
        Err(reason) => Err(error::Error::Validation(format!("invalid default value: {reason}")))
    };
}

fn default_to_database(default_value: &Option<Value>) -> Result<Option<String>, error::Error> {
    return Ok(match default_value {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None
    });
}

/// Creates a new column in a table.
pub fn create(db: &Database, table_oid: i64, spec: ColumnSpec) -> Result<Metadata, error::Error> {
    let name = normalize_name(&spec.name)?;

    let mut conn = db.connect()?;
    let trans = db::begin_write(&mut conn)?;
    table::ensure_exists(&trans, table_oid)?;
    lease::ensure_free(&trans, table_oid)?;
    ensure_name_free(&trans, table_oid, &name, None)?;

    let column_type = validate_type(&trans, table_oid, None, spec.column_type)?;
    let default_value = validate_default(spec.default_value, &column_type)?;
    if column_type.is_computed() && (spec.is_required || spec.is_unique) {
        return Err(error::Error::Validation("lookup columns cannot be required or unique".into()));
    }

    let column_ordering: i64 = match spec.order {
        Some(o) => {
            // If an explicit ordering was given, shift every column to its right by 1 in order to make space
            trans.execute(
                "UPDATE METADATA_TABLE_COLUMN SET COLUMN_ORDERING = COLUMN_ORDERING + 1 WHERE TABLE_OID = ?1 AND COLUMN_ORDERING >= ?2",
                params![table_oid, o]
            )?;
            o
        },
        None => {
            // If no explicit ordering was given, insert at the back
            trans.query_row(
                "SELECT COALESCE(MAX(COLUMN_ORDERING) + 1, 0) FROM METADATA_TABLE_COLUMN WHERE TABLE_OID = ?1",
                params![table_oid],
                |row| row.get::<_, i64>(0)
            )?
        }
    };

    // Add the column to the table's metadata
    trans.execute(
        "INSERT INTO METADATA_TABLE_COLUMN (TABLE_OID, NAME, DATA_TYPE, CONFIG, COLUMN_ORDERING, IS_REQUIRED, IS_UNIQUE, DEFAULT_VALUE) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            table_oid,
            name,
            column_type.data_type().as_str(),
            column_type.config_to_database()?,
            column_ordering,
            spec.is_required,
            spec.is_unique,
            default_to_database(&default_value)?
        ]
    )?;
    let column_oid = trans.last_insert_rowid();

    // Record what the new column depends on
    dependency::register(&trans, table_oid, column_oid, &column_type)?;

    let column = get_metadata(&trans, column_oid)?;
    trans.commit()?;
    info!(table_oid, column_oid, name = %column.name, data_type = %column.data_type(), "created column");
    return Ok(column);
}

/// Renames a column. Records are migrated to the new key by a synchronization job.
pub fn rename(db: &Database, column_oid: i64, new_name: &str) -> Result<ColumnMutation, error::Error> {
    return update(db, column_oid, ColumnUpdate {
        name: Some(new_name.to_string()),
        ..ColumnUpdate::default()
    });
}

/// Changes the type of a column. Stored values are converted by a synchronization job.
pub fn change_type(db: &Database, column_oid: i64, column_type: ColumnType, coercion_policy: Option<CoercionPolicy>) -> Result<ColumnMutation, error::Error> {
    let mut changes = ColumnUpdate {
        data_type: Some(column_type.data_type()),
        coercion_policy,
        ..ColumnUpdate::default()
    };
    match column_type {
        ColumnType::SingleSelect(cfg) | ColumnType::MultiSelect(cfg) => { changes.select_config = Some(cfg); },
        ColumnType::LinkedTable(cfg) => { changes.linked_table_config = Some(cfg); },
        ColumnType::Lookup(cfg) => { changes.lookup_config = Some(cfg); },
        ColumnType::Rating(cfg) => { changes.rating_config = Some(cfg); },
        _ => {}
    }
    return update(db, column_oid, changes);
}

/// Applies a partial change to a column.
///
/// Structural problems are rejected before anything is written. A rename and a
/// retype in the same request become one job with two ordered steps.
pub fn update(db: &Database, column_oid: i64, changes: ColumnUpdate) -> Result<ColumnMutation, error::Error> {
    let mut conn = db.connect()?;
    let trans = db::begin_write(&mut conn)?;
    let current = get_metadata(&trans, column_oid)?;
    let table_oid = current.table_oid;
    lease::ensure_free(&trans, table_oid)?;

    let mut steps: Vec<SyncStep> = Vec::new();

    // Name
    let name = match &changes.name {
        Some(n) => normalize_name(n)?,
        None => current.name.clone()
    };
    let renamed = name != current.name;
    if renamed {
        ensure_name_free(&trans, table_oid, &name, Some(column_oid))?;
        if !current.is_computed() {
            steps.push(SyncStep::Rename { from: current.name.clone(), to: name.clone() });
        }
    }

    // Type
    let mut column_type = current.column_type.clone();
    let mut is_invalid = current.is_invalid;
    let mut invalid_reason = current.invalid_reason.clone();
    if changes.changes_type() {
        let data_type = changes.data_type.unwrap_or(current.data_type());
        let requested = ColumnType::from_parts(ColumnTypeParts {
            data_type,
            select_config: changes.select_config.clone().or_else(|| current.column_type.select_config().cloned()),
            linked_table_config: changes.linked_table_config.clone().or_else(|| current.column_type.linked_table_config().cloned()),
            lookup_config: changes.lookup_config.clone().or_else(|| current.column_type.lookup_config().cloned()),
            rating_config: changes.rating_config.clone().or_else(|| current.column_type.rating_config().cloned()),
        })?;
        column_type = validate_type(&trans, table_oid, Some(column_oid), requested)?;

        // A configuration that resolves makes an invalid column valid again
        is_invalid = false;
        invalid_reason = None;
    }
    let retyped = column_type != current.column_type;
    if retyped && !current.is_computed() {
        let policy = changes.coercion_policy.unwrap_or(db.config().coercion_policy);
        steps.push(SyncStep::Retype {
            column: name.clone(),
            from: current.column_type.clone(),
            to: column_type.clone(),
            policy,
        });
        if policy == CoercionPolicy::Strict {
            let failures = sync::dry_run(&trans, table_oid, &steps)?;
            if !failures.is_empty() {
                warn!(column_oid, failures = failures.len(), "rejected type change under strict coercion policy");
                return Err(error::Error::Coercion { column: name, to: column_type.data_type(), failures });
            }
        }
    }

    // Constraints
    let is_required = changes.is_required.unwrap_or(current.is_required);
    let is_unique = changes.is_unique.unwrap_or(current.is_unique);
    if column_type.is_computed() && (is_required || is_unique) {
        return Err(error::Error::Validation("lookup columns cannot be required or unique".into()));
    }
    if is_unique && !current.is_unique {
        if let Some(duplicate) = data::find_duplicate_value(&trans, table_oid, &current.name)? {
            return Err(error::Error::Validation(format!("column '{}' cannot be unique: value {duplicate} appears more than once", current.name)));
        }
    }

    // The default follows the new type
    let default_value = match (&current.default_value, retyped) {
        (Some(v), true) => match coerce::coerce(v, &current.column_type, &column_type) {
            Coercion::Keep => Some(v.clone()),
            Coercion::Replace(r) if !r.is_null() => Some(r),
            _ => None
        },
        (v, _) => v.clone()
    };

    // Commit the metadata change
    trans.execute(
        "UPDATE METADATA_TABLE_COLUMN SET NAME = ?1, DATA_TYPE = ?2, CONFIG = ?3, IS_REQUIRED = ?4, IS_UNIQUE = ?5, DEFAULT_VALUE = ?6, IS_INVALID = ?7, INVALID_REASON = ?8 WHERE OID = ?9",
        params![
            name,
            column_type.data_type().as_str(),
            column_type.config_to_database()?,
            is_required,
            is_unique,
            default_to_database(&default_value)?,
            is_invalid,
            invalid_reason,
            column_oid
        ]
    )?;

    // Keep the reverse dependency index and the dependents in agreement
    if changes.changes_type() {
        dependency::register(&trans, table_oid, column_oid, &column_type)?;
    }
    if renamed {
        refresh_lookup_names(&trans, column_oid, &name)?;
    }
    if retyped {
        revalidate_dependents(&trans, column_oid, &name, &column_type)?;
    }

    // Hand the records over to the synchronization engine
    let job = if steps.is_empty() {
        None
    } else {
        Some(sync::enqueue(&trans, table_oid, &steps)?)
    };

    let column = get_metadata(&trans, column_oid)?;
    trans.commit()?;
    info!(
        table_oid,
        column_oid,
        name = %column.name,
        data_type = %column.data_type(),
        job_oid = job.map(|j| j.job_oid),
        "updated column"
    );
    if let Some(handle) = job {
        sync::start(db, handle);
    }
    return Ok(ColumnMutation { column, job });
}

/// Stores the new name of a projected column in the configuration of the lookups that project it.
fn refresh_lookup_names(conn: &Connection, column_oid: i64, new_name: &str) -> Result<(), error::Error> {
    for dependent in dependency::dependents_of_column(conn, column_oid)? {
        if dependent.kind != DependencyKind::LookupTarget {
            continue;
        }
        let lookup = get_metadata(conn, dependent.dependent_column_oid)?;
        if let ColumnType::Lookup(mut cfg) = lookup.column_type {
            cfg.lookup_column_name = new_name.to_string();
            conn.execute(
                "UPDATE METADATA_TABLE_COLUMN SET CONFIG = ?1 WHERE OID = ?2",
                params![serde_json::to_string(&cfg)?, lookup.oid]
            )?;
        }
    }
    return Ok(());
}

/// Flags the lookups that can no longer follow or project a column after it changed type.
fn revalidate_dependents(conn: &Connection, column_oid: i64, name: &str, column_type: &ColumnType) -> Result<(), error::Error> {
    for dependent in dependency::dependents_of_column(conn, column_oid)? {
        let lookup = get_metadata(conn, dependent.dependent_column_oid)?;
        let cfg = match lookup.column_type.lookup_config() {
            Some(cfg) => cfg,
            None => { continue; }
        };
        let reason = match dependent.kind {
            DependencyKind::LookupSource => match column_type.linked_table_config() {
                Some(link_cfg) if link_cfg.linked_table_id == cfg.linked_table_id => None,
                _ => Some(format!("linked column '{name}' no longer links to table {}", cfg.linked_table_id))
            },
            DependencyKind::LookupTarget if column_type.is_computed() => Some(format!("projected column '{name}' is now a lookup")),
            _ => None
        };
        if let Some(reason) = reason {
            dependency::mark_invalid(conn, lookup.oid, &reason)?;
            info!(column_oid = lookup.oid, reason = %reason, "invalidated lookup column");
        }
    }
    return Ok(());
}

/// Deletes a column. Its values are removed from the records by a synchronization job.
pub fn delete(db: &Database, column_oid: i64) -> Result<ColumnMutation, error::Error> {
    let mut conn = db.connect()?;
    let trans = db::begin_write(&mut conn)?;
    let column = get_metadata(&trans, column_oid)?;
    let table_oid = column.table_oid;
    lease::ensure_free(&trans, table_oid)?;

    // Lookups elsewhere that follow or project this column can no longer resolve
    dependency::invalidate_dependents_of_column(&trans, column_oid, &format!("column '{}' was deleted", column.name))?;
    dependency::clear_targeting_column(&trans, column_oid)?;

    // Delete the column and close the gap in the ordering
    trans.execute("DELETE FROM METADATA_TABLE_COLUMN WHERE OID = ?1", params![column_oid])?;
    trans.execute(
        "UPDATE METADATA_TABLE_COLUMN SET COLUMN_ORDERING = COLUMN_ORDERING - 1 WHERE TABLE_OID = ?1 AND COLUMN_ORDERING > ?2",
        params![table_oid, column.column_ordering]
    )?;

    let job = if column.is_computed() {
        None
    } else {
        Some(sync::enqueue(&trans, table_oid, &[SyncStep::Delete { column: column.name.clone() }])?)
    };
    trans.commit()?;
    info!(table_oid, column_oid, name = %column.name, job_oid = job.map(|j| j.job_oid), "deleted column");

    if let Some(handle) = job {
        sync::start(db, handle);
    }
    return Ok(ColumnMutation { column, job });
}

/// Moves columns of a table to new positions. Metadata only.
pub fn reorder(db: &Database, table_oid: i64, orders: &[ColumnOrder]) -> Result<Vec<Metadata>, error::Error> {
    let mut conn = db.connect()?;
    let trans = db::begin_write(&mut conn)?;
    table::ensure_exists(&trans, table_oid)?;
    for order in orders {
        let changed = trans.execute(
            "UPDATE METADATA_TABLE_COLUMN SET COLUMN_ORDERING = ?1 WHERE OID = ?2 AND TABLE_OID = ?3",
            params![order.order, order.column_id, table_oid]
        )?;
        if changed == 0 {
            return Err(error::Error::not_found(error::ResourceType::Column, order.column_id));
        }
    }
    let columns = list_for_table(&trans, table_oid)?;
    trans.commit()?;
    info!(table_oid, moved = orders.len(), "reordered columns");
    return Ok(columns);
}
