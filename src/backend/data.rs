use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use crate::backend::cell_value::{self, CellValue};
use crate::backend::column::{self, Metadata as ColumnMetadata};
use crate::backend::db::{self, Database};
use crate::backend::{dependency, sync, table};
use crate::util::config::EngineConfig;
use crate::util::error;

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
/// One row of a user-defined table.
pub struct Record {
    pub oid: i64,
    pub table_oid: i64,
    /// Values keyed by column name.
    pub data: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub search: Option<String>,
    /// 1-based.
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn page(page: usize, limit: usize) -> ListQuery {
        return ListQuery { search: None, page: Some(page), limit: Some(limit) };
    }

    pub fn search(search: impl Into<String>) -> ListQuery {
        return ListQuery { search: Some(search.into()), page: None, limit: None };
    }

    /// The non-empty search term, if any.
    pub fn search_term(&self) -> Option<&str> {
        return match &self.search {
            Some(s) if !s.trim().is_empty() => Some(s.trim()),
            _ => None
        };
    }

    /// The effective page number and page size.
    pub fn bounds(&self, config: &EngineConfig) -> (usize, usize) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self.limit.unwrap_or(config.default_page_limit).clamp(1, config.max_page_limit);
        return (page, limit);
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
/// A page of results with the total count of matching items.
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub pages: usize,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, page: usize, limit: usize, total: usize) -> Page<T> {
        return Page { items, page, limit, total, pages: total.div_ceil(limit) };
    }

    /// Cuts the requested page out of a fully materialized list.
    pub fn from_all(all: Vec<T>, page: usize, limit: usize) -> Page<T> {
        let total = all.len();
        let items: Vec<T> = all.into_iter().skip((page - 1).saturating_mul(limit)).take(limit).collect();
        return Page::new(items, page, limit, total);
    }

    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Page<U> {
        return Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            limit: self.limit,
            total: self.total,
            pages: self.pages,
        };
    }
}

const SELECT_RECORDS: &str = "SELECT OID, TABLE_OID, DATA, CREATED_AT, UPDATED_AT FROM RECORD";

fn from_row(row: &Row<'_>) -> Result<Record, error::Error> {
    let data: String = row.get("DATA")?;
    return Ok(Record {
        oid: row.get("OID")?,
        table_oid: row.get("TABLE_OID")?,
        data: serde_json::from_str(&data)?,
        created_at: row.get("CREATED_AT")?,
        updated_at: row.get("UPDATED_AT")?,
    });
}

/// Gets a record, or `None` if it does not exist.
pub fn find(conn: &Connection, record_oid: i64) -> Result<Option<Record>, error::Error> {
    let sql = format!("{SELECT_RECORDS} WHERE OID = ?1");
    let mut record: Option<Record> = None;
    db::query_iterate(conn, &sql, params![record_oid], &mut |row| {
        record = Some(from_row(row)?);
        return Ok(());
    })?;
    return Ok(record);
}

pub fn get_record(conn: &Connection, record_oid: i64) -> Result<Record, error::Error> {
    return match find(conn, record_oid)? {
        Some(r) => Ok(r),
        None => Err(error::Error::not_found(error::ResourceType::Record, record_oid))
    };
}

/// Gets a single record.
pub fn get(db: &Database, record_oid: i64) -> Result<Record, error::Error> {
    let conn = db.connect()?;
    return get_record(&conn, record_oid);
}

/// Loads every record of a table in creation order.
pub fn load_all(conn: &Connection, table_oid: i64) -> Result<Vec<Record>, error::Error> {
    let sql = format!("{SELECT_RECORDS} WHERE TABLE_OID = ?1 ORDER BY OID");
    let mut records: Vec<Record> = Vec::new();
    db::query_iterate(conn, &sql, params![table_oid], &mut |row| {
        records.push(from_row(row)?);
        return Ok(());
    })?;
    return Ok(records);
}

/// Lists the records of a table, optionally filtered by a case-insensitive search over every value.
pub fn list(db: &Database, table_oid: i64, query: &ListQuery) -> Result<Page<Record>, error::Error> {
    let conn = db.connect()?;
    table::ensure_exists(&conn, table_oid)?;
    return list_page(&conn, db.config(), table_oid, query);
}

pub fn list_page(conn: &Connection, config: &EngineConfig, table_oid: i64, query: &ListQuery) -> Result<Page<Record>, error::Error> {
    let (page, limit) = query.bounds(config);
    match query.search_term() {
        Some(term) => {
            let matching: Vec<Record> = load_all(conn, table_oid)?
                .into_iter()
                .filter(|r| cell_value::record_matches(&r.data, term))
                .collect();
            return Ok(Page::from_all(matching, page, limit));
        },
        None => {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM RECORD WHERE TABLE_OID = ?1",
                params![table_oid],
                |row| row.get(0)
            )?;
            let sql = format!("{SELECT_RECORDS} WHERE TABLE_OID = ?1 ORDER BY OID LIMIT ?2 OFFSET ?3");
            let mut items: Vec<Record> = Vec::new();
            let offset = i64::try_from((page - 1).saturating_mul(limit)).unwrap_or(i64::MAX);
            db::query_iterate(conn, &sql, params![table_oid, limit as i64, offset], &mut |row| {
                items.push(from_row(row)?);
                return Ok(());
            })?;
            return Ok(Page::new(items, page, limit, total as usize));
        }
    }
}

fn find_column<'a>(columns: &'a [ColumnMetadata], name: &str) -> Result<&'a ColumnMetadata, error::Error> {
    let column = match columns.iter().find(|c| c.name == name) {
        Some(c) => c,
        None => {
            return Err(error::Error::Validation(format!("unknown column '{name}'")));
        }
    };
    if column.is_computed() {
        return Err(error::Error::Validation(format!("column '{name}' is a lookup and cannot be written")));
    }
    return Ok(column);
}

/// Validates written values against the table's columns and converts them to their stored form.
/// `null` is kept as `null` so that a merge can tell a cleared value from an absent one.
fn normalize_write(conn: &Connection, columns: &[ColumnMetadata], data: &Map<String, Value>) -> Result<Map<String, Value>, error::Error> {
    let mut normalized: Map<String, Value> = Map::new();
    for (name, value) in data {
        let column = find_column(columns, name)?;
        let cell = match CellValue::from_json(value, &column.column_type) {
            Ok(c) => c,
            Err(reason) => {
                return Err(error::Error::Validation(format!("column '{name}': {reason}")));
            }
        };
        let stored = match cell {
            Some(c) => {
                // Linked values must reference existing records of the linked table
                if let Some(cfg) = column.column_type.linked_table_config() {
                    for id in c.linked_ids() {
                        let exists: Option<i64> = conn.query_row(
                            "SELECT OID FROM RECORD WHERE OID = ?1 AND TABLE_OID = ?2",
                            params![id, cfg.linked_table_id],
                            |row| row.get(0)
                        ).optional()?;
                        if exists.is_none() {
                            return Err(error::Error::DanglingReference(format!("column '{name}': record {id} does not exist in table {}", cfg.linked_table_id)));
                        }
                    }
                }
                c.to_json()
            },
            None => Value::Null
        };
        normalized.insert(name.clone(), stored);
    }
    return Ok(normalized);
}

/// Checks whether another record of the table holds the same non-null value under the given key.
/// Values are compared by JSON type and value inside SQLite.
pub fn value_taken(conn: &Connection, table_oid: i64, column_name: &str, value: &Value, except_record_oid: Option<i64>) -> Result<bool, error::Error> {
    if value.is_null() {
        return Ok(false);
    }
    let holder: Option<i64> = conn.query_row(
        "SELECT r.OID FROM RECORD r, json_each(r.DATA) e
        WHERE r.TABLE_OID = ?1 AND (?2 IS NULL OR r.OID <> ?2) AND e.key = ?3
            AND e.type = json_type(?4) AND e.value = json_extract(?4, '$')
        LIMIT 1",
        params![table_oid, except_record_oid, column_name, serde_json::to_string(value)?],
        |row| row.get(0)
    ).optional()?;
    return Ok(holder.is_some());
}

/// Fails if another record of the table already holds the value in a unique column.
fn ensure_unique(conn: &Connection, table_oid: i64, columns: &[ColumnMetadata], data: &Map<String, Value>, except_record_oid: Option<i64>) -> Result<(), error::Error> {
    for (name, value) in data {
        if !columns.iter().any(|c| &c.name == name && c.is_unique) {
            continue;
        }
        if value_taken(conn, table_oid, name, value, except_record_oid)? {
            return Err(error::Error::Validation(format!("column '{name}' is unique and value {value} already exists")));
        }
    }
    return Ok(());
}

/// Finds a non-null value held by more than one record of the table under the given key.
pub fn find_duplicate_value(conn: &Connection, table_oid: i64, column_name: &str) -> Result<Option<Value>, error::Error> {
    let holder: Option<i64> = conn.query_row(
        "SELECT MIN(r.OID) FROM RECORD r, json_each(r.DATA) e
        WHERE r.TABLE_OID = ?1 AND e.key = ?2 AND e.type <> 'null'
        GROUP BY e.type, e.value
        HAVING COUNT(*) > 1
        LIMIT 1",
        params![table_oid, column_name],
        |row| row.get(0)
    ).optional()?;
    return match holder {
        Some(record_oid) => Ok(get_record(conn, record_oid)?.data.get(column_name).cloned()),
        None => Ok(None)
    };
}

fn ensure_required(columns: &[ColumnMetadata], data: &Map<String, Value>, only_written: bool) -> Result<(), error::Error> {
    for column in columns.iter().filter(|c| c.is_required) {
        let value = data.get(&column.name);
        let missing = match value {
            Some(v) => v.is_null(),
            None => !only_written
        };
        if missing {
            return Err(error::Error::Validation(format!("column '{}' is required", column.name)));
        }
    }
    return Ok(());
}

/// Creates a record. Missing keys take the column's default value.
pub fn create(db: &Database, table_oid: i64, data: Map<String, Value>) -> Result<Record, error::Error> {
    let mut conn = db.connect()?;
    let trans = db::begin_write(&mut conn)?;
    table::ensure_exists(&trans, table_oid)?;
    let columns = column::list_for_table(&trans, table_oid)?;

    let mut stored = normalize_write(&trans, &columns, &data)?;
    for column in &columns {
        if let Some(default_value) = &column.default_value {
            let missing = match stored.get(&column.name) {
                Some(v) => v.is_null(),
                None => true
            };
            if missing {
                stored.insert(column.name.clone(), default_value.clone());
            }
        }
    }
    stored.retain(|_, v| !v.is_null());
    ensure_required(&columns, &stored, false)?;
    ensure_unique(&trans, table_oid, &columns, &stored, None)?;

    // Insert the record
    let now = db::now();
    trans.execute(
        "INSERT INTO RECORD (TABLE_OID, DATA, CREATED_AT, UPDATED_AT) VALUES (?1, ?2, ?3, ?3)",
        params![table_oid, serde_json::to_string(&stored)?, now]
    )?;
    let record_oid = trans.last_insert_rowid();
    let record = get_record(&trans, record_oid)?;

    // Commit the transaction
    trans.commit()?;
    debug!(table_oid, record_oid, "created record");
    return Ok(record);
}

/// Merges the given keys into a record. Keys that are not given are left untouched; `null` clears a value.
pub fn update(db: &Database, record_oid: i64, partial: Map<String, Value>) -> Result<Record, error::Error> {
    let mut conn = db.connect()?;
    let trans = db::begin_write(&mut conn)?;
    let mut record = get_record(&trans, record_oid)?;
    let columns = column::list_for_table(&trans, record.table_oid)?;

    let written = normalize_write(&trans, &columns, &partial)?;
    ensure_required(&columns, &written, true)?;
    ensure_unique(&trans, record.table_oid, &columns, &written, Some(record_oid))?;
    for (name, value) in written {
        if value.is_null() {
            record.data.remove(&name);
        } else {
            record.data.insert(name, value);
        }
    }

    trans.execute(
        "UPDATE RECORD SET DATA = ?1, UPDATED_AT = ?2 WHERE OID = ?3",
        params![serde_json::to_string(&record.data)?, db::now(), record_oid]
    )?;
    let record = get_record(&trans, record_oid)?;

    // Commit the transaction
    trans.commit()?;
    debug!(table_oid = record.table_oid, record_oid, "updated record");
    return Ok(record);
}

/// Deletes a record, then removes its id from linked columns that reference it.
pub fn delete(db: &Database, record_oid: i64) -> Result<(), error::Error> {
    let mut conn = db.connect()?;
    let trans = db::begin_write(&mut conn)?;
    let record = get_record(&trans, record_oid)?;
    trans.execute("DELETE FROM RECORD WHERE OID = ?1", params![record_oid])?;
    trans.commit()?;
    debug!(table_oid = record.table_oid, record_oid, "deleted record");

    // Best-effort cleanup; readers resolve leftover ids to null anyway
    match prune_links(&mut conn, record.table_oid, record_oid) {
        Ok(0) => {},
        Ok(pruned) => {
            info!(table_oid = record.table_oid, record_oid, pruned, "pruned links to deleted record");
        },
        Err(e) => {
            warn!(table_oid = record.table_oid, record_oid, error = %e, "failed to prune links to deleted record");
        }
    }
    return Ok(());
}

/// Removes a record id from every linked column that targets its table, including values
/// still stored under a name that a running rename has not yet migrated.
/// Returns the number of records rewritten.
pub fn prune_links(conn: &mut Connection, table_oid: i64, record_oid: i64) -> Result<usize, error::Error> {
    let trans = db::begin_write(conn)?;
    let mut pruned: usize = 0;
    for column_oid in dependency::linking_columns_to_table(&trans, table_oid)? {
        let column = column::get_metadata(&trans, column_oid)?;
        let allow_multiple = match column.column_type.linked_table_config() {
            Some(cfg) if cfg.linked_table_id == table_oid => cfg.allow_multiple,
            _ => { continue; }
        };
        let keys = sync::pending_keys(&trans, column.table_oid, &column.name)?;
        for mut record in load_all(&trans, column.table_oid)? {
            let mut changed = false;
            for key in &keys {
                let ids = match record.data.get(key) {
                    Some(v) => cell_value::linked_ids_of(v),
                    None => { continue; }
                };
                if !ids.contains(&record_oid) {
                    continue;
                }
                let remaining: Vec<i64> = ids.into_iter().filter(|id| *id != record_oid).collect();
                if remaining.is_empty() {
                    record.data.remove(key);
                } else if allow_multiple {
                    record.data.insert(key.clone(), Value::Array(remaining.into_iter().map(Value::from).collect()));
                } else {
                    record.data.insert(key.clone(), Value::from(remaining[0]));
                }
                changed = true;
            }
            if !changed {
                continue;
            }
            trans.execute(
                "UPDATE RECORD SET DATA = ?1, UPDATED_AT = ?2 WHERE OID = ?3",
                params![serde_json::to_string(&record.data)?, db::now(), record.oid]
            )?;
            pruned += 1;
        }
    }
    trans.commit()?;
    return Ok(pruned);
}
