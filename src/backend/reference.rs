use std::collections::HashMap;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use crate::backend::cell_value;
use crate::backend::column::{self, Metadata as ColumnMetadata};
use crate::backend::column_type::LinkedTableConfig;
use crate::backend::data::{self, ListQuery, Page, Record};
use crate::backend::db::Database;
use crate::backend::table;
use crate::util::error;

/// Label of a linked record that has no value to display.
pub const NO_DISPLAY_VALUE: &str = "— NO DISPLAY VALUE —";
/// Label of a linked id whose record no longer exists.
pub const DELETED_LABEL: &str = "— DELETED —";

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    /// At least one linked record no longer exists; its entry resolved to null.
    Dangling,
    /// The lookup's configuration no longer resolves.
    Invalid,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
/// The computed value of a lookup for one record.
pub struct ResolvedValue {
    pub value: Value,
    pub status: ResolutionStatus,
    pub reason: Option<String>,
}

impl ResolvedValue {
    fn invalid(reason: String) -> ResolvedValue {
        return ResolvedValue { value: Value::Null, status: ResolutionStatus::Invalid, reason: Some(reason) };
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
/// A record that can be chosen as the value of a linked or lookup column.
pub struct LinkOption {
    pub value: i64,
    pub label: String,
}

/// Records fetched while resolving one request, keyed by OID.
#[derive(Default)]
pub struct RecordCache {
    records: HashMap<i64, Option<Record>>,
}

impl RecordCache {
    pub fn new() -> RecordCache {
        return RecordCache::default();
    }

    /// Gets a record of the given table, or `None` if it does not exist (any more).
    pub fn get(&mut self, conn: &Connection, table_oid: i64, record_oid: i64) -> Result<Option<&Record>, error::Error> {
        if !self.records.contains_key(&record_oid) {
            let record = data::find(conn, record_oid)?;
            self.records.insert(record_oid, record);
        }
        return Ok(match self.records.get(&record_oid) {
            Some(Some(r)) if r.table_oid == table_oid => Some(r),
            _ => None
        });
    }

    /// Seeds the cache with records that were already loaded.
    pub fn extend(&mut self, records: &[Record]) {
        for record in records {
            self.records.insert(record.oid, Some(record.clone()));
        }
    }
}

/// How to label the records of a linked table.
pub struct LabelPlan {
    pub table_oid: i64,
    preferred: Vec<String>,
    fallback: Vec<String>,
}

impl LabelPlan {
    pub fn prepare(conn: &Connection, cfg: &LinkedTableConfig) -> Result<LabelPlan, error::Error> {
        let columns = column::list_for_table(conn, cfg.linked_table_id)?;
        let stored: Vec<&ColumnMetadata> = columns.iter().filter(|c| !c.is_computed()).collect();
        let preferred: Vec<String> = [cfg.display_column_id, cfg.linked_column_id]
            .into_iter()
            .flatten()
            .filter_map(|oid| stored.iter().find(|c| c.oid == oid).map(|c| c.name.clone()))
            .collect();
        return Ok(LabelPlan {
            table_oid: cfg.linked_table_id,
            preferred,
            fallback: stored.iter().map(|c| c.name.clone()).collect(),
        });
    }

    /// The display column, then the linked column, then the first non-empty value by column order.
    pub fn label(&self, record: &Record) -> String {
        for name in self.preferred.iter().chain(self.fallback.iter()) {
            if let Some(label) = record.data.get(name).and_then(cell_value::display_json) {
                if !label.trim().is_empty() {
                    return label;
                }
            }
        }
        return NO_DISPLAY_VALUE.to_string();
    }

    /// Labels a linked id, or `None` when the record no longer exists.
    pub fn label_for(&self, conn: &Connection, cache: &mut RecordCache, record_oid: i64) -> Result<Option<String>, error::Error> {
        return Ok(cache.get(conn, self.table_oid, record_oid)?.map(|r| self.label(r)));
    }
}

/// A lookup column prepared for resolution against many records.
pub enum LookupPlan {
    Ready {
        link_column: String,
        allow_multiple: bool,
        target_table_oid: i64,
        target_column: String,
    },
    Invalid(String),
}

impl LookupPlan {
    /// Resolves the lookup's configuration against the current schema.
    /// Anything that no longer resolves yields an invalid plan rather than an error.
    pub fn prepare(conn: &Connection, lookup: &ColumnMetadata) -> Result<LookupPlan, error::Error> {
        if lookup.is_invalid {
            return Ok(LookupPlan::Invalid(lookup.invalid_reason.clone().unwrap_or_else(|| "lookup column is invalid".into())));
        }
        let cfg = match lookup.column_type.lookup_config() {
            Some(cfg) => cfg,
            None => {
                return Ok(LookupPlan::Invalid(format!("column '{}' is not a lookup", lookup.name)));
            }
        };

        // The linked column followed on the lookup's own table
        let link = match cfg.link_column_id {
            Some(oid) => optional_column(conn, oid)?,
            None => None
        };
        let (link_column, allow_multiple) = match &link {
            Some(c) if c.table_oid == lookup.table_oid => match c.column_type.linked_table_config() {
                Some(link_cfg) if link_cfg.linked_table_id == cfg.linked_table_id => (c.name.clone(), link_cfg.allow_multiple),
                _ => {
                    return Ok(LookupPlan::Invalid(format!("column '{}' no longer links to table {}", c.name, cfg.linked_table_id)));
                }
            },
            _ => {
                return Ok(LookupPlan::Invalid("the linked column of this lookup no longer exists".into()));
            }
        };

        // The projected column on the target table, by its current name
        let target = match optional_column(conn, cfg.lookup_column_id)? {
            Some(c) if c.table_oid == cfg.linked_table_id && !c.is_computed() => c,
            Some(c) => {
                return Ok(LookupPlan::Invalid(format!("column '{}' can no longer be projected", c.name)));
            },
            None => {
                return Ok(LookupPlan::Invalid(format!("projected column '{}' no longer exists", cfg.lookup_column_name)));
            }
        };
        if !table::exists(conn, cfg.linked_table_id)? {
            return Ok(LookupPlan::Invalid(format!("table {} no longer exists", cfg.linked_table_id)));
        }

        return Ok(LookupPlan::Ready {
            link_column,
            allow_multiple,
            target_table_oid: cfg.linked_table_id,
            target_column: target.name,
        });
    }

    /// Computes the lookup's value for a record: a single value, or an ordered list when
    /// the linked column allows multiple records. Deleted records resolve to null.
    pub fn resolve(&self, conn: &Connection, cache: &mut RecordCache, record: &Record) -> Result<ResolvedValue, error::Error> {
        let (link_column, allow_multiple, target_table_oid, target_column) = match self {
            LookupPlan::Ready { link_column, allow_multiple, target_table_oid, target_column } => (link_column, *allow_multiple, *target_table_oid, target_column),
            LookupPlan::Invalid(reason) => {
                return Ok(ResolvedValue::invalid(reason.clone()));
            }
        };

        let ids = match record.data.get(link_column) {
            Some(v) => cell_value::linked_ids_of(v),
            None => Vec::new()
        };
        let mut values: Vec<Value> = Vec::with_capacity(ids.len());
        let mut missing: Vec<i64> = Vec::new();
        for id in ids {
            match cache.get(conn, target_table_oid, id)? {
                Some(target) => {
                    values.push(target.data.get(target_column).cloned().unwrap_or(Value::Null));
                },
                None => {
                    values.push(Value::Null);
                    missing.push(id);
                }
            }
        }

        let value = if allow_multiple {
            Value::Array(values)
        } else {
            values.into_iter().next().unwrap_or(Value::Null)
        };
        if missing.is_empty() {
            return Ok(ResolvedValue { value, status: ResolutionStatus::Resolved, reason: None });
        }
        let ids: Vec<String> = missing.iter().map(|id| id.to_string()).collect();
        return Ok(ResolvedValue {
            value,
            status: ResolutionStatus::Dangling,
            reason: Some(format!("linked record(s) {} no longer exist", ids.join(", "))),
        });
    }
}

fn optional_column(conn: &Connection, column_oid: i64) -> Result<Option<ColumnMetadata>, error::Error> {
    return match column::get_metadata(conn, column_oid) {
        Ok(c) => Ok(Some(c)),
        Err(error::Error::NotFound { .. }) => Ok(None),
        Err(e) => Err(e)
    };
}

/// Computes the value of a lookup column for one record.
pub fn resolve_lookup(db: &Database, record_oid: i64, column_oid: i64) -> Result<ResolvedValue, error::Error> {
    let conn = db.connect()?;
    let record = data::get_record(&conn, record_oid)?;
    let lookup = column::get_metadata(&conn, column_oid)?;
    if !lookup.is_computed() {
        return Err(error::Error::Validation(format!("column '{}' is not a lookup", lookup.name)));
    }
    if lookup.table_oid != record.table_oid {
        return Err(error::Error::Validation(format!("record {record_oid} does not belong to the table of column '{}'", lookup.name)));
    }
    let plan = LookupPlan::prepare(&conn, &lookup)?;
    let mut cache = RecordCache::new();
    return plan.resolve(&conn, &mut cache, &record);
}

/// Lists the records that can be chosen for a linked column, labelled for display.
pub fn list_linked_options(db: &Database, column_oid: i64, query: &ListQuery) -> Result<Page<LinkOption>, error::Error> {
    let conn = db.connect()?;
    let linked = column::get_metadata(&conn, column_oid)?;
    let cfg = match linked.column_type.linked_table_config() {
        Some(cfg) => cfg,
        None => {
            return Err(error::Error::Validation("column is not a linked table type".into()));
        }
    };
    table::ensure_exists(&conn, cfg.linked_table_id)?;
    let plan = LabelPlan::prepare(&conn, cfg)?;

    let needle = query.search_term().map(|s| s.to_lowercase());
    let options: Vec<LinkOption> = data::load_all(&conn, cfg.linked_table_id)?
        .into_iter()
        .filter_map(|record| {
            let label = plan.label(&record);
            let matches = match &needle {
                Some(n) => label.to_lowercase().contains(n) || cell_value::record_matches(&record.data, n),
                None => true
            };
            if matches {
                Some(LinkOption { value: record.oid, label })
            } else {
                None
            }
        })
        .collect();
    let (page, limit) = query.bounds(db.config());
    return Ok(Page::from_all(options, page, limit));
}

/// Lists the records of a lookup's target table labelled by the projected column.
/// The search applies to the projected column only.
pub fn list_lookup_options(db: &Database, column_oid: i64, query: &ListQuery) -> Result<Page<LinkOption>, error::Error> {
    let conn = db.connect()?;
    let lookup = column::get_metadata(&conn, column_oid)?;
    if !lookup.is_computed() {
        return Err(error::Error::Validation("column is not a lookup type".into()));
    }
    let (target_table_oid, target_column) = match LookupPlan::prepare(&conn, &lookup)? {
        LookupPlan::Ready { target_table_oid, target_column, .. } => (target_table_oid, target_column),
        LookupPlan::Invalid(reason) => {
            return Err(error::Error::DanglingReference(reason));
        }
    };

    let needle = query.search_term().map(|s| s.to_lowercase());
    let options: Vec<LinkOption> = data::load_all(&conn, target_table_oid)?
        .into_iter()
        .filter_map(|record| {
            let value = record.data.get(&target_column).and_then(cell_value::display_json);
            let matches = match (&needle, &value) {
                (Some(n), Some(v)) => v.to_lowercase().contains(n),
                (Some(_), None) => false,
                (None, _) => true
            };
            if !matches {
                return None;
            }
            let label = match value {
                Some(v) if !v.trim().is_empty() => v,
                _ => NO_DISPLAY_VALUE.to_string()
            };
            return Some(LinkOption { value: record.oid, label });
        })
        .collect();
    let (page, limit) = query.bounds(db.config());
    return Ok(Page::from_all(options, page, limit));
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};
    use super::*;

    fn record(data: Value) -> Record {
        let data: Map<String, Value> = match data {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        Record { oid: 1, table_oid: 2, data, created_at: 0, updated_at: 0 }
    }

    fn plan(preferred: &[&str], fallback: &[&str]) -> LabelPlan {
        LabelPlan {
            table_oid: 2,
            preferred: preferred.iter().map(|s| s.to_string()).collect(),
            fallback: fallback.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn label_prefers_the_display_column() {
        let p = plan(&["Title"], &["Code", "Title"]);
        assert_eq!(p.label(&record(json!({"Code": "C-1", "Title": "Widget"}))), "Widget");
    }

    #[test]
    fn label_falls_back_to_first_non_empty_field() {
        let p = plan(&["Title"], &["Code", "Qty"]);
        assert_eq!(p.label(&record(json!({"Title": "  ", "Qty": 3}))), "3");
        assert_eq!(p.label(&record(json!({}))), NO_DISPLAY_VALUE);
    }

    #[test]
    fn invalid_plan_resolves_to_flagged_null() {
        let conn = Connection::open_in_memory().unwrap();
        let plan = LookupPlan::Invalid("column 'Price' was deleted".into());
        let resolved = plan.resolve(&conn, &mut RecordCache::new(), &record(json!({"Item": 4}))).unwrap();
        assert_eq!(resolved.value, Value::Null);
        assert_eq!(resolved.status, ResolutionStatus::Invalid);
    }
}
