use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use crate::backend::cell_value::{self, CellValue};
use crate::backend::column::{self, Metadata as ColumnMetadata};
use crate::backend::column_type::ColumnType;
use crate::backend::data::{self, ListQuery, Page, Record};
use crate::backend::db::Database;
use crate::backend::reference::{self, LabelPlan, LookupPlan, RecordCache, ResolutionStatus};
use crate::backend::table::{self, BasicMetadata};
use crate::util::error;

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub column_oid: i64,
    /// The stored value, or the computed value of a lookup.
    pub true_value: Value,
    pub display_value: Option<String>,
    /// Set for lookup cells.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ResolutionStatus>,
    pub failed_validations: Vec<error::FailedValidation>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RowView {
    pub oid: i64,
    pub data: Map<String, Value>,
    /// One cell per column, in column order.
    pub cells: Vec<Cell>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RowView {
    pub fn cell(&self, column_oid: i64) -> Option<&Cell> {
        return self.cells.iter().find(|c| c.column_oid == column_oid);
    }
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// A page of a table ready for display.
pub struct TableView {
    pub table: BasicMetadata,
    pub columns: Vec<ColumnMetadata>,
    pub records: Page<RowView>,
}

enum ColumnPlan {
    Stored,
    Linked(LabelPlan),
    Lookup(LookupPlan),
}

/// Gets a page of records with every cell resolved for display, lookups included.
pub fn get_table_view(db: &Database, table_oid: i64, query: &ListQuery) -> Result<TableView, error::Error> {
    let conn = db.connect()?;
    let table = table::get_basic(&conn, table_oid)?;
    let columns = column::list_for_table(&conn, table_oid)?;
    let page = data::list_page(&conn, db.config(), table_oid, query)?;

    // Resolve every linked and lookup column once for the whole page
    let mut plans: Vec<ColumnPlan> = Vec::with_capacity(columns.len());
    for column in &columns {
        plans.push(match &column.column_type {
            ColumnType::LinkedTable(cfg) => {
                if table::exists(&conn, cfg.linked_table_id)? {
                    ColumnPlan::Linked(LabelPlan::prepare(&conn, cfg)?)
                } else {
                    ColumnPlan::Stored
                }
            },
            ColumnType::Lookup(_) => ColumnPlan::Lookup(LookupPlan::prepare(&conn, column)?),
            _ => ColumnPlan::Stored
        });
    }

    let mut cache = RecordCache::new();
    let mut rows: Vec<RowView> = Vec::with_capacity(page.items.len());
    for record in &page.items {
        let mut cells: Vec<Cell> = Vec::with_capacity(columns.len());
        for (column, plan) in columns.iter().zip(plans.iter()) {
            cells.push(build_cell(&conn, &mut cache, record, column, plan)?);
        }
        rows.push(RowView {
            oid: record.oid,
            data: record.data.clone(),
            cells,
            created_at: record.created_at,
            updated_at: record.updated_at,
        });
    }

    let records = Page::new(rows, page.page, page.limit, page.total);
    return Ok(TableView { table, columns, records });
}

fn build_cell(conn: &Connection, cache: &mut RecordCache, record: &Record, column: &ColumnMetadata, plan: &ColumnPlan) -> Result<Cell, error::Error> {
    let mut failed_validations: Vec<error::FailedValidation> = Vec::new();
    if column.is_invalid {
        failed_validations.push(error::FailedValidation::new(
            column.invalid_reason.clone().unwrap_or_else(|| format!("{} is invalid!", column.name))
        ));
    }

    // Lookup cells are computed
    if let ColumnPlan::Lookup(lookup) = plan {
        let resolved = lookup.resolve(conn, cache, record)?;
        if resolved.status == ResolutionStatus::Dangling {
            if let Some(reason) = &resolved.reason {
                failed_validations.push(error::FailedValidation::new(reason.clone()));
            }
        }
        if resolved.status == ResolutionStatus::Invalid && !column.is_invalid {
            if let Some(reason) = &resolved.reason {
                failed_validations.push(error::FailedValidation::new(reason.clone()));
            }
        }
        return Ok(Cell {
            column_oid: column.oid,
            display_value: cell_value::display_json(&resolved.value),
            true_value: resolved.value,
            status: Some(resolved.status),
            failed_validations,
        });
    }

    let true_value = record.data.get(&column.name).cloned().unwrap_or(Value::Null);

    // Nullability validation
    if column.is_required && true_value.is_null() {
        failed_validations.push(error::FailedValidation::new(format!("{} cannot be NULL!", column.name)));
    }

    // Uniqueness validation
    if column.is_unique && data::value_taken(conn, record.table_oid, &column.name, &true_value, Some(record.oid))? {
        failed_validations.push(error::FailedValidation::new(format!("{} value is not unique!", column.name)));
    }

    // Type validation; values not yet converted by a running migration show up here
    if let Err(reason) = CellValue::from_json(&true_value, &column.column_type) {
        failed_validations.push(error::FailedValidation::new(format!("{} value is not a valid {}: {reason}", column.name, column.data_type())));
    }

    let display_value = match plan {
        ColumnPlan::Linked(labels) => {
            let ids = cell_value::linked_ids_of(&true_value);
            if ids.is_empty() {
                None
            } else {
                let mut shown: Vec<String> = Vec::with_capacity(ids.len());
                for id in ids {
                    match labels.label_for(conn, cache, id)? {
                        Some(label) => shown.push(label),
                        None => {
                            failed_validations.push(error::FailedValidation::new(format!("linked record {id} was deleted")));
                            shown.push(reference::DELETED_LABEL.to_string());
                        }
                    }
                }
                Some(shown.join(", "))
            }
        },
        _ => cell_value::display_json(&true_value)
    };

    return Ok(Cell {
        column_oid: column.oid,
        true_value,
        display_value,
        status: None,
        failed_validations,
    });
}
