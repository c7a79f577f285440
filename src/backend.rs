pub mod db;
pub mod column_type;
pub mod cell_value;
pub mod coerce;
pub mod table;
pub mod column;
pub mod dependency;
pub mod lease;
pub mod data;
pub mod sync;
pub mod reference;
pub mod table_data;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, warn};
use crate::backend::column::{ColumnMutation, ColumnOrder, ColumnSpec, ColumnUpdate};
use crate::backend::data::{ListQuery, Page, Record};
use crate::backend::db::Database;
use crate::backend::reference::{LinkOption, ResolvedValue};
use crate::backend::sync::Job;
use crate::backend::table_data::TableView;
use crate::util::error;

/// The response shape of every command: an HTTP-style status, the payload on success
/// and a message on failure.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub status: u16,
    pub data: Option<T>,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    /// Records that blocked a strict type change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl<T: Serialize> Envelope<T> {
    pub fn from_result(result: Result<T, error::Error>, success_status: u16) -> Envelope<T> {
        return match result {
            Ok(data) => Envelope { status: success_status, data: Some(data), message: None, code: None, details: None },
            Err(e) => {
                let status = e.status();
                if status >= 500 {
                    error!(code = e.code_str(), error = %e, "command failed");
                } else {
                    warn!(code = e.code_str(), error = %e, "command rejected");
                }
                let details = match &e {
                    error::Error::Coercion { failures, .. } => serde_json::to_value(failures).ok(),
                    _ => None
                };
                Envelope { status, data: None, message: Some(e.to_string()), code: Some(e.code_str()), details }
            }
        };
    }

    pub fn ok(result: Result<T, error::Error>) -> Envelope<T> {
        return Self::from_result(result, 200);
    }

    pub fn created(result: Result<T, error::Error>) -> Envelope<T> {
        return Self::from_result(result, 201);
    }

    pub fn is_success(&self) -> bool {
        return (200..300).contains(&self.status);
    }
}

/// Decodes a JSON request body. Malformed bodies are validation errors.
pub fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, error::Error> {
    return match serde_json::from_str(body) {
        Ok(t) => Ok(t),
        Err(e) => Err(error::Error::Validation(format!("malformed request body: {e}")))
    };
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTableRequest {
    database_id: i64,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateColumnRequest {
    table_id: i64,
    #[serde(flatten)]
    spec: ColumnSpec,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColumnOrderRequest {
    columns: Vec<ColumnOrder>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRecordRequest {
    table_id: i64,
    #[serde(default)]
    data: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRecordRequest {
    data: Map<String, Value>,
}

/// `POST tables {databaseId, name}`
pub fn post_table(db: &Database, body: &str) -> Envelope<table::BasicMetadata> {
    return Envelope::created((|| -> Result<_, error::Error> {
        let request: CreateTableRequest = parse_body(body)?;
        return table::create(db, request.database_id, &request.name);
    })());
}

/// `GET databases/:id/tables`
pub fn get_tables(db: &Database, database_oid: i64) -> Envelope<Vec<table::BasicMetadata>> {
    return Envelope::ok(table::list(db, database_oid));
}

/// `GET tables/:id`
pub fn get_table(db: &Database, table_oid: i64) -> Envelope<table::Metadata> {
    return Envelope::ok(table::get(db, table_oid));
}

/// `DELETE tables/:id`
pub fn delete_table(db: &Database, table_oid: i64) -> Envelope<()> {
    return Envelope::ok(table::delete(db, table_oid));
}

/// `GET tables/:id/columns`
pub fn get_table_columns(db: &Database, table_oid: i64) -> Envelope<Vec<column::Metadata>> {
    return Envelope::ok(column::list(db, table_oid));
}

/// `POST columns {tableId, name, dataType, isRequired, isUnique, order, ...}`
pub fn post_column(db: &Database, body: &str) -> Envelope<column::Metadata> {
    return Envelope::created((|| -> Result<_, error::Error> {
        let request: CreateColumnRequest = parse_body(body)?;
        return column::create(db, request.table_id, request.spec);
    })());
}

/// `PUT columns/:id {name?, dataType?, linkedTableConfig?, lookupConfig?, ...}`
/// Returns as soon as the metadata is committed; the records follow through the returned job.
pub fn put_column(db: &Database, column_oid: i64, body: &str) -> Envelope<ColumnMutation> {
    return Envelope::ok((|| -> Result<_, error::Error> {
        let changes: ColumnUpdate = parse_body(body)?;
        return column::update(db, column_oid, changes);
    })());
}

/// `DELETE columns/:id`
pub fn delete_column(db: &Database, column_oid: i64) -> Envelope<ColumnMutation> {
    return Envelope::ok(column::delete(db, column_oid));
}

/// `PUT tables/:id/column-order {columns: [{columnId, order}]}`
pub fn put_column_order(db: &Database, table_oid: i64, body: &str) -> Envelope<Vec<column::Metadata>> {
    return Envelope::ok((|| -> Result<_, error::Error> {
        let request: ColumnOrderRequest = parse_body(body)?;
        return column::reorder(db, table_oid, &request.columns);
    })());
}

/// `GET tables/:id/records?page&limit&search`
pub fn get_table_records(db: &Database, table_oid: i64, query: &ListQuery) -> Envelope<TableView> {
    return Envelope::ok(table_data::get_table_view(db, table_oid, query));
}

/// `GET records/:id`
pub fn get_record(db: &Database, record_oid: i64) -> Envelope<Record> {
    return Envelope::ok(data::get(db, record_oid));
}

/// `POST records {tableId, data}`
pub fn post_record(db: &Database, body: &str) -> Envelope<Record> {
    return Envelope::created((|| -> Result<_, error::Error> {
        let request: CreateRecordRequest = parse_body(body)?;
        return data::create(db, request.table_id, request.data);
    })());
}

/// `PUT records/:id {data}`; only the given keys are overwritten.
pub fn put_record(db: &Database, record_oid: i64, body: &str) -> Envelope<Record> {
    return Envelope::ok((|| -> Result<_, error::Error> {
        let request: UpdateRecordRequest = parse_body(body)?;
        return data::update(db, record_oid, request.data);
    })());
}

/// `DELETE records/:id`
pub fn delete_record(db: &Database, record_oid: i64) -> Envelope<()> {
    return Envelope::ok(data::delete(db, record_oid));
}

/// `GET columns/:id/linked-data?search&page&limit`
pub fn get_linked_data(db: &Database, column_oid: i64, query: &ListQuery) -> Envelope<Page<LinkOption>> {
    return Envelope::ok(reference::list_linked_options(db, column_oid, query));
}

/// `GET columns/:id/lookup-data?search&page&limit`
pub fn get_lookup_data(db: &Database, column_oid: i64, query: &ListQuery) -> Envelope<Page<LinkOption>> {
    return Envelope::ok(reference::list_lookup_options(db, column_oid, query));
}

/// `GET records/:id/lookups/:columnId`
pub fn get_lookup_value(db: &Database, record_oid: i64, column_oid: i64) -> Envelope<ResolvedValue> {
    return Envelope::ok(reference::resolve_lookup(db, record_oid, column_oid));
}

/// `GET jobs/:id`
pub fn get_job(db: &Database, job_oid: i64) -> Envelope<Job> {
    return Envelope::ok(sync::get_job(db, job_oid));
}

/// `GET jobs/:id/report`
pub fn get_job_report(db: &Database, job_oid: i64) -> Envelope<Vec<coerce::CoercionIssue>> {
    return Envelope::ok(sync::get_report(db, job_oid));
}

/// `POST jobs/:id/retry`
pub fn post_job_retry(db: &Database, job_oid: i64) -> Envelope<sync::JobHandle> {
    return Envelope::ok(sync::retry(db, job_oid));
}
