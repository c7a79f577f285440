#![allow(dead_code)]

use std::time::Duration;
use dyntable::backend::column::{self, ColumnSpec};
use dyntable::backend::column_type::{ColumnType, LinkedTableConfig, LookupConfig};
use dyntable::backend::data::{self, Record};
use dyntable::backend::sync::{self, Job, JobHandle, JobStatus};
use dyntable::backend::table;
use dyntable::util::logging;
use dyntable::{Database, EngineConfig};
use serde_json::{Map, Value};
use tempfile::{tempdir, TempDir};

pub const WAIT: Duration = Duration::from_secs(10);

pub struct TestDb {
    pub db: Database,
    pub dir: TempDir,
}

impl TestDb {
    pub fn config(&self) -> EngineConfig {
        EngineConfig::development(self.dir.path().join("dyntable.sqlite3"))
    }
}

pub fn open() -> TestDb {
    open_with(|config| config)
}

pub fn open_with(configure: impl FnOnce(EngineConfig) -> EngineConfig) -> TestDb {
    logging::init("warn");
    let dir = tempdir().expect("temp dir");
    let config = configure(EngineConfig::development(dir.path().join("dyntable.sqlite3")));
    let db = Database::open(config).expect("open db");
    TestDb { db, dir }
}

pub fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn create_table(db: &Database, name: &str) -> i64 {
    table::create(db, 1, name).expect("create table").oid
}

pub fn add_column(db: &Database, table_oid: i64, name: &str, column_type: ColumnType) -> i64 {
    column::create(db, table_oid, ColumnSpec::new(name, column_type)).expect("create column").oid
}

pub fn linked(table_oid: i64, allow_multiple: bool) -> ColumnType {
    ColumnType::LinkedTable(LinkedTableConfig {
        linked_table_id: table_oid,
        linked_column_id: None,
        display_column_id: None,
        allow_multiple,
    })
}

pub fn lookup(table_oid: i64, lookup_column_oid: i64) -> ColumnType {
    ColumnType::Lookup(LookupConfig {
        linked_table_id: table_oid,
        lookup_column_id: lookup_column_oid,
        lookup_column_name: String::new(),
        link_column_id: None,
    })
}

pub fn insert(db: &Database, table_oid: i64, value: Value) -> Record {
    data::create(db, table_oid, obj(value)).expect("create record")
}

pub fn all_records(db: &Database, table_oid: i64) -> Vec<Record> {
    let conn = db.connect().expect("connect");
    data::load_all(&conn, table_oid).expect("load records")
}

/// Waits for the job of a mutation and asserts that it completed.
pub fn wait(db: &Database, job: Option<JobHandle>) -> Option<Job> {
    let handle = job?;
    let job = sync::wait_for_job(db, handle.job_oid, WAIT).expect("job finishes");
    assert_eq!(job.status, JobStatus::Completed, "job failed: {:?}", job.error);
    Some(job)
}
