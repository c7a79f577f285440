//! Column synchronization jobs.
//!
//! A schema mutation commits its metadata change together with a job describing how
//! existing records must be rewritten. Jobs are processed in chunks of ascending record
//! OID; each chunk commits the rewritten records, its report entries, the job cursor and a
//! renewal of the table's migration lease in one transaction, so an interrupted job resumes
//! from the last committed chunk.

use std::thread;
use std::time::{Duration, Instant};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use crate::backend::coerce::{self, Coercion, CoercionIssue};
use crate::backend::column_type::ColumnType;
use crate::backend::db::{self, Database};
use crate::backend::{data, lease};
use crate::util::config::CoercionPolicy;
use crate::util::error;

/// One rewrite applied to every record of a table.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum SyncStep {
    Rename {
        from: String,
        to: String,
    },
    Retype {
        column: String,
        from: ColumnType,
        to: ColumnType,
        policy: CoercionPolicy,
    },
    Delete {
        column: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        return match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
    }

    pub fn from_database(status: &str) -> Option<JobStatus> {
        return match status {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None
        };
    }

    pub fn is_finished(&self) -> bool {
        return matches!(self, Self::Completed | Self::Failed);
    }
}

/// Returned by a schema mutation so that callers can poll for completion.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_oid: i64,
    pub table_oid: i64,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub oid: i64,
    pub table_oid: i64,
    pub steps: Vec<SyncStep>,
    pub status: JobStatus,
    /// OID of the last record of the last committed chunk.
    pub cursor: i64,
    pub processed: i64,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// What a single call to `run_chunk` achieved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkProgress {
    Progressed { records: usize, issues: usize },
    Completed,
    /// Another live worker holds the table's lease.
    LeaseUnavailable,
}

/// Applies the steps of a job to one record's values.
/// Returns whether the values changed and the values that could not be converted.
pub fn apply_steps(data: &mut Map<String, Value>, steps: &[SyncStep], record_oid: i64) -> (bool, Vec<CoercionIssue>) {
    let mut changed = false;
    let mut issues: Vec<CoercionIssue> = Vec::new();
    for step in steps {
        match step {
            SyncStep::Rename { from, to } => {
                // A record without the old key was already migrated
                if let Some(value) = data.remove(from) {
                    if !data.contains_key(to) {
                        data.insert(to.clone(), value);
                    }
                    changed = true;
                }
            },
            SyncStep::Retype { column, from, to, .. } => {
                let value = match data.get(column) {
                    Some(v) => v.clone(),
                    None => { continue; }
                };
                match coerce::coerce(&value, from, to) {
                    Coercion::Keep => {},
                    Coercion::Replace(v) if v.is_null() => {
                        data.remove(column);
                        changed = true;
                    },
                    Coercion::Replace(v) => {
                        data.insert(column.clone(), v);
                        changed = true;
                    },
                    Coercion::Discard => {
                        data.remove(column);
                        changed = true;
                    },
                    Coercion::Failed(reason) => {
                        issues.push(CoercionIssue {
                            record_oid,
                            column_name: column.clone(),
                            original_value: value,
                            reason,
                        });
                        data.remove(column);
                        changed = true;
                    }
                }
            },
            SyncStep::Delete { column } => {
                if data.remove(column).is_some() {
                    changed = true;
                }
            }
        }
    }
    return (changed, issues);
}

/// Runs the steps over every record of a table without writing anything.
pub fn dry_run(conn: &Connection, table_oid: i64, steps: &[SyncStep]) -> Result<Vec<CoercionIssue>, error::Error> {
    let mut issues: Vec<CoercionIssue> = Vec::new();
    for mut record in data::load_all(conn, table_oid)? {
        let (_, mut record_issues) = apply_steps(&mut record.data, steps, record.oid);
        issues.append(&mut record_issues);
    }
    return Ok(issues);
}

/// Persists a new job and locks its table. Must run inside the transaction of the schema mutation.
pub fn enqueue(conn: &Connection, table_oid: i64, steps: &[SyncStep]) -> Result<JobHandle, error::Error> {
    let now = db::now();
    conn.execute(
        "INSERT INTO MIGRATION_JOB (TABLE_OID, STEPS, STATUS, CURSOR, PROCESSED, CREATED_AT, UPDATED_AT) VALUES (?1, ?2, 'pending', 0, 0, ?3, ?3)",
        params![table_oid, serde_json::to_string(steps)?, now]
    )?;
    let job_oid = conn.last_insert_rowid();
    lease::create(conn, table_oid, job_oid)?;
    info!(table_oid, job_oid, steps = steps.len(), "enqueued column synchronization job");
    return Ok(JobHandle { job_oid, table_oid });
}

/// Starts a worker for a committed job if the database runs background workers.
pub fn start(db: &Database, handle: JobHandle) {
    if db.config().background_workers {
        spawn(db, handle);
    }
}

/// Runs a job to completion on a detached worker thread.
pub fn spawn(db: &Database, handle: JobHandle) {
    let worker_db = db.clone();
    let spawned = thread::Builder::new()
        .name(format!("column-sync-{}", handle.job_oid))
        .spawn(move || {
            match run(&worker_db, handle.job_oid) {
                Ok(_) => {},
                Err(error::Error::LeaseLost { table_oid, job_oid }) => {
                    debug!(table_oid, job_oid, "job is being run by another worker");
                },
                Err(e) => {
                    warn!(job_oid = handle.job_oid, error = %e, "column synchronization worker stopped");
                }
            }
        });
    if let Err(e) = spawned {
        // The job stays pending and is picked up by `resume_pending`
        warn!(job_oid = handle.job_oid, error = %e, "could not start column synchronization worker");
    }
}

/// Runs a job on the current thread until it completes.
pub fn run(db: &Database, job_oid: i64) -> Result<Job, error::Error> {
    loop {
        let progress = match run_chunk(db, job_oid) {
            Ok(p) => p,
            Err(e @ error::Error::Validation(_)) | Err(e @ error::Error::NotFound { .. }) => {
                return Err(e);
            },
            Err(e) => {
                fail(db, job_oid, &e);
                return Err(e);
            }
        };
        match progress {
            ChunkProgress::Progressed { .. } => {
                // Let readers in between chunks
                if !db.config().sync_batch_pause.is_zero() {
                    thread::sleep(db.config().sync_batch_pause);
                }
            },
            ChunkProgress::Completed => {
                return get_job(db, job_oid);
            },
            ChunkProgress::LeaseUnavailable => {
                let job = get_job(db, job_oid)?;
                return Err(error::Error::LeaseLost { table_oid: job.table_oid, job_oid });
            }
        }
    }
}

/// Processes the next chunk of a job in a single transaction.
pub fn run_chunk(db: &Database, job_oid: i64) -> Result<ChunkProgress, error::Error> {
    let mut conn = db.connect()?;
    let trans = db::begin_write(&mut conn)?;
    let job = get_job_conn(&trans, job_oid)?;
    match job.status {
        JobStatus::Completed => {
            return Ok(ChunkProgress::Completed);
        },
        JobStatus::Failed => {
            return Err(error::Error::Validation(format!("job {job_oid} has failed and must be retried")));
        },
        JobStatus::Pending | JobStatus::Running => {}
    }

    // Claim or renew the table's lease
    let lease = match lease::claim(&trans, job.table_oid, job_oid, db.instance_id(), db.config().lease_ttl)? {
        Some(l) => l,
        None => {
            warn!(table_oid = job.table_oid, job_oid, "migration lease is held by another worker");
            return Ok(ChunkProgress::LeaseUnavailable);
        }
    };

    // Load the next chunk of records
    let mut batch: Vec<(i64, Map<String, Value>)> = Vec::new();
    db::query_iterate(
        &trans,
        "SELECT OID, DATA FROM RECORD WHERE TABLE_OID = ?1 AND OID > ?2 ORDER BY OID LIMIT ?3",
        params![job.table_oid, job.cursor, db.config().sync_batch_size as i64],
        &mut |row| {
            let data: String = row.get("DATA")?;
            batch.push((row.get("OID")?, serde_json::from_str(&data)?));
            return Ok(());
        }
    )?;

    if batch.is_empty() {
        // Every record has been migrated; unlock the table
        trans.execute(
            "UPDATE MIGRATION_JOB SET STATUS = 'completed', UPDATED_AT = ?1 WHERE OID = ?2",
            params![db::now(), job_oid]
        )?;
        lease::release(&trans, job.table_oid, job_oid)?;
        trans.commit()?;
        info!(table_oid = job.table_oid, job_oid, processed = job.processed, "completed column synchronization job");
        return Ok(ChunkProgress::Completed);
    }

    // Rewrite the records of the chunk
    let records = batch.len();
    let mut issues = 0;
    let mut cursor = job.cursor;
    for (record_oid, mut data) in batch {
        let (changed, record_issues) = apply_steps(&mut data, &job.steps, record_oid);
        if changed {
            trans.execute(
                "UPDATE RECORD SET DATA = ?1 WHERE OID = ?2",
                params![serde_json::to_string(&data)?, record_oid]
            )?;
        }
        for issue in record_issues {
            trans.execute(
                "INSERT OR REPLACE INTO MIGRATION_REPORT_ENTRY (JOB_OID, RECORD_OID, COLUMN_NAME, ORIGINAL_VALUE, REASON) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job_oid, issue.record_oid, issue.column_name, serde_json::to_string(&issue.original_value)?, issue.reason]
            )?;
            issues += 1;
        }
        cursor = record_oid;
    }

    // Advance the cursor
    trans.execute(
        "UPDATE MIGRATION_JOB SET STATUS = 'running', CURSOR = ?1, PROCESSED = PROCESSED + ?2, UPDATED_AT = ?3 WHERE OID = ?4",
        params![cursor, records as i64, db::now(), job_oid]
    )?;
    trans.commit()?;

    if issues > 0 {
        warn!(table_oid = job.table_oid, job_oid, issues, "values could not be converted and were cleared");
    }
    debug!(table_oid = job.table_oid, job_oid, cursor, records, lease_version = lease.version, "committed synchronization chunk");
    return Ok(ChunkProgress::Progressed { records, issues });
}

/// Marks a job as failed and gives up its lease so that it can be retried.
/// The table stays locked until the job is retried and completes.
fn fail(db: &Database, job_oid: i64, cause: &error::Error) {
    let result = (|| -> Result<(), error::Error> {
        let mut conn = db.connect()?;
        let trans = db::begin_write(&mut conn)?;
        let job = get_job_conn(&trans, job_oid)?;
        trans.execute(
            "UPDATE MIGRATION_JOB SET STATUS = 'failed', ERROR = ?1, UPDATED_AT = ?2 WHERE OID = ?3",
            params![cause.to_string(), db::now(), job_oid]
        )?;
        lease::abandon(&trans, job.table_oid, job_oid, db.instance_id())?;
        trans.commit()?;
        return Ok(());
    })();
    match result {
        Ok(()) => {
            error!(job_oid, error = %cause, "column synchronization job failed");
        },
        Err(e) => {
            warn!(job_oid, error = %cause, cleanup_error = %e, "column synchronization job failed and could not be marked as failed");
        }
    }
}

/// Puts a failed job back in the queue and restarts it from its cursor.
pub fn retry(db: &Database, job_oid: i64) -> Result<JobHandle, error::Error> {
    let mut conn = db.connect()?;
    let trans = db::begin_write(&mut conn)?;
    let job = get_job_conn(&trans, job_oid)?;
    if job.status != JobStatus::Failed {
        return Err(error::Error::Validation(format!("job {job_oid} is {} and cannot be retried", job.status.as_str())));
    }
    trans.execute(
        "UPDATE MIGRATION_JOB SET STATUS = 'pending', ERROR = NULL, UPDATED_AT = ?1 WHERE OID = ?2",
        params![db::now(), job_oid]
    )?;
    trans.commit()?;

    let handle = JobHandle { job_oid, table_oid: job.table_oid };
    info!(table_oid = job.table_oid, job_oid, cursor = job.cursor, "retrying column synchronization job");
    start(db, handle);
    return Ok(handle);
}

/// Starts workers for unfinished jobs whose lease has no live owner.
pub fn resume_pending(db: &Database) -> Result<Vec<JobHandle>, error::Error> {
    let conn = db.connect()?;
    let now = db::now_millis();
    let mut handles: Vec<JobHandle> = Vec::new();
    db::query_iterate(
        &conn,
        "SELECT j.OID, j.TABLE_OID
        FROM MIGRATION_JOB j
        INNER JOIN MIGRATION_LEASE l ON l.TABLE_OID = j.TABLE_OID AND l.JOB_OID = j.OID
        WHERE j.STATUS IN ('pending', 'running') AND (l.OWNER IS NULL OR l.OWNER = ?1 OR l.EXPIRES_AT <= ?2)
        ORDER BY j.OID",
        params![db.instance_id(), now],
        &mut |row| {
            handles.push(JobHandle { job_oid: row.get("OID")?, table_oid: row.get("TABLE_OID")? });
            return Ok(());
        }
    )?;
    for handle in &handles {
        info!(table_oid = handle.table_oid, job_oid = handle.job_oid, "resuming column synchronization job");
        spawn(db, *handle);
    }
    return Ok(handles);
}

fn job_from_row(row: &Row<'_>) -> Result<Job, error::Error> {
    let steps: String = row.get("STEPS")?;
    let status: String = row.get("STATUS")?;
    let status = match JobStatus::from_database(&status) {
        Some(s) => s,
        None => {
            return Err(error::Error::Validation(format!("unknown job status '{status}'")));
        }
    };
    return Ok(Job {
        oid: row.get("OID")?,
        table_oid: row.get("TABLE_OID")?,
        steps: serde_json::from_str(&steps)?,
        status,
        cursor: row.get("CURSOR")?,
        processed: row.get("PROCESSED")?,
        error: row.get("ERROR")?,
        created_at: row.get("CREATED_AT")?,
        updated_at: row.get("UPDATED_AT")?,
    });
}

fn get_job_conn(conn: &Connection, job_oid: i64) -> Result<Job, error::Error> {
    let mut job: Option<Job> = None;
    db::query_iterate(
        conn,
        "SELECT OID, TABLE_OID, STEPS, STATUS, CURSOR, PROCESSED, ERROR, CREATED_AT, UPDATED_AT FROM MIGRATION_JOB WHERE OID = ?1",
        params![job_oid],
        &mut |row| {
            job = Some(job_from_row(row)?);
            return Ok(());
        }
    )?;
    return match job {
        Some(j) => Ok(j),
        None => Err(error::Error::not_found(error::ResourceType::Job, job_oid))
    };
}

/// The keys under which records of a table may still hold a column's values: its current
/// name, plus the names it had before renames that unfinished jobs have not yet applied.
pub fn pending_keys(conn: &Connection, table_oid: i64, column_name: &str) -> Result<Vec<String>, error::Error> {
    let mut keys: Vec<String> = vec![column_name.to_string()];
    let mut jobs: Vec<Job> = Vec::new();
    db::query_iterate(
        conn,
        "SELECT OID, TABLE_OID, STEPS, STATUS, CURSOR, PROCESSED, ERROR, CREATED_AT, UPDATED_AT FROM MIGRATION_JOB WHERE TABLE_OID = ?1 AND STATUS <> 'completed' ORDER BY OID DESC",
        params![table_oid],
        &mut |row| {
            jobs.push(job_from_row(row)?);
            return Ok(());
        }
    )?;

    // Walk the renames backwards from the newest job to recover older names
    for job in &jobs {
        for step in job.steps.iter().rev() {
            if let SyncStep::Rename { from, to } = step {
                if keys.contains(to) && !keys.contains(from) {
                    keys.push(from.clone());
                }
            }
        }
    }
    return Ok(keys);
}

/// Gets the current state of a job.
pub fn get_job(db: &Database, job_oid: i64) -> Result<Job, error::Error> {
    let conn = db.connect()?;
    return get_job_conn(&conn, job_oid);
}

/// Gets the values a job could not convert, in record order.
pub fn get_report(db: &Database, job_oid: i64) -> Result<Vec<CoercionIssue>, error::Error> {
    let conn = db.connect()?;
    get_job_conn(&conn, job_oid)?;

    let mut issues: Vec<CoercionIssue> = Vec::new();
    db::query_iterate(
        &conn,
        "SELECT RECORD_OID, COLUMN_NAME, ORIGINAL_VALUE, REASON FROM MIGRATION_REPORT_ENTRY WHERE JOB_OID = ?1 ORDER BY RECORD_OID, COLUMN_NAME",
        params![job_oid],
        &mut |row| {
            let original_value: Option<String> = row.get("ORIGINAL_VALUE")?;
            issues.push(CoercionIssue {
                record_oid: row.get("RECORD_OID")?,
                column_name: row.get("COLUMN_NAME")?,
                original_value: match original_value {
                    Some(v) => serde_json::from_str(&v)?,
                    None => Value::Null
                },
                reason: row.get("REASON")?,
            });
            return Ok(());
        }
    )?;
    return Ok(issues);
}

/// Polls a job until it completes or fails.
pub fn wait_for_job(db: &Database, job_oid: i64, timeout: Duration) -> Result<Job, error::Error> {
    let started = Instant::now();
    loop {
        let job = get_job(db, job_oid)?;
        if job.status.is_finished() {
            return Ok(job);
        }
        if started.elapsed() >= timeout {
            return Err(error::Error::Timeout { job_oid });
        }
        thread::sleep(Duration::from_millis(20));
    }
}
