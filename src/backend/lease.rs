use std::time::Duration;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use crate::backend::db;
use crate::util::error;

/// The per-table migration lease.
/// A lease row exists for as long as a table has an unfinished synchronization job.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub table_oid: i64,
    pub job_oid: i64,
    pub owner: Option<String>,
    pub version: i64,
    /// Unix timestamp in milliseconds.
    pub expires_at: i64,
}

impl Lease {
    /// Whether `owner` may take over the lease at time `now`.
    pub fn claimable_by(&self, owner: &str, now: i64) -> bool {
        return match &self.owner {
            None => true,
            Some(o) => o == owner || self.expires_at <= now
        };
    }
}

/// Gets the lease held on a table, if any.
pub fn get(conn: &Connection, table_oid: i64) -> Result<Option<Lease>, error::Error> {
    return Ok(conn.query_row(
        "SELECT TABLE_OID, JOB_OID, OWNER, VERSION, EXPIRES_AT FROM MIGRATION_LEASE WHERE TABLE_OID = ?1",
        params![table_oid],
        |row| Ok(Lease {
            table_oid: row.get("TABLE_OID")?,
            job_oid: row.get("JOB_OID")?,
            owner: row.get("OWNER")?,
            version: row.get("VERSION")?,
            expires_at: row.get("EXPIRES_AT")?,
        })
    ).optional()?);
}

/// Fails with `MigrationInProgress` if the table has an unfinished job.
pub fn ensure_free(conn: &Connection, table_oid: i64) -> Result<(), error::Error> {
    return match get(conn, table_oid)? {
        Some(lease) => Err(error::Error::MigrationInProgress { table_oid, job_oid: lease.job_oid }),
        None => Ok(())
    };
}

/// Creates an unowned lease for a newly enqueued job.
pub fn create(conn: &Connection, table_oid: i64, job_oid: i64) -> Result<(), error::Error> {
    ensure_free(conn, table_oid)?;
    conn.execute(
        "INSERT INTO MIGRATION_LEASE (TABLE_OID, JOB_OID, OWNER, VERSION, EXPIRES_AT) VALUES (?1, ?2, NULL, 0, 0)",
        params![table_oid, job_oid]
    )?;
    return Ok(());
}

/// Claims or renews the lease of a job for `owner`.
/// Returns `None` when the lease belongs to another job or another live owner.
pub fn claim(conn: &Connection, table_oid: i64, job_oid: i64, owner: &str, ttl: Duration) -> Result<Option<Lease>, error::Error> {
    let current = match get(conn, table_oid)? {
        Some(l) => l,
        None => { return Ok(None); }
    };
    let now = db::now_millis();
    if current.job_oid != job_oid || !current.claimable_by(owner, now) {
        return Ok(None);
    }

    // Compare-and-swap on the version read above
    let expires_at = now + ttl.as_millis() as i64;
    let changed = conn.execute(
        "UPDATE MIGRATION_LEASE SET OWNER = ?1, VERSION = VERSION + 1, EXPIRES_AT = ?2 WHERE TABLE_OID = ?3 AND JOB_OID = ?4 AND VERSION = ?5",
        params![owner, expires_at, table_oid, job_oid, current.version]
    )?;
    if changed == 0 {
        return Ok(None);
    }
    return Ok(Some(Lease {
        table_oid,
        job_oid,
        owner: Some(owner.to_string()),
        version: current.version + 1,
        expires_at,
    }));
}

/// Removes the lease of a finished job, unlocking the table.
pub fn release(conn: &Connection, table_oid: i64, job_oid: i64) -> Result<(), error::Error> {
    conn.execute(
        "DELETE FROM MIGRATION_LEASE WHERE TABLE_OID = ?1 AND JOB_OID = ?2",
        params![table_oid, job_oid]
    )?;
    return Ok(());
}

/// Gives up ownership without unlocking the table, so that a retry or another instance can claim it.
pub fn abandon(conn: &Connection, table_oid: i64, job_oid: i64, owner: &str) -> Result<(), error::Error> {
    conn.execute(
        "UPDATE MIGRATION_LEASE SET OWNER = NULL, EXPIRES_AT = 0, VERSION = VERSION + 1 WHERE TABLE_OID = ?1 AND JOB_OID = ?2 AND OWNER = ?3",
        params![table_oid, job_oid, owner]
    )?;
    return Ok(());
}
