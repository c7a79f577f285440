use std::sync::Arc;
use rusqlite::{Connection, Params, Row, Transaction, TransactionBehavior};
use time::OffsetDateTime;
use tracing::info;
use crate::backend::sync;
use crate::util::config::EngineConfig;
use crate::util::error;

/// Handle to an opened dynamic table database.
/// Cheap to clone; every operation opens its own SQLite connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    config: EngineConfig,
    instance_id: String,
}

impl Database {
    /// Opens (and if necessary initializes) the database named by the configuration.
    pub fn open(config: EngineConfig) -> Result<Database, error::Error> {
        config.validate()?;
        initialize_schema(&config)?;

        let db = Database {
            inner: Arc::new(DatabaseInner {
                config,
                instance_id: uuid::Uuid::new_v4().to_string(),
            }),
        };
        info!(
            path = %db.config().database_path.display(),
            instance = %db.instance_id(),
            "opened dynamic table database"
        );

        // Pick up migrations that an earlier process left unfinished
        if db.config().resume_jobs_on_open {
            sync::resume_pending(&db)?;
        }
        return Ok(db);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Identifies this process as a migration lease owner.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Opens a connection to the database.
    pub fn connect(&self) -> Result<Connection, error::Error> {
        let conn = Connection::open(&self.inner.config.database_path)?;
        configure_connection(&conn, &self.inner.config)?;
        return Ok(conn);
    }
}

fn configure_connection(conn: &Connection, config: &EngineConfig) -> Result<(), error::Error> {
    conn.busy_timeout(config.busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    return Ok(());
}

/// Creates the catalog tables if they do not already exist.
fn initialize_schema(config: &EngineConfig) -> Result<(), error::Error> {
    let mut conn = Connection::open(&config.database_path)?;
    configure_connection(&conn, config)?;
    let trans = begin_write(&mut conn)?;
    trans.execute_batch("
    -- METADATA_TABLE stores all user-defined tables; DATABASE_OID is the tenant-scoped container
    CREATE TABLE IF NOT EXISTS METADATA_TABLE (
        OID INTEGER PRIMARY KEY AUTOINCREMENT,
        DATABASE_OID INTEGER NOT NULL,
        NAME TEXT NOT NULL,
        CREATED_AT INTEGER NOT NULL
    );

    -- METADATA_TABLE_COLUMN stores all columns of user-defined tables
    CREATE TABLE IF NOT EXISTS METADATA_TABLE_COLUMN (
        OID INTEGER PRIMARY KEY AUTOINCREMENT,
        TABLE_OID INTEGER NOT NULL,
        NAME TEXT NOT NULL,
            -- Also the key under which records store this column's values
        DATA_TYPE TEXT NOT NULL,
        CONFIG TEXT,
            -- JSON; select options, linked table or lookup configuration
        COLUMN_ORDERING INTEGER NOT NULL DEFAULT 0,
        IS_REQUIRED TINYINT NOT NULL DEFAULT 0,
        IS_UNIQUE TINYINT NOT NULL DEFAULT 0,
        DEFAULT_VALUE TEXT,
        IS_INVALID TINYINT NOT NULL DEFAULT 0,
        INVALID_REASON TEXT,
        UNIQUE (TABLE_OID, NAME),
        FOREIGN KEY (TABLE_OID) REFERENCES METADATA_TABLE (OID)
            ON UPDATE CASCADE
            ON DELETE CASCADE
    );

    -- METADATA_COLUMN_DEPENDENCY is the reverse dependency index
    -- KIND is one of:
    -- link          = linked column -> target table
    -- lookup_source = lookup column -> linking column on its own table
    -- lookup_target = lookup column -> projected column on the target table
    CREATE TABLE IF NOT EXISTS METADATA_COLUMN_DEPENDENCY (
        DEPENDENT_COLUMN_OID INTEGER NOT NULL,
        KIND TEXT NOT NULL,
        TARGET_TABLE_OID INTEGER NOT NULL,
        TARGET_COLUMN_OID INTEGER,
        FOREIGN KEY (DEPENDENT_COLUMN_OID) REFERENCES METADATA_TABLE_COLUMN (OID)
            ON UPDATE CASCADE
            ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS IDX_DEPENDENCY_TARGET_TABLE ON METADATA_COLUMN_DEPENDENCY (TARGET_TABLE_OID);
    CREATE INDEX IF NOT EXISTS IDX_DEPENDENCY_TARGET_COLUMN ON METADATA_COLUMN_DEPENDENCY (TARGET_COLUMN_OID);

    -- RECORD stores one row of a user-defined table as a JSON object keyed by column name
    -- OIDs are never reused, so a stale link can only point at a missing record
    CREATE TABLE IF NOT EXISTS RECORD (
        OID INTEGER PRIMARY KEY AUTOINCREMENT,
        TABLE_OID INTEGER NOT NULL,
        DATA TEXT NOT NULL DEFAULT '{}',
        CREATED_AT INTEGER NOT NULL,
        UPDATED_AT INTEGER NOT NULL,
        FOREIGN KEY (TABLE_OID) REFERENCES METADATA_TABLE (OID)
            ON UPDATE CASCADE
            ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS IDX_RECORD_TABLE ON RECORD (TABLE_OID, OID);

    -- MIGRATION_JOB stores column synchronization jobs
    -- STATUS is one of pending, running, completed, failed
    -- CURSOR is the OID of the last record whose chunk was committed
    CREATE TABLE IF NOT EXISTS MIGRATION_JOB (
        OID INTEGER PRIMARY KEY AUTOINCREMENT,
        TABLE_OID INTEGER NOT NULL,
        STEPS TEXT NOT NULL,
        STATUS TEXT NOT NULL DEFAULT 'pending',
        CURSOR INTEGER NOT NULL DEFAULT 0,
        PROCESSED INTEGER NOT NULL DEFAULT 0,
        ERROR TEXT,
        CREATED_AT INTEGER NOT NULL,
        UPDATED_AT INTEGER NOT NULL,
        FOREIGN KEY (TABLE_OID) REFERENCES METADATA_TABLE (OID)
            ON UPDATE CASCADE
            ON DELETE CASCADE
    );

    -- MIGRATION_REPORT_ENTRY stores per-record coercion failures of a job
    CREATE TABLE IF NOT EXISTS MIGRATION_REPORT_ENTRY (
        JOB_OID INTEGER NOT NULL,
        RECORD_OID INTEGER NOT NULL,
        COLUMN_NAME TEXT NOT NULL,
        ORIGINAL_VALUE TEXT,
        REASON TEXT NOT NULL,
        PRIMARY KEY (JOB_OID, RECORD_OID, COLUMN_NAME),
        FOREIGN KEY (JOB_OID) REFERENCES MIGRATION_JOB (OID)
            ON UPDATE CASCADE
            ON DELETE CASCADE
    );

    -- MIGRATION_LEASE exists while a table has an unfinished job
    -- OWNER is the instance currently running the job, if any; VERSION increments on every claim or renewal
    CREATE TABLE IF NOT EXISTS MIGRATION_LEASE (
        TABLE_OID INTEGER PRIMARY KEY,
        JOB_OID INTEGER NOT NULL,
        OWNER TEXT,
        VERSION INTEGER NOT NULL DEFAULT 0,
        EXPIRES_AT INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY (TABLE_OID) REFERENCES METADATA_TABLE (OID)
            ON UPDATE CASCADE
            ON DELETE CASCADE
    );
    ")?;
    trans.commit()?;
    return Ok(());
}

/// Begins a transaction that takes the write lock immediately, so that read-modify-write
/// sequences from concurrent connections are serialized.
pub fn begin_write(conn: &mut Connection) -> Result<Transaction<'_>, error::Error> {
    return Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?);
}

/// Convenience method to execute a query that returns multiple rows, then execute a function for each row.
pub fn query_iterate<P: Params, F: FnMut(&Row<'_>) -> Result<(), error::Error>>(conn: &Connection, sql: &str, p: P, f: &mut F) -> Result<(), error::Error> {
    // Prepare a statement
    let mut stmt = conn.prepare(sql)?;

    // Execute the statement to query rows
    let mut rows = stmt.query(p)?;
    loop {
        let row = match rows.next()? {
            Some(r) => r,
            None => { break; }
        };
        f(row)?;
    }
    return Ok(());
}

/// Current time as a unix timestamp in seconds.
pub fn now() -> i64 {
    return OffsetDateTime::now_utc().unix_timestamp();
}

/// Current time as a unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    return (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
}
