use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::util::error;

/// What happens to a stored value that cannot be converted when a column changes type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoercionPolicy {
    /// The value becomes null and the record is listed in the migration report.
    #[default]
    NullAndReport,
    /// The type change is rejected before anything is written if any value would fail.
    Strict,
}

/// Runtime configuration for a dynamic table database.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    /// Number of records rewritten per synchronization chunk (one transaction each).
    pub sync_batch_size: usize,
    /// Pause between chunks so that readers are not starved by a long migration.
    pub sync_batch_pause: Duration,
    /// How long a worker's claim on a table's migration lease stays valid without renewal.
    pub lease_ttl: Duration,
    pub busy_timeout: Duration,
    pub coercion_policy: CoercionPolicy,
    pub default_page_limit: usize,
    pub max_page_limit: usize,
    /// Spawn a worker thread for every synchronization job as soon as it is enqueued.
    pub background_workers: bool,
    /// Claim and restart unfinished jobs when the database is opened.
    pub resume_jobs_on_open: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("dyntable.sqlite3"),
            sync_batch_size: 200,
            sync_batch_pause: Duration::from_millis(5),
            lease_ttl: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            coercion_policy: CoercionPolicy::NullAndReport,
            default_page_limit: 50,
            max_page_limit: 500,
            background_workers: true,
            resume_jobs_on_open: true,
        }
    }
}

impl EngineConfig {
    pub fn new<P: AsRef<Path>>(database_path: P) -> Self {
        Self {
            database_path: database_path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Small batches and no pause, for local work and tests.
    pub fn development<P: AsRef<Path>>(database_path: P) -> Self {
        Self {
            database_path: database_path.as_ref().to_path_buf(),
            sync_batch_size: 16,
            sync_batch_pause: Duration::ZERO,
            lease_ttl: Duration::from_secs(5),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, sync_batch_size: usize) -> Self {
        self.sync_batch_size = sync_batch_size;
        self
    }

    pub fn with_batch_pause(mut self, sync_batch_pause: Duration) -> Self {
        self.sync_batch_pause = sync_batch_pause;
        self
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn with_coercion_policy(mut self, coercion_policy: CoercionPolicy) -> Self {
        self.coercion_policy = coercion_policy;
        self
    }

    pub fn with_page_limits(mut self, default_page_limit: usize, max_page_limit: usize) -> Self {
        self.default_page_limit = default_page_limit;
        self.max_page_limit = max_page_limit;
        self
    }

    /// Leave enqueued jobs for an explicit `sync::run` / `sync::resume_pending` call,
    /// e.g. when a separate worker process owns migrations.
    pub fn without_background_workers(mut self) -> Self {
        self.background_workers = false;
        self.resume_jobs_on_open = false;
        self
    }

    pub fn validate(&self) -> Result<(), error::Error> {
        if self.sync_batch_size == 0 {
            return Err(error::Error::Validation("sync_batch_size must be at least 1".into()));
        }
        if self.default_page_limit == 0 || self.max_page_limit == 0 {
            return Err(error::Error::Validation("page limits must be at least 1".into()));
        }
        if self.default_page_limit > self.max_page_limit {
            return Err(error::Error::Validation("default_page_limit cannot exceed max_page_limit".into()));
        }
        return Ok(());
    }
}
