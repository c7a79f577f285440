use rusqlite::Error as RusqliteError;
use serde::Serialize;
use thiserror::Error as ThisError;
use crate::backend::coerce::CoercionIssue;
use crate::backend::column_type::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceType {
    Table,
    Column,
    Record,
    Job,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Table => write!(f, "table"),
            ResourceType::Column => write!(f, "column"),
            ResourceType::Record => write!(f, "record"),
            ResourceType::Job => write!(f, "job"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    DuplicateColumnName,
    TableNotFound,
    ColumnNotFound,
    RecordNotFound,
    JobNotFound,
    MigrationInProgress,
    Coercion,
    DanglingReference,
    LeaseLost,
    Timeout,
    Storage,
    Serialization,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation_error",
            ErrorCode::DuplicateColumnName => "duplicate_column_name",
            ErrorCode::TableNotFound => "table_not_found",
            ErrorCode::ColumnNotFound => "column_not_found",
            ErrorCode::RecordNotFound => "record_not_found",
            ErrorCode::JobNotFound => "job_not_found",
            ErrorCode::MigrationInProgress => "migration_in_progress",
            ErrorCode::Coercion => "coercion_error",
            ErrorCode::DanglingReference => "dangling_reference",
            ErrorCode::LeaseLost => "lease_lost",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Storage => "storage_error",
            ErrorCode::Serialization => "serialization_error",
        }
    }

    /// The HTTP-style status code reported in response envelopes.
    pub fn status(self) -> u16 {
        match self {
            ErrorCode::Validation
            | ErrorCode::DuplicateColumnName => 400,
            ErrorCode::TableNotFound
            | ErrorCode::ColumnNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::JobNotFound => 404,
            ErrorCode::MigrationInProgress
            | ErrorCode::LeaseLost => 409,
            ErrorCode::Coercion
            | ErrorCode::DanglingReference => 422,
            ErrorCode::Timeout => 504,
            ErrorCode::Storage
            | ErrorCode::Serialization => 500,
        }
    }
}

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("column name '{name}' already exists in table {table_oid}")]
    DuplicateColumnName { table_oid: i64, name: String },
    #[error("{resource_type} {oid} not found")]
    NotFound { resource_type: ResourceType, oid: i64 },
    #[error("a column migration (job {job_oid}) is already in progress on table {table_oid}")]
    MigrationInProgress { table_oid: i64, job_oid: i64 },
    #[error("{} value(s) of column '{column}' cannot be converted to {to}", failures.len())]
    Coercion {
        column: String,
        to: DataType,
        failures: Vec<CoercionIssue>,
    },
    #[error("dangling reference: {0}")]
    DanglingReference(String),
    #[error("migration lease on table {table_oid} for job {job_oid} is held by another worker")]
    LeaseLost { table_oid: i64, job_oid: i64 },
    #[error("timed out waiting for job {job_oid}")]
    Timeout { job_oid: i64 },
    #[error("SQLite error occurred: {0}")]
    Storage(#[from] RusqliteError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(resource_type: ResourceType, oid: i64) -> Error {
        return Error::NotFound { resource_type, oid };
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Validation(_) => ErrorCode::Validation,
            Error::DuplicateColumnName { .. } => ErrorCode::DuplicateColumnName,
            Error::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Table => ErrorCode::TableNotFound,
                ResourceType::Column => ErrorCode::ColumnNotFound,
                ResourceType::Record => ErrorCode::RecordNotFound,
                ResourceType::Job => ErrorCode::JobNotFound,
            },
            Error::MigrationInProgress { .. } => ErrorCode::MigrationInProgress,
            Error::Coercion { .. } => ErrorCode::Coercion,
            Error::DanglingReference(_) => ErrorCode::DanglingReference,
            Error::LeaseLost { .. } => ErrorCode::LeaseLost,
            Error::Timeout { .. } => ErrorCode::Timeout,
            Error::Storage(_) => ErrorCode::Storage,
            Error::Serialization(_) => ErrorCode::Serialization,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn status(&self) -> u16 {
        self.code().status()
    }
}


#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
/// A flag for a validation check that was not passed.
pub struct FailedValidation {
    pub description: String
}

impl FailedValidation {
    pub fn new(description: impl Into<String>) -> FailedValidation {
        return FailedValidation { description: description.into() };
    }
}
