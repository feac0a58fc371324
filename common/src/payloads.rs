use crate::data::{Job, Part};
#[cfg(feature = "db")]
use crate::db::DbError;
use serde::{Deserialize, Serialize};

// Response payloads

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "status", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum ErrorablePayload<T> {
    Ok(T),
    NotFound,
    /// The request itself was unacceptable.
    Invalid(String),
    Err(String),
}

#[cfg(feature = "db")]
impl<T> From<DbError> for ErrorablePayload<T> {
    fn from(value: DbError) -> Self {
        match value {
            DbError::NotFound => Self::NotFound,
            DbError::WriteFailed => Self::Err("Write error".to_string()),
            _ => Self::Err("Database error".to_string()),
        }
    }
}

pub type SingleJobResponse = Job;

pub type JobListResponse = Vec<Job>;

pub type PartListResponse = Vec<Part>;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JobInformation {
    pub id: String,
}

pub type NewJobResponse = JobInformation;

pub type DeleteJobResponse = ();

// Request payloads

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JobCreationPayload {
    pub uri: String,
}
