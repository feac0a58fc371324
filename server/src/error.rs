use std::path::PathBuf;

use common::db::{DbError, Stage};
use thiserror::Error;

use crate::{gateway::GatewayError, vault::VaultError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Remote operation failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Repository error: {0}")]
    Repository(#[from] DbError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error(transparent)]
    PartSize(#[from] PartSizeError),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No process id in output of `{command}`: {output:?}")]
    ProcessId { command: String, output: String },

    #[error("Job {job} is {stage} but has no {record} record")]
    MissingRecord {
        job: String,
        stage: Stage,
        record: &'static str,
    },

    #[error("Archive checksum mismatch: computed {expected}, vault returned {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartSizeError {
    #[error("File too large: {size} bytes cannot be split into at most 10000 parts")]
    TooLarge { size: u64 },
}
