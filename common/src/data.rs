use std::{fmt, time::SystemTime};

use serde::{Deserialize, Serialize};

/// Seconds since the unix epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Pipeline step of a job. Only ever moves forward.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initialized,
    /// 7z is running on the remote host.
    Compressing,
    /// sha256sum is running on the remote host.
    Hashing,
    /// scp is copying the archive to the working directory.
    Transferring,
    /// The local copy is being hashed and compared with the remote digest.
    CheckingHash,
    /// Parts are being uploaded to the vault.
    Uploading,
    FinishingUpload,
    FinishedUpload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Initialized => "initialized",
            Stage::Compressing => "compressing",
            Stage::Hashing => "hashing",
            Stage::Transferring => "transferring",
            Stage::CheckingHash => "checking_hash",
            Stage::Uploading => "uploading",
            Stage::FinishingUpload => "finishing_upload",
            Stage::FinishedUpload => "finished_upload",
        };
        f.pad(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Eligible for processing.
    Ok,
    /// The archive is in the vault.
    Finished,
    /// Any marker an operator put on the job. Such jobs are left alone.
    #[serde(untagged)]
    Marked(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => f.write_str("ok"),
            Status::Finished => f.write_str("finished"),
            Status::Marked(s) => f.write_str(s),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Compression {
    pub password: String,
    pub archive_filename: String,
    pub log_filename: String,
    pub remote_pid: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hashing {
    pub hash_filename: String,
    pub remote_pid: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub local_filename: String,
    pub local_pid: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HashCheck {
    pub local_hash_filename: String,
    pub local_pid: u32,
}

/// Multipart upload bookkeeping. Filled in from `uploading` onwards.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    pub size: u64,
    pub part_size: u64,
    pub vault_upload_id: String,
    pub vault_location: String,
    pub tree_hash: Option<String>,
    /** Epoch of the process that last attempted completion */
    pub restart_epoch: Option<String>,
    pub archive_id: Option<String>,
    pub archive_location: Option<String>,
    pub checksum: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /** The primary key of the job */
    pub id: String,
    /** What to archive, as understood by 7z on the remote host */
    pub source_uri: String,
    pub stage: Stage,
    pub status: Status,
    pub created_at: u64,
    /** Last persisted change; a stale value on an `ok` job means it is stuck */
    pub updated_at: u64,

    pub compression: Option<Compression>,
    pub hashing: Option<Hashing>,
    pub transfer: Option<Transfer>,
    pub hash_check: Option<HashCheck>,
    pub upload: Option<Upload>,
}

impl Job {
    pub fn new(id: String, source_uri: String) -> Self {
        let now = now();
        Self {
            id,
            source_uri,
            stage: Stage::Initialized,
            status: Status::Ok,
            created_at: now,
            updated_at: now,
            compression: None,
            hashing: None,
            transfer: None,
            hash_check: None,
            upload: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn touch(&mut self) {
        self.updated_at = now();
    }
}

/// Inclusive byte range.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}", self.start, self.end)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartStatus {
    Initialized,
    Uploading,
    Succeeded,
    Failed,
}

impl fmt::Display for PartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                PartStatus::Initialized => "initialized",
                PartStatus::Uploading => "uploading",
                PartStatus::Succeeded => "succeeded",
                PartStatus::Failed => "failed",
            }
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: u64,
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /** Index of the part; also its position in the archive */
    pub id: u32,
    pub job_id: String,
    pub range: ByteRange,
    pub status: PartStatus,
    pub tree_hash: Option<String>,
    pub restart_epoch: Option<String>,
    /** Append-only audit trail */
    pub log: Vec<LogEntry>,
}

impl Part {
    pub fn new(job_id: String, id: u32, range: ByteRange) -> Self {
        let mut part = Self {
            id,
            job_id,
            range,
            status: PartStatus::Initialized,
            tree_hash: None,
            restart_epoch: None,
            log: Vec::new(),
        };
        part.record(format!("created for {range}"));
        part
    }

    pub fn record(&mut self, message: impl Into<String>) {
        self.record_at(now(), message);
    }

    pub fn record_at(&mut self, timestamp: u64, message: impl Into<String>) {
        self.log.push(LogEntry {
            timestamp,
            message: message.into(),
        });
    }

    pub fn last_activity(&self) -> Option<u64> {
        self.log.last().map(|entry| entry.timestamp)
    }
}
