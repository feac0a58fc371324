//! Cold-storage vault client.
//!
//! [`DirectoryVault`] keeps multipart uploads and finished archives under a
//! local directory, typically a mount of the cold-storage medium.

use std::{
    io::{self, SeekFrom},
    os::fd::{AsFd, AsRawFd},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use common::{data::ByteRange, hash_file, treehash::tree_hash};

use crate::files;
use nix::fcntl::posix_fallocate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncSeekExt, AsyncWriteExt},
    task::spawn_blocking,
};

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("vault I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid vault name {0:?}")]
    InvalidVault(String),
    #[error("no multipart upload {0}")]
    UnknownUpload(String),
    #[error("invalid part {range}: {reason}")]
    InvalidRange { range: ByteRange, reason: String },
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("archive size mismatch: expected {expected}, have {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("upload metadata unreadable: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartUpload {
    pub location: String,
    pub upload_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReceipt {
    pub archive_id: String,
    pub location: String,
    pub checksum: String,
}

#[async_trait]
pub trait Vault: Send + Sync {
    async fn initiate_multipart_upload(
        &self,
        vault: &str,
        part_size: u64,
    ) -> Result<MultipartUpload, VaultError>;

    /// Stores one part. Returns the tree hash the vault computed for it.
    async fn upload_part(
        &self,
        upload_id: &str,
        vault: &str,
        range: ByteRange,
        body: Vec<u8>,
        checksum: &str,
    ) -> Result<String, VaultError>;

    /// Assembles the archive. Completing an upload again returns the
    /// receipt of the first completion.
    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        vault: &str,
        total_size: u64,
        checksum: &str,
    ) -> Result<ArchiveReceipt, VaultError>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadMetadata {
    part_size: u64,
    /// Name the archive gets once the upload is completed.
    archive_id: String,
}

const METADATA_FILE: &str = "upload.json";
const DATA_FILE: &str = "archive";

pub struct DirectoryVault {
    root: PathBuf,
}

impl DirectoryVault {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn vault_dir(&self, vault: &str) -> Result<PathBuf, VaultError> {
        if vault.is_empty() || vault.contains(['/', '\\']) || vault.starts_with('.') {
            return Err(VaultError::InvalidVault(vault.to_string()));
        }
        Ok(self.root.join(vault))
    }

    fn upload_dir(&self, vault: &str, upload_id: &str) -> Result<PathBuf, VaultError> {
        if upload_id.is_empty() || upload_id.contains(['/', '\\', '.']) {
            return Err(VaultError::UnknownUpload(upload_id.to_string()));
        }
        Ok(self.vault_dir(vault)?.join("multipart").join(upload_id))
    }

    fn receipt_path(&self, vault: &str, upload_id: &str) -> Result<PathBuf, VaultError> {
        self.upload_dir(vault, upload_id)?;
        Ok(self
            .vault_dir(vault)?
            .join("completed")
            .join(format!("{upload_id}.json")))
    }

    async fn metadata(&self, dir: &Path, upload_id: &str) -> Result<UploadMetadata, VaultError> {
        match fs::read(dir.join(METADATA_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(VaultError::UnknownUpload(upload_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn invalid(range: ByteRange, reason: impl Into<String>) -> VaultError {
    VaultError::InvalidRange {
        range,
        reason: reason.into(),
    }
}

#[async_trait]
impl Vault for DirectoryVault {
    async fn initiate_multipart_upload(
        &self,
        vault: &str,
        part_size: u64,
    ) -> Result<MultipartUpload, VaultError> {
        let upload_id = uuid::Uuid::now_v7().simple().to_string();
        let dir = self.upload_dir(vault, &upload_id)?;
        fs::create_dir_all(&dir).await?;
        fs::write(
            dir.join(METADATA_FILE),
            serde_json::to_vec(&UploadMetadata {
                part_size,
                archive_id: uuid::Uuid::now_v7().simple().to_string(),
            })?,
        )
        .await?;
        log::info!("vault {vault}: initiated multipart upload {upload_id} ({part_size} byte parts)");
        Ok(MultipartUpload {
            location: format!("/{vault}/multipart-uploads/{upload_id}"),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        vault: &str,
        range: ByteRange,
        body: Vec<u8>,
        checksum: &str,
    ) -> Result<String, VaultError> {
        let dir = self.upload_dir(vault, upload_id)?;
        let meta = self.metadata(&dir, upload_id).await?;
        if range.is_empty() || range.len() != body.len() as u64 {
            return Err(invalid(range, format!("body has {} bytes", body.len())));
        }
        if range.start % meta.part_size != 0 || range.len() > meta.part_size {
            return Err(invalid(
                range,
                format!("not aligned to {} byte parts", meta.part_size),
            ));
        }
        let offset: i64 = range
            .start
            .try_into()
            .map_err(|_| invalid(range, "offset too large"))?;
        let len: i64 = range
            .len()
            .try_into()
            .map_err(|_| invalid(range, "part too large"))?;

        let (body, actual) = spawn_blocking(move || {
            let hash = tree_hash(&body);
            (body, hash)
        })
        .await?;
        if actual != checksum {
            return Err(VaultError::ChecksumMismatch {
                expected: checksum.to_string(),
                actual,
            });
        }

        let mut file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(DATA_FILE))
            .await?;
        let fd = file.as_fd().as_raw_fd();
        spawn_blocking(move || posix_fallocate(fd, offset, len))
            .await?
            .map_err(io::Error::from)?;
        file.seek(SeekFrom::Start(range.start)).await?;
        file.write_all(&body).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(actual)
    }

    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        vault: &str,
        total_size: u64,
        checksum: &str,
    ) -> Result<ArchiveReceipt, VaultError> {
        let dir = self.upload_dir(vault, upload_id)?;
        let record = self.receipt_path(vault, upload_id)?;
        match fs::read(&record).await {
            Ok(bytes) => {
                let receipt: ArchiveReceipt = serde_json::from_slice(&bytes)?;
                log::info!("vault {vault}: upload {upload_id} was already completed as {}", receipt.archive_id);
                return Ok(receipt);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let meta = self.metadata(&dir, upload_id).await?;
        let archives = self.vault_dir(vault)?.join("archives");
        let archive = archives.join(&meta.archive_id);
        let data = dir.join(DATA_FILE);
        // A previous attempt may have stopped after moving the archive.
        let moved = !files::file_exists(&data).await? && files::file_exists(&archive).await?;
        let source = if moved { archive.clone() } else { data.clone() };
        if !moved && total_size == 0 {
            File::options()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&data)
                .await?;
        }
        let actual_size = fs::metadata(&source).await?.len();
        if actual_size != total_size {
            return Err(VaultError::SizeMismatch {
                expected: total_size,
                actual: actual_size,
            });
        }
        let hash_path = source.clone();
        let actual = spawn_blocking(move || hash_file(std::fs::File::open(hash_path)?)).await??;
        if actual != checksum {
            return Err(VaultError::ChecksumMismatch {
                expected: checksum.to_string(),
                actual,
            });
        }

        if !moved {
            fs::create_dir_all(&archives).await?;
            fs::rename(&data, &archive).await?;
        }
        let receipt = ArchiveReceipt {
            location: format!("/{vault}/archives/{}", meta.archive_id),
            archive_id: meta.archive_id,
            checksum: actual,
        };
        if let Some(parent) = record.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&record, serde_json::to_vec(&receipt)?).await?;
        fs::remove_dir_all(&dir).await?;
        log::info!("vault {vault}: completed upload {upload_id} as archive {}", receipt.archive_id);
        Ok(receipt)
    }
}
