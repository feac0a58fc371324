//! Test doubles shared by the server's unit tests.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use common::{
    data::ByteRange,
    db::{Database, DbError, Job, Part, Repository},
};

use crate::{
    gateway::{Gateway, GatewayError},
    vault::{ArchiveReceipt, MultipartUpload, Vault, VaultError},
};

/// Writes `size` patterned bytes to `dir/name`.
pub fn archive_file(dir: &Path, name: &str, size: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

/// Accepts uploads and never finishes them.
pub struct StalledVault;

#[async_trait]
impl Vault for StalledVault {
    async fn initiate_multipart_upload(
        &self,
        vault: &str,
        _part_size: u64,
    ) -> Result<MultipartUpload, VaultError> {
        Ok(MultipartUpload {
            location: format!("/{vault}/multipart-uploads/stalled"),
            upload_id: "stalled".to_string(),
        })
    }

    async fn upload_part(
        &self,
        _upload_id: &str,
        _vault: &str,
        _range: ByteRange,
        _body: Vec<u8>,
        _checksum: &str,
    ) -> Result<String, VaultError> {
        std::future::pending().await
    }

    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        _vault: &str,
        _total_size: u64,
        _checksum: &str,
    ) -> Result<ArchiveReceipt, VaultError> {
        Err(VaultError::UnknownUpload(upload_id.to_string()))
    }
}

type Script = Mutex<Vec<(String, Result<String, String>)>>;

/// Answers commands by the first scripted pattern they contain.
#[derive(Default)]
pub struct ScriptedGateway {
    remote: Script,
    local: Script,
    calls: Mutex<Vec<String>>,
    next_pid: AtomicU32,
}

fn set(script: &Script, pattern: &str, response: Result<String, String>) {
    let mut script = script.lock().unwrap();
    script.retain(|(p, _)| p != pattern);
    script.push((pattern.to_string(), response));
}

fn answer(script: &Script, command: &str) -> Result<String, GatewayError> {
    let script = script.lock().unwrap();
    match script.iter().find(|(p, _)| command.contains(p.as_str())) {
        Some((_, Ok(out))) => Ok(out.clone()),
        Some((_, Err(stderr))) => Err(GatewayError::Exit {
            command: command.to_string(),
            code: Some(1),
            stderr: stderr.clone(),
        }),
        None => Err(GatewayError::Exit {
            command: command.to_string(),
            code: Some(127),
            stderr: "unscripted".to_string(),
        }),
    }
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(9000),
            ..Default::default()
        }
    }

    pub fn remote(&self, pattern: &str, output: &str) -> &Self {
        set(&self.remote, pattern, Ok(output.to_string()));
        self
    }

    pub fn remote_fails(&self, pattern: &str) -> &Self {
        set(&self.remote, pattern, Err("connection refused".to_string()));
        self
    }

    pub fn local(&self, pattern: &str, output: &str) -> &Self {
        set(&self.local, pattern, Ok(output.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// The pid the next detached spawn will report.
    pub fn peek_pid(&self) -> u32 {
        self.next_pid.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn run_remote(&self, command: &str) -> Result<String, GatewayError> {
        self.calls.lock().unwrap().push(format!("remote: {command}"));
        answer(&self.remote, command)
    }

    async fn run_local(&self, command: &str) -> Result<String, GatewayError> {
        self.calls.lock().unwrap().push(format!("local: {command}"));
        answer(&self.local, command)
    }

    async fn spawn_detached_local(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<u32, GatewayError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("spawn: {} {}", program, args.join(" ")));
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }
}

/// In-memory repository whose job writes can be made to fail.
pub struct FlakyRepository {
    inner: Database,
    job_writes: Mutex<VecDeque<bool>>,
}

impl Default for FlakyRepository {
    fn default() -> Self {
        Self {
            inner: Database::open_in_memory().unwrap(),
            job_writes: Mutex::default(),
        }
    }
}

impl FlakyRepository {
    /// Upcoming `put_job` calls fail where the script says `true`; writes
    /// past the end of the script succeed.
    pub fn fail_job_writes(&self, script: impl IntoIterator<Item = bool>) {
        *self.job_writes.lock().unwrap() = script.into_iter().collect();
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn get_job(&self, id: &str) -> Result<Job, DbError> {
        self.inner.get_job(id).await
    }

    async fn put_job(&self, job: &Job) -> Result<(), DbError> {
        let fail = self.job_writes.lock().unwrap().pop_front().unwrap_or(false);
        if fail {
            return Err(DbError::WriteFailed);
        }
        self.inner.put_job(job).await
    }

    async fn delete_job(&self, id: &str) -> Result<(), DbError> {
        self.inner.delete_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, DbError> {
        self.inner.list_jobs().await
    }

    async fn put_part(&self, part: &Part) -> Result<(), DbError> {
        self.inner.put_part(part).await
    }

    async fn put_parts(&self, parts: &[Part]) -> Result<(), DbError> {
        self.inner.put_parts(parts).await
    }

    async fn get_part(&self, job_id: &str, part_id: u32) -> Result<Part, DbError> {
        self.inner.get_part(job_id, part_id).await
    }

    async fn list_parts(&self, job_id: &str) -> Result<Vec<Part>, DbError> {
        self.inner.list_parts(job_id).await
    }
}
