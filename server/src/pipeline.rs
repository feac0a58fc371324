//! Per-job state machine.
//!
//! Each call to [`Pipeline::advance`] performs at most one externally
//! visible action for a job. Long-running work (7z, sha256sum, scp) runs in
//! the background and is only ever observed by probing it again on a later
//! tick: log tails, process tables, file existence.

use std::{path::PathBuf, sync::Arc};

use common::db::{
    now, Compression, HashCheck, Hashing, Job, Repository, Stage, Status, Transfer,
};
use rand::{distributions::Alphanumeric, Rng};

use crate::{
    config::SshConfig,
    error::PipelineError,
    files,
    gateway::{parse_pid, pid_listed, Gateway},
    scheduler::UploadScheduler,
};

/// Last line 7z writes to its log when an archive was created successfully.
pub const COMPRESSION_SENTINEL: &str = "Everything is Ok\n";
const PASSWORD_LENGTH: usize = 20;
const PS_COMMAND: &str = "ps -Ao pid";

/// Result of probing a background operation.
#[derive(Debug, PartialEq, Eq)]
pub enum Probe {
    Pending,
    Done,
    /// The operation is over but did not produce what the next stage needs.
    Divergent(String),
}

/// What one call to [`Pipeline::advance`] did.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Advanced(Stage),
    Waiting,
    /// Nothing will change without an operator.
    Stalled(String),
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Where archives are copied to and hashed.
    pub working_directory: PathBuf,
    pub ssh: SshConfig,
}

pub struct Pipeline {
    repo: Arc<dyn Repository>,
    gateway: Arc<dyn Gateway>,
    scheduler: UploadScheduler,
    settings: PipelineSettings,
}

fn random_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// Single-quotes `s` for a POSIX shell.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn first_token(s: &str) -> Option<&str> {
    s.split_whitespace().next()
}

fn required<'a, T>(
    job: &Job,
    record: &'a Option<T>,
    name: &'static str,
) -> Result<&'a T, PipelineError> {
    record.as_ref().ok_or_else(|| PipelineError::MissingRecord {
        job: job.id.clone(),
        stage: job.stage,
        record: name,
    })
}

impl Pipeline {
    pub fn new(
        repo: Arc<dyn Repository>,
        gateway: Arc<dyn Gateway>,
        scheduler: UploadScheduler,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            repo,
            gateway,
            scheduler,
            settings,
        }
    }

    /// Moves `job` along by at most one stage and persists the result.
    pub async fn advance(&self, job: &mut Job) -> Result<Step, PipelineError> {
        match job.stage {
            Stage::Initialized => {
                self.start_compression(job).await?;
                self.transition(job, Stage::Compressing).await
            }
            Stage::Compressing => match self.probe_compression(job).await? {
                Probe::Done => {
                    self.start_hashing(job).await?;
                    self.transition(job, Stage::Hashing).await
                }
                other => Ok(hold(job, other)),
            },
            Stage::Hashing => match self.probe_hashing(job).await? {
                Probe::Done => {
                    self.start_transfer(job).await?;
                    self.transition(job, Stage::Transferring).await
                }
                other => Ok(hold(job, other)),
            },
            Stage::Transferring => match self.probe_transfer(job).await? {
                Probe::Done => {
                    self.start_hash_check(job).await?;
                    self.transition(job, Stage::CheckingHash).await
                }
                other => Ok(hold(job, other)),
            },
            Stage::CheckingHash => match self.probe_hash_check(job).await? {
                Probe::Done => {
                    let archive = self.local_archive(job)?;
                    self.scheduler.initiate(job, &archive).await?;
                    self.transition(job, Stage::Uploading).await
                }
                other => Ok(hold(job, other)),
            },
            Stage::Uploading => {
                let archive = self.local_archive(job)?;
                let outcome = self.scheduler.run_pass(job, &archive, now()).await?;
                log::debug!(
                    "job {}: {}/{} parts done, {} in flight ({} new), {} requeued, {} retried",
                    job.id,
                    outcome.succeeded,
                    outcome.total,
                    outcome.in_flight,
                    outcome.dispatched.len(),
                    outcome.requeued,
                    outcome.retried
                );
                if outcome.complete() {
                    self.transition(job, Stage::FinishingUpload).await
                } else {
                    Ok(Step::Waiting)
                }
            }
            Stage::FinishingUpload => self.finish(job).await,
            Stage::FinishedUpload => Ok(Step::Waiting),
        }
    }

    async fn transition(&self, job: &mut Job, to: Stage) -> Result<Step, PipelineError> {
        let from = job.stage;
        job.stage = to;
        if to == Stage::FinishedUpload {
            job.status = Status::Finished;
        }
        job.touch();
        self.repo.put_job(job).await?;
        log::info!("job {}: {from} -> {to}", job.id);
        Ok(Step::Advanced(to))
    }

    async fn remote_pid(&self, command: &str, label: &str) -> Result<u32, PipelineError> {
        let output = self.gateway.run_remote(command).await?;
        parse_pid(&output).ok_or_else(|| PipelineError::ProcessId {
            command: label.to_string(),
            output,
        })
    }

    async fn remote_pid_running(&self, pid: u32) -> Result<bool, PipelineError> {
        Ok(pid_listed(&self.gateway.run_remote(PS_COMMAND).await?, pid))
    }

    async fn local_pid_running(&self, pid: u32) -> Result<bool, PipelineError> {
        Ok(pid_listed(&self.gateway.run_local(PS_COMMAND).await?, pid))
    }

    async fn remote_file_exists(&self, filename: &str) -> Result<bool, PipelineError> {
        let output = self
            .gateway
            .run_remote(&format!("ls -1 {} 2>/dev/null || true", quote(filename)))
            .await?;
        Ok(output.lines().any(|line| line.trim() == filename))
    }

    fn local_archive(&self, job: &Job) -> Result<PathBuf, PipelineError> {
        Ok(PathBuf::from(
            &required(job, &job.transfer, "transfer")?.local_filename,
        ))
    }

    async fn start_compression(&self, job: &mut Job) -> Result<(), PipelineError> {
        let password = random_password();
        let archive_filename = format!("{}.7z", job.id);
        let log_filename = format!("{}.log", job.id);
        let command = format!(
            "7z a -t7z -mhe=on -p{password} {} {} </dev/null >{} 2>&1 & echo $!",
            quote(&archive_filename),
            quote(&job.source_uri),
            quote(&log_filename),
        );
        let remote_pid = self.remote_pid(&command, "7z a").await?;
        job.compression = Some(Compression {
            password,
            archive_filename,
            log_filename,
            remote_pid,
        });
        Ok(())
    }

    async fn probe_compression(&self, job: &Job) -> Result<Probe, PipelineError> {
        let compression = required(job, &job.compression, "compression")?;
        let last_line = self
            .gateway
            .run_remote(&format!("tail -n 1 {}", quote(&compression.log_filename)))
            .await?;
        if last_line == COMPRESSION_SENTINEL {
            return Ok(Probe::Done);
        }
        if self.remote_pid_running(compression.remote_pid).await? {
            return Ok(Probe::Pending);
        }
        Ok(Probe::Divergent(format!(
            "7z ({}) exited, last log line {:?}",
            compression.remote_pid, last_line
        )))
    }

    async fn start_hashing(&self, job: &mut Job) -> Result<(), PipelineError> {
        let compression = required(job, &job.compression, "compression")?;
        let hash_filename = format!("{}.sha256", job.id);
        let command = format!(
            "sha256sum -b {} </dev/null >{} 2>&1 & echo $!",
            quote(&compression.archive_filename),
            quote(&hash_filename),
        );
        let remote_pid = self.remote_pid(&command, "sha256sum").await?;
        job.hashing = Some(Hashing {
            hash_filename,
            remote_pid,
        });
        Ok(())
    }

    async fn probe_hashing(&self, job: &Job) -> Result<Probe, PipelineError> {
        let hashing = required(job, &job.hashing, "hashing")?;
        if self.remote_pid_running(hashing.remote_pid).await? {
            return Ok(Probe::Pending);
        }
        if self.remote_file_exists(&hashing.hash_filename).await? {
            Ok(Probe::Done)
        } else {
            Ok(Probe::Divergent(format!(
                "sha256sum ({}) is gone but {} is missing",
                hashing.remote_pid, hashing.hash_filename
            )))
        }
    }

    async fn start_transfer(&self, job: &mut Job) -> Result<(), PipelineError> {
        let compression = required(job, &job.compression, "compression")?;
        let local = self
            .settings
            .working_directory
            .join(&compression.archive_filename);
        let local_filename = local.to_string_lossy().into_owned();
        let ssh = &self.settings.ssh;
        let args = vec![
            "-i".to_string(),
            ssh.id_file.to_string_lossy().into_owned(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            format!("{}:{}", ssh.destination(), compression.archive_filename),
            local_filename.clone(),
        ];
        let local_pid = self.gateway.spawn_detached_local("scp", &args).await?;
        job.transfer = Some(Transfer {
            local_filename,
            local_pid,
        });
        Ok(())
    }

    async fn probe_transfer(&self, job: &Job) -> Result<Probe, PipelineError> {
        let transfer = required(job, &job.transfer, "transfer")?;
        if self.local_pid_running(transfer.local_pid).await? {
            return Ok(Probe::Pending);
        }
        let local = PathBuf::from(&transfer.local_filename);
        if files::file_exists(&local)
            .await
            .map_err(|e| PipelineError::io(&local, e))?
        {
            Ok(Probe::Done)
        } else {
            Ok(Probe::Divergent(format!(
                "scp ({}) is gone but {} is missing",
                transfer.local_pid, transfer.local_filename
            )))
        }
    }

    async fn start_hash_check(&self, job: &mut Job) -> Result<(), PipelineError> {
        let transfer = required(job, &job.transfer, "transfer")?;
        let local_hash_filename = format!("{}.sha256", transfer.local_filename);
        let args = vec![
            "-c".to_string(),
            format!(
                "sha256sum -b {} > {}",
                quote(&transfer.local_filename),
                quote(&local_hash_filename)
            ),
        ];
        let local_pid = self.gateway.spawn_detached_local("sh", &args).await?;
        job.hash_check = Some(HashCheck {
            local_hash_filename,
            local_pid,
        });
        Ok(())
    }

    async fn probe_hash_check(&self, job: &Job) -> Result<Probe, PipelineError> {
        let hash_check = required(job, &job.hash_check, "hash check")?;
        let hashing = required(job, &job.hashing, "hashing")?;
        if self.local_pid_running(hash_check.local_pid).await? {
            return Ok(Probe::Pending);
        }
        let local_path = PathBuf::from(&hash_check.local_hash_filename);
        let cat = format!("cat {}", quote(&hashing.hash_filename));
        let (local, remote) = tokio::try_join!(
            async {
                tokio::fs::read_to_string(&local_path)
                    .await
                    .map_err(|e| PipelineError::io(&local_path, e))
            },
            async { self.gateway.run_remote(&cat).await.map_err(PipelineError::from) },
        )?;
        match (first_token(&local), first_token(&remote)) {
            (Some(l), Some(r)) if l == r => Ok(Probe::Done),
            (l, r) => Ok(Probe::Divergent(format!(
                "local digest {} does not match remote digest {}",
                l.unwrap_or("(empty)"),
                r.unwrap_or("(empty)")
            ))),
        }
    }

    /// Completes the vault upload once per process run. The epoch stamp is
    /// written before the vault is called and cleared again if it fails.
    async fn finish(&self, job: &mut Job) -> Result<Step, PipelineError> {
        let epoch = self.scheduler.epoch().clone();
        let upload = job.upload.as_mut().ok_or_else(|| PipelineError::MissingRecord {
            job: job.id.clone(),
            stage: job.stage,
            record: "upload",
        })?;
        if epoch.stamped_on(upload.restart_epoch.as_deref()) {
            return Ok(Step::Waiting);
        }
        upload.restart_epoch = Some(epoch.as_str().to_string());
        job.touch();
        self.repo.put_job(job).await?;

        let archive = self.local_archive(job)?;
        let outcome = match self.scheduler.complete(job, &archive).await {
            Ok(()) => self.transition(job, Stage::FinishedUpload).await,
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            job.stage = Stage::FinishingUpload;
            job.status = Status::Ok;
            if let Some(upload) = job.upload.as_mut() {
                upload.restart_epoch = None;
            }
            if let Err(db) = self.repo.put_job(job).await {
                log::error!("job {}: could not clear completion stamp: {db}", job.id);
            }
        }
        outcome
    }
}

fn hold(job: &Job, probe: Probe) -> Step {
    match probe {
        Probe::Divergent(reason) => {
            log::warn!("job {} stalled in {}: {reason}", job.id, job.stage);
            Step::Stalled(reason)
        }
        Probe::Pending | Probe::Done => Step::Waiting,
    }
}
