//! Multipart upload of a transferred archive.
//!
//! Parts are dispatched from scheduling passes, one pass per reconciler
//! tick, and never awaited there: each dispatched part gets its own task
//! that uploads it and records the outcome through [`on_part_uploaded`].
//! A part is stamped with the [`ProcessEpoch`] that dispatched it, so parts
//! left `uploading` by an earlier process are recognised and redone.

use std::{path::Path, sync::Arc};

use common::{
    db::{ByteRange, DbError, Job, Part, PartStatus, Repository, Upload},
    hash_file,
    treehash::tree_hash,
};
use tokio::task::{spawn_blocking, JoinHandle};

use crate::{
    error::{PartSizeError, PipelineError},
    files,
    vault::{Vault, VaultError},
};

pub const MIB: u64 = 1024 * 1024;
/// Most parts a vault accepts for one archive.
pub const MAX_PARTS: u64 = 10_000;
/// Largest part size, in MiB, that is still accepted.
pub const MAX_PART_SIZE_MULTIPLIER: u64 = 4000;

/// Smallest power-of-two multiple of 1 MiB that splits `size` bytes into at
/// most [`MAX_PARTS`] parts.
pub fn part_size_for(size: u64) -> Result<u64, PartSizeError> {
    let min_size = size.div_ceil(MAX_PARTS);
    if min_size < MIB {
        return Ok(MIB);
    }
    let multiplier = min_size
        .div_ceil(MIB)
        .checked_next_power_of_two()
        .ok_or(PartSizeError::TooLarge { size })?;
    if multiplier > MAX_PART_SIZE_MULTIPLIER {
        return Err(PartSizeError::TooLarge { size });
    }
    Ok(multiplier * MIB)
}

/// Contiguous ranges of at most `part_size` bytes covering `[0, size)`.
/// Empty when `part_size` is zero.
pub fn part_ranges(size: u64, part_size: u64) -> Vec<ByteRange> {
    let mut ranges = Vec::new();
    if part_size == 0 {
        return ranges;
    }
    let mut start = 0u64;
    while start < size {
        let end = start.saturating_add(part_size).min(size) - 1;
        ranges.push(ByteRange { start, end });
        start = end + 1;
    }
    ranges
}

/// Identifies one run of the server. Fixed at startup, only ever compared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessEpoch(String);

impl ProcessEpoch {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn stamped_on(&self, stamp: Option<&str>) -> bool {
        stamp == Some(self.0.as_str())
    }
}

impl Default for ProcessEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ProcessEpoch {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    pub vault_name: String,
    pub max_uploading_parts: usize,
    /// Seconds a failed part rests before it is tried again.
    pub retry_cooldown_secs: u64,
}

/// What one scheduling pass saw and did.
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub total: usize,
    pub succeeded: usize,
    /// Parts uploading under the current epoch, including the ones just dispatched.
    pub in_flight: usize,
    pub requeued: usize,
    pub retried: usize,
    /// Upload tasks started by this pass.
    pub dispatched: Vec<JoinHandle<()>>,
}

impl PassOutcome {
    pub fn complete(&self) -> bool {
        self.succeeded == self.total
    }
}

pub struct UploadScheduler {
    repo: Arc<dyn Repository>,
    vault: Arc<dyn Vault>,
    epoch: ProcessEpoch,
    settings: SchedulerSettings,
}

impl UploadScheduler {
    pub fn new(
        repo: Arc<dyn Repository>,
        vault: Arc<dyn Vault>,
        epoch: ProcessEpoch,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            repo,
            vault,
            epoch,
            settings,
        }
    }

    pub fn epoch(&self) -> &ProcessEpoch {
        &self.epoch
    }

    /// Starts the multipart upload and creates every part of the job.
    ///
    /// Fails before anything is written if the archive is too large.
    pub async fn initiate(&self, job: &mut Job, archive: &Path) -> Result<(), PipelineError> {
        let size = files::file_size(archive)
            .await
            .map_err(|e| PipelineError::io(archive, e))?;
        let part_size = part_size_for(size)?;
        let multipart = self
            .vault
            .initiate_multipart_upload(&self.settings.vault_name, part_size)
            .await?;

        let parts: Vec<Part> = part_ranges(size, part_size)
            .into_iter()
            .enumerate()
            .map(|(idx, range)| Part::new(job.id.clone(), idx as u32, range))
            .collect();
        self.repo.put_parts(&parts).await?;
        log::info!(
            "job {}: upload {} of {size} bytes in {} parts of {part_size}",
            job.id,
            multipart.upload_id,
            parts.len()
        );

        job.upload = Some(Upload {
            size,
            part_size,
            vault_upload_id: multipart.upload_id,
            vault_location: multipart.location,
            tree_hash: None,
            restart_epoch: None,
            archive_id: None,
            archive_location: None,
            checksum: None,
        });
        Ok(())
    }

    /// One scheduling pass over the parts of `job`, at time `now`.
    pub async fn run_pass(
        &self,
        job: &Job,
        archive: &Path,
        now: u64,
    ) -> Result<PassOutcome, PipelineError> {
        let upload = job.upload.as_ref().ok_or_else(|| PipelineError::MissingRecord {
            job: job.id.clone(),
            stage: job.stage,
            record: "upload",
        })?;
        let parts = self.repo.list_parts(&job.id).await?;
        let mut outcome = PassOutcome {
            total: parts.len(),
            ..Default::default()
        };

        let mut ready = Vec::new();
        for mut part in parts {
            match part.status {
                PartStatus::Succeeded => outcome.succeeded += 1,
                PartStatus::Uploading if self.epoch.stamped_on(part.restart_epoch.as_deref()) => {
                    outcome.in_flight += 1;
                }
                PartStatus::Uploading => {
                    let previous = part.restart_epoch.take().unwrap_or_default();
                    part.status = PartStatus::Initialized;
                    part.record_at(
                        now,
                        format!("requeued after restart: dispatched by process {previous}"),
                    );
                    self.repo.put_part(&part).await?;
                    log::info!("job {}: part {} requeued after restart", job.id, part.id);
                    outcome.requeued += 1;
                }
                PartStatus::Failed => {
                    let rested = part
                        .last_activity()
                        .map_or(true, |t| now >= t.saturating_add(self.settings.retry_cooldown_secs));
                    if rested {
                        part.status = PartStatus::Initialized;
                        part.record_at(now, "retrying after failure");
                        self.repo.put_part(&part).await?;
                        log::info!("job {}: retrying failed part {}", job.id, part.id);
                        outcome.retried += 1;
                    }
                }
                PartStatus::Initialized => ready.push(part),
            }
        }

        // Every part still uploading under this epoch is counted before any
        // new dispatch. Requeued and retried parts go out from the next pass.
        for part in ready {
            if outcome.in_flight >= self.settings.max_uploading_parts {
                break;
            }
            let handle = self.dispatch(upload, archive, part, now).await?;
            outcome.dispatched.push(handle);
            outcome.in_flight += 1;
        }
        Ok(outcome)
    }

    async fn dispatch(
        &self,
        upload: &Upload,
        archive: &Path,
        mut part: Part,
        now: u64,
    ) -> Result<JoinHandle<()>, PipelineError> {
        let body = files::read_range(archive, part.range)
            .await
            .map_err(|e| PipelineError::io(archive, e))?;
        let (body, checksum) = match part.tree_hash.clone() {
            Some(hash) => (body, hash),
            None => {
                let (body, hash) = spawn_blocking(move || {
                    let hash = tree_hash(&body);
                    (body, hash)
                })
                .await?;
                part.tree_hash = Some(hash.clone());
                (body, hash)
            }
        };

        part.status = PartStatus::Uploading;
        part.restart_epoch = Some(self.epoch.as_str().to_string());
        part.record_at(now, format!("dispatched {} ({checksum})", part.range));
        self.repo.put_part(&part).await?;
        log::debug!("job {}: dispatched part {}", part.job_id, part.id);

        let repo = Arc::clone(&self.repo);
        let vault = Arc::clone(&self.vault);
        let upload_id = upload.vault_upload_id.clone();
        let vault_name = self.settings.vault_name.clone();
        let Part {
            job_id, id, range, ..
        } = part;
        Ok(tokio::spawn(async move {
            let result = vault
                .upload_part(&upload_id, &vault_name, range, body, &checksum)
                .await;
            if let Err(e) = on_part_uploaded(repo.as_ref(), &job_id, id, result).await {
                log::error!("job {job_id}: could not record outcome of part {id}: {e}");
            }
        }))
    }

    /// Verifies the whole archive and completes the upload in the vault.
    /// `job.upload` only changes once the vault has accepted the archive.
    pub async fn complete(&self, job: &mut Job, archive: &Path) -> Result<(), PipelineError> {
        let upload = job.upload.as_mut().ok_or_else(|| PipelineError::MissingRecord {
            job: job.id.clone(),
            stage: job.stage,
            record: "upload",
        })?;
        let path = archive.to_path_buf();
        let tree = spawn_blocking(move || hash_file(std::fs::File::open(path)?))
            .await?
            .map_err(|e| PipelineError::io(archive, e))?;
        let receipt = self
            .vault
            .complete_multipart_upload(
                &upload.vault_upload_id,
                &self.settings.vault_name,
                upload.size,
                &tree,
            )
            .await?;
        if receipt.checksum != tree {
            return Err(PipelineError::ChecksumMismatch {
                expected: tree,
                actual: receipt.checksum,
            });
        }
        log::info!(
            "job {}: archive {} stored at {}",
            job.id,
            receipt.archive_id,
            receipt.location
        );
        upload.tree_hash = Some(tree);
        upload.archive_id = Some(receipt.archive_id);
        upload.archive_location = Some(receipt.location);
        upload.checksum = Some(receipt.checksum);
        Ok(())
    }
}

/// Records the outcome of one part upload. Only ever touches that part.
pub async fn on_part_uploaded(
    repo: &dyn Repository,
    job_id: &str,
    part_id: u32,
    result: Result<String, VaultError>,
) -> Result<PartStatus, DbError> {
    let mut part = repo.get_part(job_id, part_id).await?;
    match result {
        Err(e) => {
            log::warn!("job {job_id}: part {part_id} failed: {e}");
            part.status = PartStatus::Failed;
            part.record(format!("upload failed: {e}"));
        }
        Ok(checksum) if part.tree_hash.as_deref() == Some(checksum.as_str()) => {
            log::debug!("job {job_id}: part {part_id} uploaded");
            part.status = PartStatus::Succeeded;
            part.record("upload succeeded");
        }
        Ok(checksum) => {
            log::warn!("job {job_id}: part {part_id} came back with checksum {checksum}");
            part.status = PartStatus::Failed;
            part.record(format!(
                "vault checksum {checksum} does not match {}",
                part.tree_hash.as_deref().unwrap_or("(none)")
            ));
        }
    }
    repo.put_part(&part).await?;
    Ok(part.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{archive_file, StalledVault};
    use crate::vault::DirectoryVault;
    use common::db::{Database, Stage};

    const NOW: u64 = 1_700_000_000;

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: Arc<Database>,
        archive: std::path::PathBuf,
        vault_root: std::path::PathBuf,
    }

    fn fixture(size: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_file(dir.path(), "job.7z", size);
        let vault_root = dir.path().join("vault");
        Fixture {
            repo: Arc::new(Database::open_in_memory().unwrap()),
            archive,
            vault_root,
            _dir: dir,
        }
    }

    fn scheduler(
        repo: Arc<Database>,
        vault: Arc<dyn Vault>,
        epoch: &str,
        max: usize,
    ) -> UploadScheduler {
        UploadScheduler::new(
            repo,
            vault,
            ProcessEpoch::from(epoch),
            SchedulerSettings {
                vault_name: "photos".to_string(),
                max_uploading_parts: max,
                retry_cooldown_secs: 600,
            },
        )
    }

    async fn uploading_job(s: &UploadScheduler, archive: &Path) -> Job {
        let mut job = Job::new("job-1".to_string(), "/srv/photos".to_string());
        job.stage = Stage::CheckingHash;
        s.initiate(&mut job, archive).await.unwrap();
        job.stage = Stage::Uploading;
        job
    }

    async fn statuses(repo: &Database, job: &str) -> Vec<PartStatus> {
        repo.list_parts(job)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.status)
            .collect()
    }

    #[test]
    fn part_size_examples() {
        assert_eq!(part_size_for(20000 * MIB), Ok(2 * MIB));
        assert_eq!(part_size_for(20005 * MIB), Ok(4 * MIB));
        assert_eq!(part_size_for(40589 * MIB), Ok(8 * MIB));
        assert_eq!(part_size_for(200), Ok(MIB));
        assert_eq!(part_size_for(0), Ok(MIB));
        assert_eq!(
            part_size_for(5000 * 10000 * MIB),
            Err(PartSizeError::TooLarge {
                size: 5000 * 10000 * MIB
            })
        );
    }

    #[test]
    fn part_size_properties() {
        let mut size = 1u64;
        while size < 30_000_000 * MIB {
            match part_size_for(size) {
                Ok(part_size) => {
                    let multiplier = part_size / MIB;
                    assert_eq!(part_size % MIB, 0);
                    assert!(multiplier.is_power_of_two(), "{size}: {multiplier}");
                    assert!((1..=MAX_PART_SIZE_MULTIPLIER).contains(&multiplier));
                    assert!(size.div_ceil(part_size) <= MAX_PARTS, "{size}");
                }
                Err(PartSizeError::TooLarge { .. }) => {
                    assert!(size.div_ceil(MAX_PARTS).div_ceil(MIB) > 2048, "{size}");
                }
            }
            size = size * 3 + 7;
        }
    }

    #[test]
    fn ranges_partition_the_file() {
        assert_eq!(
            part_ranges(1294664, MIB),
            vec![
                ByteRange { start: 0, end: 1048575 },
                ByteRange { start: 1048576, end: 1294663 }
            ]
        );
        assert!(part_ranges(0, MIB).is_empty());
        assert!(part_ranges(10, 0).is_empty());
        assert_eq!(
            part_ranges(u64::MAX, u64::MAX / 2 + 1),
            vec![
                ByteRange { start: 0, end: u64::MAX / 2 },
                ByteRange { start: u64::MAX / 2 + 1, end: u64::MAX - 1 }
            ]
        );
        for (size, part_size) in [(1, 1), (10, 3), (9, 3), (7, 100), (5 * MIB + 1, MIB)] {
            let ranges = part_ranges(size, part_size);
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges.last().unwrap().end, size - 1);
            assert!(ranges.iter().all(|r| r.len() <= part_size && !r.is_empty()));
            assert!(ranges.windows(2).all(|w| w[1].start == w[0].end + 1));
            assert_eq!(ranges.iter().map(|r| r.len()).sum::<u64>(), size);
        }
    }

    #[test]
    fn epochs_compare_by_value() {
        let epoch = ProcessEpoch::from("e1");
        assert!(epoch.stamped_on(Some("e1")));
        assert!(!epoch.stamped_on(Some("e0")));
        assert!(!epoch.stamped_on(None));
        assert_ne!(ProcessEpoch::new(), ProcessEpoch::new());
    }

    #[tokio::test]
    async fn initiate_creates_every_part() {
        let f = fixture(1294664);
        let s = scheduler(f.repo.clone(), Arc::new(DirectoryVault::new(f.vault_root.clone())), "e1", 8);
        let job = uploading_job(&s, &f.archive).await;

        let upload = job.upload.as_ref().unwrap();
        assert_eq!(upload.size, 1294664);
        assert_eq!(upload.part_size, MIB);
        let parts = f.repo.list_parts(&job.id).await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].range, ByteRange { start: 1048576, end: 1294663 });
        assert!(parts.iter().all(|p| p.status == PartStatus::Initialized && p.log.len() == 1));
    }

    #[tokio::test]
    async fn uploads_every_part_and_completes() {
        let f = fixture(2 * MIB as usize + MIB as usize / 2);
        let s = scheduler(f.repo.clone(), Arc::new(DirectoryVault::new(f.vault_root.clone())), "e1", 8);
        let mut job = uploading_job(&s, &f.archive).await;

        let outcome = s.run_pass(&job, &f.archive, NOW).await.unwrap();
        assert_eq!(outcome.dispatched.len(), 3);
        assert!(!outcome.complete());
        for handle in outcome.dispatched {
            handle.await.unwrap();
        }
        assert_eq!(statuses(&f.repo, &job.id).await, vec![PartStatus::Succeeded; 3]);
        for part in f.repo.list_parts(&job.id).await.unwrap() {
            assert!(part.tree_hash.is_some());
            assert_eq!(part.log.len(), 3);
        }

        let outcome = s.run_pass(&job, &f.archive, NOW).await.unwrap();
        assert!(outcome.complete());
        assert!(outcome.dispatched.is_empty());

        s.complete(&mut job, &f.archive).await.unwrap();
        let upload = job.upload.unwrap();
        let expected = hash_file(std::fs::File::open(&f.archive).unwrap()).unwrap();
        assert_eq!(upload.tree_hash.as_deref(), Some(expected.as_str()));
        assert_eq!(upload.checksum.as_deref(), Some(expected.as_str()));
        assert!(upload.archive_id.is_some());
    }

    #[tokio::test]
    async fn never_more_than_the_cap_in_flight() {
        let f = fixture(5 * MIB as usize);
        let s = scheduler(f.repo.clone(), Arc::new(StalledVault), "e1", 2);
        let job = uploading_job(&s, &f.archive).await;

        let outcome = s.run_pass(&job, &f.archive, NOW).await.unwrap();
        assert_eq!(outcome.dispatched.len(), 2);
        assert_eq!(outcome.in_flight, 2);
        assert_eq!(
            statuses(&f.repo, &job.id).await,
            [
                PartStatus::Uploading,
                PartStatus::Uploading,
                PartStatus::Initialized,
                PartStatus::Initialized,
                PartStatus::Initialized
            ]
        );

        let outcome = s.run_pass(&job, &f.archive, NOW + 10).await.unwrap();
        assert!(outcome.dispatched.is_empty());
        assert_eq!(outcome.in_flight, 2);
    }

    #[tokio::test]
    async fn retried_part_waits_for_a_free_slot() {
        let f = fixture(3 * MIB as usize);
        let s = scheduler(f.repo.clone(), Arc::new(StalledVault), "e1", 2);
        let job = uploading_job(&s, &f.archive).await;
        s.run_pass(&job, &f.archive, NOW).await.unwrap();

        // part 0 fails while part 1 is still in flight, part 2 takes its slot
        let mut part = f.repo.get_part(&job.id, 0).await.unwrap();
        part.status = PartStatus::Failed;
        part.record_at(NOW, "upload failed: boom");
        f.repo.put_part(&part).await.unwrap();
        let outcome = s.run_pass(&job, &f.archive, NOW + 1).await.unwrap();
        assert_eq!(outcome.dispatched.len(), 1);
        assert_eq!(
            statuses(&f.repo, &job.id).await,
            [PartStatus::Failed, PartStatus::Uploading, PartStatus::Uploading]
        );

        for at in [NOW + 700, NOW + 701] {
            let outcome = s.run_pass(&job, &f.archive, at).await.unwrap();
            assert!(outcome.dispatched.is_empty());
            assert_eq!(outcome.in_flight, 2);
        }
        assert_eq!(
            statuses(&f.repo, &job.id).await,
            [PartStatus::Initialized, PartStatus::Uploading, PartStatus::Uploading]
        );
    }

    #[tokio::test]
    async fn parts_from_a_previous_process_are_requeued() {
        let f = fixture(3 * MIB as usize);
        let before = scheduler(f.repo.clone(), Arc::new(StalledVault), "old", 8);
        let job = uploading_job(&before, &f.archive).await;
        before.run_pass(&job, &f.archive, NOW).await.unwrap();
        assert_eq!(statuses(&f.repo, &job.id).await, vec![PartStatus::Uploading; 3]);

        // a cap of one must not keep stale parts from being requeued
        let after = scheduler(f.repo.clone(), Arc::new(StalledVault), "new", 1);
        let outcome = after.run_pass(&job, &f.archive, NOW + 5).await.unwrap();
        assert_eq!(outcome.requeued, 3);
        assert_eq!(outcome.in_flight, 0);
        assert!(outcome.dispatched.is_empty());
        for part in f.repo.list_parts(&job.id).await.unwrap() {
            assert_eq!(part.status, PartStatus::Initialized);
            assert!(part.log.last().unwrap().message.contains("restart"));
        }

        let outcome = after.run_pass(&job, &f.archive, NOW + 10).await.unwrap();
        assert_eq!(outcome.dispatched.len(), 1);
        let restamped = f.repo.get_part(&job.id, 0).await.unwrap();
        assert_eq!(restamped.restart_epoch.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn failed_parts_rest_before_retry() {
        let f = fixture(MIB as usize);
        let s = scheduler(f.repo.clone(), Arc::new(StalledVault), "e1", 8);
        let job = uploading_job(&s, &f.archive).await;

        let mut part = f.repo.get_part(&job.id, 0).await.unwrap();
        part.status = PartStatus::Failed;
        part.record_at(NOW, "upload failed: boom");
        f.repo.put_part(&part).await.unwrap();

        let outcome = s.run_pass(&job, &f.archive, NOW + 599).await.unwrap();
        assert_eq!(outcome.retried, 0);
        assert_eq!(statuses(&f.repo, &job.id).await, [PartStatus::Failed]);

        let outcome = s.run_pass(&job, &f.archive, NOW + 600).await.unwrap();
        assert_eq!(outcome.retried, 1);
        assert_eq!(statuses(&f.repo, &job.id).await, [PartStatus::Initialized]);
        assert!(!outcome.complete());
    }

    #[tokio::test]
    async fn callback_outcomes() {
        let repo = Database::open_in_memory().unwrap();
        let mut part = Part::new("j".to_string(), 0, ByteRange { start: 0, end: 9 });
        part.status = PartStatus::Uploading;
        part.tree_hash = Some("abc".to_string());
        repo.put_part(&part).await.unwrap();

        let status = on_part_uploaded(&repo, "j", 0, Ok("abd".to_string())).await.unwrap();
        assert_eq!(status, PartStatus::Failed);
        let status = on_part_uploaded(&repo, "j", 0, Err(VaultError::UnknownUpload("u".to_string())))
            .await
            .unwrap();
        assert_eq!(status, PartStatus::Failed);
        let status = on_part_uploaded(&repo, "j", 0, Ok("abc".to_string())).await.unwrap();
        assert_eq!(status, PartStatus::Succeeded);

        let stored = repo.get_part("j", 0).await.unwrap();
        assert_eq!(stored.log.len(), 4);
        assert!(stored.log[1].message.contains("does not match"));
        assert!(matches!(
            on_part_uploaded(&repo, "j", 9, Ok("abc".to_string())).await,
            Err(DbError::NotFound)
        ));
    }

    #[tokio::test]
    async fn missing_archive_is_an_io_error() {
        let f = fixture(10);
        let s = scheduler(f.repo.clone(), Arc::new(StalledVault), "e1", 8);
        let mut job = Job::new("j".to_string(), "x".to_string());
        let err = s
            .initiate(&mut job, &f.archive.with_extension("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
        assert!(job.upload.is_none());
        assert!(f.repo.list_parts("j").await.unwrap().is_empty());
    }
}
