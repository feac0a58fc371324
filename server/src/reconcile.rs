//! Periodic driver: every tick, every active job gets one step of its own.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use common::db::{DbError, Repository};
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use crate::pipeline::{Pipeline, Step};

type Processing = Arc<Mutex<HashSet<String>>>;

/// Marks a job as being worked on until dropped.
struct ProcessingGuard {
    id: String,
    processing: Processing,
}

impl ProcessingGuard {
    fn acquire(processing: &Processing, id: &str) -> Option<Self> {
        let mut set = processing.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            processing: Arc::clone(processing),
        })
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.processing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct Reconciler {
    repo: Arc<dyn Repository>,
    pipeline: Arc<Pipeline>,
    processing: Processing,
}

impl Reconciler {
    pub fn new(repo: Arc<dyn Repository>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            repo,
            pipeline,
            processing: Arc::default(),
        }
    }

    /// Starts one step for every active job that is not still busy from an
    /// earlier tick. Returns without waiting for any of them.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>, DbError> {
        let jobs = self.repo.list_jobs().await?;
        let total = jobs.len();
        let mut handles = Vec::new();
        for mut job in jobs.into_iter().filter(|job| job.is_active()) {
            let Some(guard) = ProcessingGuard::acquire(&self.processing, &job.id) else {
                log::debug!("job {} is still being processed, skipping", job.id);
                continue;
            };
            let pipeline = Arc::clone(&self.pipeline);
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                match pipeline.advance(&mut job).await {
                    Ok(Step::Advanced(_)) | Ok(Step::Waiting) => {}
                    Ok(Step::Stalled(reason)) => {
                        log::debug!("job {} needs attention: {reason}", job.id)
                    }
                    Err(e) => log::error!("job {} ({}): {e}", job.id, job.stage),
                }
            }));
        }
        log::debug!("tick: {total} jobs, {} steps started", handles.len());
        Ok(handles)
    }

    pub async fn run(self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                log::error!("Could not list jobs: {e}");
            }
        }
    }
}
