//! Cron-driven backup runs for daemon mode.

use crate::executor::{BackupExecutor, BackupOptions, RunOutcome};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    executor: Arc<BackupExecutor>,
}

impl BackupScheduler {
    pub async fn new(executor: Arc<BackupExecutor>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            executor,
        })
    }

    /// Register a backup run on `cron_expression` (seconds field included).
    pub async fn schedule(&self, cron_expression: &str) -> anyhow::Result<()> {
        let executor = self.executor.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let executor = executor.clone();
            Box::pin(async move {
                tracing::info!("Starting scheduled backup");
                // Overlapping runs are turned away by the run lock.
                match executor.execute(BackupOptions::default()).await {
                    Ok(RunOutcome::AlreadyRunning) => {
                        tracing::warn!("Skipping scheduled run: previous run still active")
                    }
                    Ok(RunOutcome::Completed(report)) => {
                        tracing::info!(run_id = %report.run_id, status = %report.status, "Scheduled backup finished")
                    }
                    Err(e) => tracing::error!(error = %e, "Scheduled backup failed"),
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Backup scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
