//! The single polling worker that drains the deployment queue.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::executor::DeployExecutor;
use super::models::{CustomerSite, DeploymentJob, JobOutcome, SiteStatus};
use crate::errors::MarketResult;
use crate::market::db::{DbContext, DbHandle};
use crate::market::models::LogLevel;

const LOG_SOURCE: &str = "deploy-worker";

/// Claims one job at a time, runs it, records the outcome, then sleeps.
pub struct DeployWorker {
    db: DbHandle,
    executor: DeployExecutor,
    interval: Duration,
}

impl DeployWorker {
    pub fn new(db: DbHandle, executor: DeployExecutor, interval: Duration) -> Self {
        Self {
            db,
            executor,
            interval,
        }
    }

    /// Poll until `shutdown` is cancelled. A job in progress is finished first.
    pub async fn run(&self, shutdown: CancellationToken) -> MarketResult<()> {
        self.recover_interrupted().await?;
        tracing::info!(interval_secs = self.interval.as_secs(), "Deploy worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "Deploy worker tick failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::info!("Deploy worker stopped");
        Ok(())
    }

    /// Fail jobs a previous process left running.
    pub async fn recover_interrupted(&self) -> MarketResult<usize> {
        let failed = self.db.call(|db| db.fail_interrupted_jobs()).await?;
        for job in &failed {
            tracing::warn!(job_id = job.id, site_id = job.site_id, "Failed job interrupted by restart");
            let (job_id, site_id) = (job.id, job.site_id);
            let message = format!("{} job {} interrupted by worker restart", job.action, job.id);
            self.db
                .call(move |db| {
                    db.insert_log(LogLevel::Warn, LOG_SOURCE, &message, Some(job_id), Some(site_id))
                })
                .await?;
        }
        Ok(failed.len())
    }

    /// Process at most one queued job. Returns whether a job was processed.
    pub async fn run_once(&self) -> MarketResult<bool> {
        let Some(job) = self.db.call(|db| db.claim_next_job()).await? else {
            return Ok(false);
        };
        tracing::info!(job_id = job.id, site_id = job.site_id, action = %job.action, "Claimed deploy job");

        let (job_id, site_id) = (job.id, job.site_id);
        let loaded = self
            .db
            .call(move |db| {
                let site = db.get_site(site_id)?;
                let target = match &site {
                    Some(site) => db.get_target(site.target_id)?,
                    None => None,
                };
                Ok((site, target))
            })
            .await;

        let (site, outcome) = match loaded {
            Ok((Some(site), Some(target))) => {
                let report = self.executor.execute(&job, &site, &target).await;
                (Some(site), report.into_outcome())
            }
            Ok((None, _)) => (
                None,
                JobOutcome::Failed {
                    error: format!("customer site {} not found", site_id),
                    output: String::new(),
                },
            ),
            Ok((Some(site), None)) => {
                let error = format!("deployment target {} not found", site.target_id);
                (Some(site), JobOutcome::Failed { error, output: String::new() })
            }
            Err(e) => (
                None,
                JobOutcome::Failed {
                    error: format!("could not load job {}: {}", job_id, e),
                    output: String::new(),
                },
            ),
        };
        self.record(&job, site.as_ref(), &outcome).await?;
        Ok(true)
    }

    /// Persist the job result, site status and an audit entry.
    async fn record(
        &self,
        job: &DeploymentJob,
        site: Option<&CustomerSite>,
        outcome: &JobOutcome,
    ) -> MarketResult<()> {
        let site_status = if outcome.is_success() {
            job.action.resulting_status()
        } else {
            SiteStatus::Failed
        };
        let site_label = site
            .map(|s| s.slug.clone())
            .unwrap_or_else(|| format!("#{}", job.site_id));
        let (level, message) = match outcome {
            JobOutcome::Success { .. } => (
                LogLevel::Info,
                format!("{} of site {} succeeded (job {})", job.action, site_label, job.id),
            ),
            JobOutcome::Failed { error, .. } => (
                LogLevel::Error,
                format!(
                    "{} of site {} failed (job {}): {}",
                    job.action, site_label, job.id, error
                ),
            ),
        };

        let (job_id, site_id, has_site) = (job.id, job.site_id, site.is_some());
        let to_store = outcome.clone();
        let log_message = message.clone();
        let fallback = to_store.clone();
        let recorded = self
            .db
            .call(move |db| {
                let tx = db
                    .conn()
                    .unchecked_transaction()
                    .db_context("Failed to begin job outcome")?;
                db.finish_job(job_id, &to_store)?;
                if has_site {
                    db.set_site_status(site_id, site_status)?;
                }
                db.insert_log(level, LOG_SOURCE, &log_message, Some(job_id), Some(site_id))?;
                tx.commit().db_context("Failed to commit job outcome")
            })
            .await;
        if let Err(e) = recorded {
            // The job must not stay running.
            tracing::warn!(job_id, site_id, error = %e, "Recording job outcome failed; finishing job alone");
            self.db.call(move |db| db.finish_job(job_id, &fallback)).await?;
        }

        match outcome {
            JobOutcome::Success { .. } => tracing::info!(
                job_id = job.id,
                site = %site_label,
                action = %job.action,
                site_status = %site_status,
                "{}",
                message
            ),
            JobOutcome::Failed { error, .. } => tracing::error!(
                job_id = job.id,
                site = %site_label,
                action = %job.action,
                error = %error,
                "{}",
                message
            ),
        }
        Ok(())
    }
}
