//! Deployment targets, customer sites and the job queue.

use std::collections::BTreeMap;

use rusqlite::types::Type;
use rusqlite::{Row, Transaction, TransactionBehavior, params};

use super::models::*;
use crate::errors::{MarketError, MarketResult};
use crate::market::db::{DbContext, MarketDb, Table, audit_at, now_timestamp, parse_column};
use crate::market::models::Permission;
use crate::market::validate;

/// Upper bound on captured command output stored with a job.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

pub const INTERRUPTED_ERROR: &str = "interrupted by worker restart";

/// Keep the tail of `output` within `max` bytes, on a char boundary.
pub fn truncate_output(output: &str, max: usize) -> String {
    if output.len() <= max {
        return output.to_string();
    }
    const MARKER: &str = "...[truncated]\n";
    let keep = max.saturating_sub(MARKER.len());
    let mut start = output.len() - keep;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("{}{}", MARKER, &output[start..])
}

const TARGET_SELECT: &str = "SELECT id, name, host, port, username, ssh_key_path, is_active, is_deleted, created_at, modified_at, deleted_at FROM deployment_targets";

fn map_target(row: &Row) -> rusqlite::Result<DeploymentTarget> {
    Ok(DeploymentTarget {
        id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        username: row.get(4)?,
        ssh_key_path: row.get(5)?,
        is_active: row.get(6)?,
        audit: audit_at(row, 7)?,
    })
}

const SITE_SELECT: &str = "SELECT id, tenant_id, user_id, template_id, target_id, name, slug, domain, image, host_port, container_port, env, status, is_deleted, created_at, modified_at, deleted_at FROM customer_sites";

fn map_site(row: &Row) -> rusqlite::Result<CustomerSite> {
    let env_json: String = row.get(11)?;
    let env: BTreeMap<String, String> = serde_json::from_str(&env_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e)))?;
    Ok(CustomerSite {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        template_id: row.get(3)?,
        target_id: row.get(4)?,
        name: row.get(5)?,
        slug: row.get(6)?,
        domain: row.get(7)?,
        image: row.get(8)?,
        host_port: row.get(9)?,
        container_port: row.get(10)?,
        env,
        status: parse_column(row, 12)?,
        audit: audit_at(row, 13)?,
    })
}

const JOB_SELECT: &str = "SELECT id, site_id, action, status, requested_by, error, output, started_at, finished_at, is_deleted, created_at, modified_at, deleted_at FROM deployment_jobs";

fn map_job(row: &Row) -> rusqlite::Result<DeploymentJob> {
    Ok(DeploymentJob {
        id: row.get(0)?,
        site_id: row.get(1)?,
        action: parse_column(row, 2)?,
        status: parse_column(row, 3)?,
        requested_by: row.get(4)?,
        error: row.get(5)?,
        output: row.get(6)?,
        started_at: row.get(7)?,
        finished_at: row.get(8)?,
        audit: audit_at(row, 9)?,
    })
}

impl MarketDb {
    // ── Targets ───────────────────────────────────────────────────────

    pub fn create_target(&self, new: &NewTarget) -> MarketResult<DeploymentTarget> {
        validate::require_non_empty("name", &new.name)?;
        validate::require_non_empty("host", &new.host)?;
        validate::require_non_empty("username", &new.username)?;
        let port = new.port.unwrap_or(22);
        if port == 0 {
            return Err(MarketError::Validation("port must be non-zero".into()));
        }
        let id = self.insert_row(
            Table::DeploymentTargets,
            &["name", "host", "port", "username", "ssh_key_path"],
            &[
                &new.name,
                &new.host.trim(),
                &port,
                &new.username,
                &new.ssh_key_path,
            ],
        )?;
        self.get_target(id)?.ok_or(MarketError::TargetNotFound { id })
    }

    pub fn get_target(&self, id: i64) -> MarketResult<Option<DeploymentTarget>> {
        self.query_opt(
            &format!("{} WHERE id = ?1 AND is_deleted = 0", TARGET_SELECT),
            params![id],
            map_target,
        )
    }

    pub fn list_targets(&self) -> MarketResult<Vec<DeploymentTarget>> {
        self.query_all(
            &format!("{} WHERE is_deleted = 0 ORDER BY id", TARGET_SELECT),
            [],
            map_target,
        )
    }

    pub fn set_target_active(&self, id: i64, active: bool) -> MarketResult<DeploymentTarget> {
        if !self.update_row(Table::DeploymentTargets, id, &[("is_active", &active)])? {
            return Err(MarketError::TargetNotFound { id });
        }
        self.get_target(id)?.ok_or(MarketError::TargetNotFound { id })
    }

    // ── Sites ─────────────────────────────────────────────────────────

    pub fn create_site(&self, new: &NewSite) -> MarketResult<CustomerSite> {
        validate::require_non_empty("name", &new.name)?;
        validate::require_slug(&new.slug)?;
        if new.host_port == 0 || new.container_port == 0 {
            return Err(MarketError::Validation("ports must be non-zero".into()));
        }
        for key in new.env.keys() {
            validate::require_env_key(key)?;
        }
        let domain = new.domain.as_deref().map(|d| d.trim().to_ascii_lowercase());
        if let Some(domain) = &domain {
            validate::require_hostname("domain", domain)?;
        }
        if self.get_tenant(new.tenant_id)?.is_none() {
            return Err(MarketError::TenantNotFound(new.tenant_id.to_string()));
        }
        if let Some(user_id) = new.user_id {
            self.get_user(user_id)?
                .filter(|u| u.tenant_id == new.tenant_id)
                .ok_or(MarketError::UserNotFound { id: user_id })?;
        }
        let target = self
            .get_target(new.target_id)?
            .ok_or(MarketError::TargetNotFound { id: new.target_id })?;

        let mut image = new.image.trim().to_string();
        if let Some(template_id) = new.template_id {
            let template = self
                .get_template(template_id)?
                .filter(|t| t.tenant_id == new.tenant_id)
                .ok_or(MarketError::TemplateNotFound { id: template_id })?;
            if image.is_empty() {
                image = template.image;
            }
        }
        validate::require_non_empty("image", &image)?;

        let slug_taken: Option<i64> = self.query_opt(
            "SELECT id FROM customer_sites WHERE slug = ?1 AND is_deleted = 0",
            params![new.slug],
            |row| row.get(0),
        )?;
        if slug_taken.is_some() {
            return Err(MarketError::Validation(format!(
                "site slug '{}' is taken",
                new.slug
            )));
        }
        let port_taken: Option<i64> = self.query_opt(
            "SELECT id FROM customer_sites
             WHERE target_id = ?1 AND host_port = ?2 AND status != 'removed' AND is_deleted = 0",
            params![target.id, new.host_port],
            |row| row.get(0),
        )?;
        if port_taken.is_some() {
            return Err(MarketError::Validation(format!(
                "port {} is already used on target '{}'",
                new.host_port, target.name
            )));
        }

        let env = serde_json::to_string(&new.env)
            .map_err(|e| MarketError::Other(anyhow::Error::new(e).context("Failed to encode env")))?;
        let id = self.insert_row(
            Table::CustomerSites,
            &[
                "tenant_id",
                "user_id",
                "template_id",
                "target_id",
                "name",
                "slug",
                "domain",
                "image",
                "host_port",
                "container_port",
                "env",
            ],
            &[
                &new.tenant_id,
                &new.user_id,
                &new.template_id,
                &target.id,
                &new.name,
                &new.slug,
                &domain,
                &image,
                &new.host_port,
                &new.container_port,
                &env,
            ],
        )?;
        self.get_site(id)?.ok_or(MarketError::SiteNotFound { id })
    }

    pub fn get_site(&self, id: i64) -> MarketResult<Option<CustomerSite>> {
        self.query_opt(
            &format!("{} WHERE id = ?1 AND is_deleted = 0", SITE_SELECT),
            params![id],
            map_site,
        )
    }

    pub fn list_sites(&self, tenant_id: Option<i64>) -> MarketResult<Vec<CustomerSite>> {
        match tenant_id {
            Some(tenant_id) => self.query_all(
                &format!(
                    "{} WHERE tenant_id = ?1 AND is_deleted = 0 ORDER BY id",
                    SITE_SELECT
                ),
                params![tenant_id],
                map_site,
            ),
            None => self.query_all(
                &format!("{} WHERE is_deleted = 0 ORDER BY id", SITE_SELECT),
                [],
                map_site,
            ),
        }
    }

    pub fn set_site_status(&self, id: i64, status: SiteStatus) -> MarketResult<()> {
        if !self.update_row(Table::CustomerSites, id, &[("status", &status.as_str())])? {
            return Err(MarketError::SiteNotFound { id });
        }
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    /// Queue `action` for a site. At most one queued or running job per site.
    pub fn enqueue_job(
        &self,
        site_id: i64,
        action: JobAction,
        requested_by: Option<i64>,
    ) -> MarketResult<DeploymentJob> {
        let site = self
            .get_site(site_id)?
            .ok_or(MarketError::SiteNotFound { id: site_id })?;
        if site.status == SiteStatus::Removed {
            return Err(MarketError::InvalidTransition {
                entity: "site",
                state: site.status.as_str().to_string(),
                action: "enqueue a job for",
            });
        }
        if let Some(user_id) = requested_by {
            self.check_can_deploy(&site, user_id)?;
        }
        if self.active_job_for_site(site_id)?.is_some() {
            return Err(MarketError::JobAlreadyActive { site_id });
        }
        let id = self.insert_row(
            Table::DeploymentJobs,
            &["site_id", "action", "status", "requested_by"],
            &[
                &site_id,
                &action.as_str(),
                &JobStatus::Queued.as_str(),
                &requested_by,
            ],
        )?;
        self.get_job(id)?.ok_or(MarketError::JobNotFound { id })
    }

    /// Owners may manage their own sites; others need the deployment permission
    /// within the site's tenant.
    fn check_can_deploy(&self, site: &CustomerSite, user_id: i64) -> MarketResult<()> {
        let user = self
            .get_user(user_id)?
            .ok_or(MarketError::UserNotFound { id: user_id })?;
        let forbidden = || MarketError::Forbidden {
            user_id,
            action: format!("manage deployments of site '{}'", site.slug),
        };
        if user.tenant_id != site.tenant_id || !user.is_active {
            return Err(forbidden());
        }
        if site.user_id == Some(user_id) || user.role.allows(Permission::ManageDeployments) {
            Ok(())
        } else {
            Err(forbidden())
        }
    }

    pub fn active_job_for_site(&self, site_id: i64) -> MarketResult<Option<DeploymentJob>> {
        self.query_opt(
            &format!(
                "{} WHERE site_id = ?1 AND status IN ('queued', 'running') AND is_deleted = 0
                 ORDER BY id LIMIT 1",
                JOB_SELECT
            ),
            params![site_id],
            map_job,
        )
    }

    pub fn get_job(&self, id: i64) -> MarketResult<Option<DeploymentJob>> {
        self.query_opt(
            &format!("{} WHERE id = ?1 AND is_deleted = 0", JOB_SELECT),
            params![id],
            map_job,
        )
    }

    /// Newest first.
    pub fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> MarketResult<Vec<DeploymentJob>> {
        match status {
            Some(status) => self.query_all(
                &format!(
                    "{} WHERE status = ?1 AND is_deleted = 0 ORDER BY created_at DESC, id DESC LIMIT ?2",
                    JOB_SELECT
                ),
                params![status.as_str(), limit],
                map_job,
            ),
            None => self.query_all(
                &format!(
                    "{} WHERE is_deleted = 0 ORDER BY created_at DESC, id DESC LIMIT ?1",
                    JOB_SELECT
                ),
                params![limit],
                map_job,
            ),
        }
    }

    pub fn list_jobs_for_site(&self, site_id: i64) -> MarketResult<Vec<DeploymentJob>> {
        self.query_all(
            &format!(
                "{} WHERE site_id = ?1 AND is_deleted = 0 ORDER BY created_at DESC, id DESC",
                JOB_SELECT
            ),
            params![site_id],
            map_job,
        )
    }

    /// Take the oldest queued job and mark it running.
    pub fn claim_next_job(&self) -> MarketResult<Option<DeploymentJob>> {
        let tx = Transaction::new_unchecked(self.conn(), TransactionBehavior::Immediate)
            .db_context("Failed to begin claim")?;
        let next: Option<i64> = self.query_opt(
            "SELECT id FROM deployment_jobs
             WHERE status = 'queued' AND is_deleted = 0
             ORDER BY created_at, id LIMIT 1",
            [],
            |row| row.get(0),
        )?;
        let Some(id) = next else {
            return Ok(None);
        };
        let now = now_timestamp();
        self.update_row(
            Table::DeploymentJobs,
            id,
            &[("status", &JobStatus::Running.as_str()), ("started_at", &now)],
        )?;
        tx.commit().db_context("Failed to commit claim")?;
        self.get_job(id)
    }

    /// Record the outcome of a running job.
    pub fn finish_job(&self, id: i64, outcome: &JobOutcome) -> MarketResult<DeploymentJob> {
        let job = self.get_job(id)?.ok_or(MarketError::JobNotFound { id })?;
        if job.status != JobStatus::Running {
            return Err(MarketError::InvalidTransition {
                entity: "job",
                state: job.status.as_str().to_string(),
                action: "finish",
            });
        }
        let (status, error, output) = match outcome {
            JobOutcome::Success { output } => (JobStatus::Success, None, output),
            JobOutcome::Failed { error, output } => (JobStatus::Failed, Some(error.as_str()), output),
        };
        let output = truncate_output(output, MAX_OUTPUT_BYTES);
        let now = now_timestamp();
        self.update_row(
            Table::DeploymentJobs,
            id,
            &[
                ("status", &status.as_str()),
                ("error", &error),
                ("output", &output),
                ("finished_at", &now),
            ],
        )?;
        self.get_job(id)?.ok_or(MarketError::JobNotFound { id })
    }

    /// Fail jobs a previous worker left running. Returns them.
    pub fn fail_interrupted_jobs(&self) -> MarketResult<Vec<DeploymentJob>> {
        let stale = self.list_jobs(Some(JobStatus::Running), i64::MAX)?;
        let now = now_timestamp();
        for job in &stale {
            self.update_row(
                Table::DeploymentJobs,
                job.id,
                &[
                    ("status", &JobStatus::Failed.as_str()),
                    ("error", &INTERRUPTED_ERROR),
                    ("finished_at", &now),
                ],
            )?;
        }
        let mut failed = Vec::with_capacity(stale.len());
        for job in stale {
            if let Some(job) = self.get_job(job.id)? {
                failed.push(job);
            }
        }
        Ok(failed)
    }
}
