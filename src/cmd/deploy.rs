//! Deployment targets, customer sites and the job queue.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use marketplace::config::MarketConfig;
use marketplace::deploy::models::{JobAction, JobStatus, NewSite, NewTarget};

use super::super::{SiteCommands, TargetCommands};
use super::open_db;

pub fn cmd_target(config: &MarketConfig, command: TargetCommands) -> Result<()> {
    let db = open_db(config)?;
    match command {
        TargetCommands::Add {
            name,
            host,
            port,
            user,
            key,
        } => {
            let target = db.create_target(&NewTarget {
                name,
                host,
                port,
                username: user,
                ssh_key_path: key,
            })?;
            println!(
                "Created target {} ({}@{}:{})",
                target.id, target.username, target.host, target.port
            );
        }
        TargetCommands::List => {
            let targets = db.list_targets()?;
            if targets.is_empty() {
                println!("No deployment targets.");
            }
            for t in targets {
                println!(
                    "{:>4}  {:<16} {}@{}:{} {}",
                    t.id,
                    t.name,
                    t.username,
                    t.host,
                    t.port,
                    if t.is_active { "" } else { "(inactive)" }
                );
            }
        }
    }
    Ok(())
}

pub fn cmd_site(config: &MarketConfig, command: SiteCommands) -> Result<()> {
    let db = open_db(config)?;
    match command {
        SiteCommands::Add {
            tenant,
            name,
            slug,
            target,
            image,
            template,
            owner,
            domain,
            host_port,
            container_port,
            env,
        } => {
            let tenant = db
                .get_tenant_by_slug(&tenant)?
                .ok_or_else(|| anyhow!("Tenant '{}' not found", tenant))?;
            let site = db.create_site(&NewSite {
                tenant_id: tenant.id,
                user_id: owner,
                template_id: template,
                target_id: target,
                name,
                slug,
                domain,
                image: image.unwrap_or_default(),
                host_port,
                container_port,
                env: env.into_iter().collect::<BTreeMap<_, _>>(),
            })?;
            println!(
                "Created site {} ({}, container {})",
                site.id,
                site.slug,
                site.container_name()
            );
        }
        SiteCommands::List { tenant } => {
            let tenant_id = match tenant {
                Some(slug) => Some(
                    db.get_tenant_by_slug(&slug)?
                        .ok_or_else(|| anyhow!("Tenant '{}' not found", slug))?
                        .id,
                ),
                None => None,
            };
            let sites = db.list_sites(tenant_id)?;
            if sites.is_empty() {
                println!("No sites.");
            }
            for s in sites {
                println!(
                    "{:>4}  {:<20} {:<8} target={} port={}:{} {}",
                    s.id, s.slug, s.status, s.target_id, s.host_port, s.container_port, s.image
                );
            }
        }
    }
    Ok(())
}

pub fn cmd_enqueue(
    config: &MarketConfig,
    site_id: i64,
    action: &str,
    requested_by: Option<i64>,
) -> Result<()> {
    let action: JobAction = action.parse().map_err(|e: String| anyhow!(e))?;
    let db = open_db(config)?;
    let job = db.enqueue_job(site_id, action, requested_by)?;
    tracing::info!(job_id = job.id, site_id, action = %action, "Queued deploy job");
    println!("Queued job {} ({} site {})", job.id, action, site_id);
    Ok(())
}

pub fn cmd_jobs(config: &MarketConfig, status: Option<&str>, limit: i64) -> Result<()> {
    let status = status
        .map(|s| s.parse::<JobStatus>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let db = open_db(config)?;
    let jobs = db.list_jobs(status, limit)?;
    if jobs.is_empty() {
        println!("No jobs.");
    }
    for j in jobs {
        println!(
            "{:>4}  site={:<4} {:<8} {:<7} {}{}",
            j.id,
            j.site_id,
            j.action,
            j.status,
            j.audit.created_at,
            j.error.map(|e| format!("  error: {}", e)).unwrap_or_default()
        );
    }
    Ok(())
}
