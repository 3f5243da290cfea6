//! Database setup, tenants, users and the audit log.

use anyhow::{Result, anyhow};
use marketplace::config::MarketConfig;
use marketplace::market::TenantResolver;
use marketplace::market::models::Role;

use super::super::{TenantCommands, UserCommands};
use super::open_db;

pub fn cmd_init(config: &MarketConfig) -> Result<()> {
    open_db(config)?;
    println!("Initialized marketplace database at {}", config.db_path.display());
    Ok(())
}

pub fn cmd_tenant(config: &MarketConfig, command: TenantCommands) -> Result<()> {
    let db = open_db(config)?;
    match command {
        TenantCommands::Add { name, slug, domain } => {
            let tenant = db.create_tenant(&name, &slug, domain.as_deref())?;
            tracing::info!(tenant = %tenant.slug, id = tenant.id, "Created tenant");
            println!("Created tenant {} ({})", tenant.id, tenant.slug);
        }
        TenantCommands::List => {
            let tenants = db.list_tenants()?;
            if tenants.is_empty() {
                println!("No tenants.");
            }
            for t in tenants {
                println!(
                    "{:>4}  {:<20} {:<30} {}",
                    t.id,
                    t.slug,
                    t.custom_domain.as_deref().unwrap_or("-"),
                    if t.is_active { "active" } else { "inactive" }
                );
            }
        }
        TenantCommands::Resolve { host } => {
            let resolver = TenantResolver::new(
                config.base_domain.as_deref(),
                config.default_tenant.as_deref(),
            );
            match resolver.resolve(&db, &host)? {
                Some(tenant) => println!("{} -> {} ({})", host, tenant.slug, tenant.id),
                None => return Err(anyhow!("No tenant for host '{}'", host)),
            }
        }
    }
    Ok(())
}

pub fn cmd_user(config: &MarketConfig, command: UserCommands) -> Result<()> {
    let db = open_db(config)?;
    match command {
        UserCommands::Add {
            tenant,
            email,
            name,
            role,
        } => {
            let tenant = db
                .get_tenant_by_slug(&tenant)?
                .ok_or_else(|| anyhow!("Tenant '{}' not found", tenant))?;
            let role: Role = role.parse().map_err(|e: String| anyhow!(e))?;
            let user = db.create_user(tenant.id, &email, &name, role)?;
            println!("Created user {} ({}, {})", user.id, user.email, user.role);
        }
        UserCommands::List { tenant } => {
            let tenant = db
                .get_tenant_by_slug(&tenant)?
                .ok_or_else(|| anyhow!("Tenant '{}' not found", tenant))?;
            for u in db.list_users(tenant.id)? {
                println!("{:>4}  {:<30} {:<9} {}", u.id, u.email, u.role, u.display_name);
            }
        }
    }
    Ok(())
}

pub fn cmd_logs(config: &MarketConfig, limit: i64) -> Result<()> {
    let db = open_db(config)?;
    let entries = db.list_logs(limit)?;
    if entries.is_empty() {
        println!("No log entries.");
    }
    for e in entries {
        println!("{} {:<5} [{}] {}", e.created_at, e.level, e.source, e.message);
    }
    Ok(())
}
