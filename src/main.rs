use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use marketplace::config::{CliOverrides, MarketConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "marketplace")]
#[command(version, about = "Template marketplace back office and deployment worker")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// SQLite database path. Overrides marketplace.toml and MARKETPLACE_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and run migrations
    Init,
    /// Manage tenants
    Tenant {
        #[command(subcommand)]
        command: TenantCommands,
    },
    /// Manage back-office users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Manage catalog templates and their preview images
    Template {
        #[command(subcommand)]
        command: TemplateCommands,
    },
    /// Manage deployment targets (SSH hosts)
    Target {
        #[command(subcommand)]
        command: TargetCommands,
    },
    /// Manage customer sites
    Site {
        #[command(subcommand)]
        command: SiteCommands,
    },
    /// Queue a deployment job for a site
    Enqueue {
        #[arg(long)]
        site: i64,
        /// deploy, redeploy, stop, start or remove
        #[arg(long)]
        action: String,
        /// User id on whose behalf the job is queued
        #[arg(long)]
        requested_by: Option<i64>,
    },
    /// List deployment jobs, newest first
    Jobs {
        /// queued, running, success or failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Run the deployment worker
    Worker {
        /// Process at most one job and exit
        #[arg(long)]
        once: bool,
        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Show recent audit log entries
    Logs {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

#[derive(Subcommand, Clone)]
pub enum TenantCommands {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        slug: String,
        /// Custom domain served for this tenant
        #[arg(long)]
        domain: Option<String>,
    },
    List,
    /// Show which tenant a request host maps to
    Resolve { host: String },
}

#[derive(Subcommand, Clone)]
pub enum UserCommands {
    Add {
        /// Tenant slug
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "")]
        name: String,
        /// customer, editor or admin
        #[arg(long, default_value = "customer")]
        role: String,
    },
    List {
        /// Tenant slug
        #[arg(long)]
        tenant: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum TemplateCommands {
    Add {
        /// Tenant slug
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "0")]
        price_cents: i64,
        #[arg(long, default_value = "EUR")]
        currency: String,
        /// Container image customer sites run
        #[arg(long)]
        image: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        category: String,
    },
    List {
        /// Tenant slug
        #[arg(long)]
        tenant: String,
    },
    Publish { id: i64 },
    Unpublish { id: i64 },
    /// Upload a preview image and set it on the template
    Preview { id: i64, file: PathBuf },
}

#[derive(Subcommand, Clone)]
pub enum TargetCommands {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        user: String,
        /// Private key passed to ssh with -i
        #[arg(long)]
        key: Option<String>,
    },
    List,
}

#[derive(Subcommand, Clone)]
pub enum SiteCommands {
    Add {
        /// Tenant slug
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        slug: String,
        /// Deployment target id
        #[arg(long)]
        target: i64,
        /// Container image; defaults to the template's image
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        template: Option<i64>,
        /// Owning user id
        #[arg(long)]
        owner: Option<i64>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        host_port: u16,
        #[arg(long, default_value = "80")]
        container_port: u16,
        /// Container environment as KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = cmd::parse_key_val)]
        env: Vec<(String, String)>,
    },
    List {
        /// Tenant slug
        #[arg(long)]
        tenant: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    dotenvy::from_path(project_dir.join(".env")).ok();

    let poll_interval_secs = match &cli.command {
        Commands::Worker { interval, .. } => *interval,
        _ => None,
    };
    let config = MarketConfig::load(
        &project_dir,
        &CliOverrides {
            db_path: cli.db_path.clone(),
            poll_interval_secs,
            verbose: cli.verbose,
        },
    )?;
    let _log_guard = marketplace::logging::init(&config.logging)?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Tenant { command } => cmd::cmd_tenant(&config, command.clone())?,
        Commands::User { command } => cmd::cmd_user(&config, command.clone())?,
        Commands::Template { command } => cmd::cmd_template(&config, command.clone()).await?,
        Commands::Target { command } => cmd::cmd_target(&config, command.clone())?,
        Commands::Site { command } => cmd::cmd_site(&config, command.clone())?,
        Commands::Enqueue {
            site,
            action,
            requested_by,
        } => cmd::cmd_enqueue(&config, *site, action, *requested_by)?,
        Commands::Jobs { status, limit } => cmd::cmd_jobs(&config, status.as_deref(), *limit)?,
        Commands::Worker { once, .. } => cmd::cmd_worker(&config, *once).await?,
        Commands::Logs { limit } => cmd::cmd_logs(&config, *limit)?,
    }

    Ok(())
}
