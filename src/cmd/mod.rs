//! CLI command implementations.
//!
//! | Module    | Commands handled                              |
//! |-----------|-----------------------------------------------|
//! | `market`  | `Init`, `Tenant`, `User`, `Logs`              |
//! | `catalog` | `Template`                                    |
//! | `deploy`  | `Target`, `Site`, `Enqueue`, `Jobs`           |
//! | `worker`  | `Worker`                                      |

pub mod catalog;
pub mod deploy;
pub mod market;
pub mod worker;

use anyhow::{Context, Result};
use marketplace::config::MarketConfig;
use marketplace::market::MarketDb;

pub use catalog::cmd_template;
pub use deploy::{cmd_enqueue, cmd_jobs, cmd_site, cmd_target};
pub use market::{cmd_init, cmd_logs, cmd_tenant, cmd_user};
pub use worker::cmd_worker;

/// Open the configured database, creating its directory if needed.
pub fn open_db(config: &MarketConfig) -> Result<MarketDb> {
    config.ensure_directories()?;
    MarketDb::new(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))
}

/// Parse `KEY=VALUE` from the command line.
pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}
