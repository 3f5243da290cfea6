//! Typed error hierarchy for the marketplace.
//!
//! Two top-level enums cover the two subsystems:
//! - `MarketError`: store, catalog, order and queue failures
//! - `DeployError`: remote execution failures

use thiserror::Error;

/// Errors from the marketplace store and its domain operations.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Tenant {0} not found")]
    TenantNotFound(String),

    #[error("User {id} not found")]
    UserNotFound { id: i64 },

    #[error("Template {id} not found")]
    TemplateNotFound { id: i64 },

    #[error("Order {id} not found")]
    OrderNotFound { id: i64 },

    #[error("Blog post {id} not found")]
    PostNotFound { id: i64 },

    #[error("Landing section {id} not found")]
    SectionNotFound { id: i64 },

    #[error("Contact request {id} not found")]
    ContactNotFound { id: i64 },

    #[error("Asset '{key}' not found")]
    AssetNotFound { key: String },

    #[error("Customer site {id} not found")]
    SiteNotFound { id: i64 },

    #[error("Deployment target {id} not found")]
    TargetNotFound { id: i64 },

    #[error("Deployment job {id} not found")]
    JobNotFound { id: i64 },

    #[error("Site {site_id} already has a queued or running job")]
    JobAlreadyActive { site_id: i64 },

    #[error("Cannot {action} {entity} in state '{state}'")]
    InvalidTransition {
        entity: &'static str,
        state: String,
        action: &'static str,
    },

    #[error("User {user_id} is not allowed to {action}")]
    Forbidden { user_id: i64, action: String },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Object storage error: {0}")]
    Storage(#[source] object_store::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MarketError {
    /// Whether the error means "the thing you asked for does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TenantNotFound(_)
                | Self::UserNotFound { .. }
                | Self::TemplateNotFound { .. }
                | Self::OrderNotFound { .. }
                | Self::PostNotFound { .. }
                | Self::SectionNotFound { .. }
                | Self::ContactNotFound { .. }
                | Self::AssetNotFound { .. }
                | Self::SiteNotFound { .. }
                | Self::TargetNotFound { .. }
                | Self::JobNotFound { .. }
        )
    }
}

impl From<rusqlite::Error> for MarketError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.into())
    }
}

impl From<object_store::Error> for MarketError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => Self::AssetNotFound { key: path },
            other => Self::Storage(other),
        }
    }
}

pub type MarketResult<T> = std::result::Result<T, MarketError>;

/// Errors from running provisioning commands on a remote host.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Failed to spawn remote shell: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Remote command timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Step '{step}' exited with code {exit_code:?}: {stderr}")]
    StepFailed {
        step: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Deployment target {target_id} is inactive")]
    TargetInactive { target_id: i64 },
}
