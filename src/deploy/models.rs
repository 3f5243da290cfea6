use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::market::models::{Audit, str_enum};

/// A host reachable over SSH that runs customer containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub ssh_key_path: Option<String>,
    pub is_active: bool,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone)]
pub struct NewTarget {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub ssh_key_path: Option<String>,
}

str_enum!(
    SiteStatus, "site status" {
        Pending => "pending",
        Running => "running",
        Stopped => "stopped",
        Removed => "removed",
        Failed => "failed",
    }
);

/// A customer's hosted instance of a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerSite {
    pub id: i64,
    pub tenant_id: i64,
    pub user_id: Option<i64>,
    pub template_id: Option<i64>,
    pub target_id: i64,
    pub name: String,
    pub slug: String,
    pub domain: Option<String>,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    pub env: BTreeMap<String, String>,
    pub status: SiteStatus,
    #[serde(flatten)]
    pub audit: Audit,
}

impl CustomerSite {
    pub fn container_name(&self) -> String {
        format!("site-{}", self.slug)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSite {
    pub tenant_id: i64,
    pub user_id: Option<i64>,
    /// When set and `image` is empty, the template's image is used.
    pub template_id: Option<i64>,
    pub target_id: i64,
    pub name: String,
    pub slug: String,
    pub domain: Option<String>,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    pub env: BTreeMap<String, String>,
}

str_enum!(
    JobAction, "job action" {
        Deploy => "deploy",
        Redeploy => "redeploy",
        Stop => "stop",
        Start => "start",
        Remove => "remove",
    }
);

impl JobAction {
    /// Site status after the action succeeds.
    pub fn resulting_status(&self) -> SiteStatus {
        match self {
            Self::Deploy | Self::Redeploy | Self::Start => SiteStatus::Running,
            Self::Stop => SiteStatus::Stopped,
            Self::Remove => SiteStatus::Removed,
        }
    }
}

str_enum!(
    JobStatus, "job status" {
        Queued => "queued",
        Running => "running",
        Success => "success",
        Failed => "failed",
    }
);

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentJob {
    pub id: i64,
    pub site_id: i64,
    pub action: JobAction,
    pub status: JobStatus,
    pub requested_by: Option<i64>,
    pub error: Option<String>,
    pub output: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    #[serde(flatten)]
    pub audit: Audit,
}

/// Result handed to the queue when a job finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success { output: String },
    Failed { error: String, output: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}
