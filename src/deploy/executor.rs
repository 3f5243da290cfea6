use std::sync::Arc;
use std::time::Duration;

use super::commands::steps_for;
use super::models::{CustomerSite, DeploymentJob, DeploymentTarget, JobOutcome};
use super::remote::RemoteShell;
use crate::errors::DeployError;

/// Result of executing one job: the combined transcript plus the first error.
#[derive(Debug)]
pub struct ExecutionReport {
    pub output: String,
    pub result: Result<(), DeployError>,
}

impl ExecutionReport {
    pub fn into_outcome(self) -> JobOutcome {
        match self.result {
            Ok(()) => JobOutcome::Success {
                output: self.output,
            },
            Err(e) => JobOutcome::Failed {
                error: e.to_string(),
                output: self.output,
            },
        }
    }
}

/// Runs the command steps of a job against its target, in order.
#[derive(Clone)]
pub struct DeployExecutor {
    shell: Arc<dyn RemoteShell>,
    command_timeout: Duration,
}

impl DeployExecutor {
    pub fn new(shell: Arc<dyn RemoteShell>, command_timeout: Duration) -> Self {
        Self {
            shell,
            command_timeout,
        }
    }

    /// Execute `job` for `site` on `target`, stopping at the first failing step.
    pub async fn execute(
        &self,
        job: &DeploymentJob,
        site: &CustomerSite,
        target: &DeploymentTarget,
    ) -> ExecutionReport {
        let mut output = String::new();
        if !target.is_active {
            return ExecutionReport {
                output,
                result: Err(DeployError::TargetInactive {
                    target_id: target.id,
                }),
            };
        }

        for step in steps_for(job.action, site) {
            tracing::info!(
                job_id = job.id,
                site = %site.slug,
                step = step.name,
                "Running deploy step"
            );
            output.push_str(&format!("$ {}\n", step.command));
            let result = match self
                .shell
                .run(target, &step.command, self.command_timeout)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(job_id = job.id, step = step.name, error = %e, "Deploy step could not run");
                    output.push_str(&format!("{}\n", e));
                    return ExecutionReport {
                        output,
                        result: Err(e),
                    };
                }
            };
            output.push_str(&result.stdout);
            output.push_str(&result.stderr);
            if !result.success() {
                tracing::warn!(
                    job_id = job.id,
                    step = step.name,
                    exit_code = ?result.exit_code,
                    "Deploy step failed"
                );
                return ExecutionReport {
                    output,
                    result: Err(DeployError::StepFailed {
                        step: step.name.to_string(),
                        exit_code: result.exit_code,
                        stderr: result.stderr.trim().to_string(),
                    }),
                };
            }
        }
        ExecutionReport {
            output,
            result: Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::deploy::models::{JobAction, JobStatus, SiteStatus};
    use crate::deploy::remote::CommandOutput;
    use crate::deploy::remote::tests::target;
    use crate::market::models::Audit;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records commands; fails any command containing `fail_on`.
    #[derive(Default)]
    pub(crate) struct FakeShell {
        pub(crate) commands: Mutex<Vec<String>>,
        pub(crate) fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn run(
            &self,
            _target: &DeploymentTarget,
            command: &str,
            _timeout: Duration,
        ) -> Result<CommandOutput, DeployError> {
            self.commands.lock().unwrap().push(command.to_string());
            if let Some(pattern) = self.fail_on
                && command.contains(pattern)
            {
                return Ok(CommandOutput {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: "boom\n".into(),
                });
            }
            Ok(CommandOutput {
                exit_code: Some(0),
                stdout: "ok\n".into(),
                stderr: String::new(),
            })
        }
    }

    fn audit() -> Audit {
        Audit {
            is_deleted: false,
            created_at: "2026-01-01T00:00:00.000000Z".into(),
            modified_at: None,
            deleted_at: None,
        }
    }

    fn job(action: JobAction) -> DeploymentJob {
        DeploymentJob {
            id: 7,
            site_id: 1,
            action,
            status: JobStatus::Running,
            requested_by: None,
            error: None,
            output: None,
            started_at: None,
            finished_at: None,
            audit: audit(),
        }
    }

    fn site() -> CustomerSite {
        CustomerSite {
            id: 1,
            tenant_id: 1,
            user_id: None,
            template_id: None,
            target_id: 1,
            name: "Jo".into(),
            slug: "jo-shop".into(),
            domain: None,
            image: "nginx:1.27".into(),
            host_port: 8080,
            container_port: 80,
            env: BTreeMap::new(),
            status: SiteStatus::Pending,
            audit: audit(),
        }
    }

    #[tokio::test]
    async fn test_runs_all_steps_in_order() {
        let shell = Arc::new(FakeShell::default());
        let executor = DeployExecutor::new(shell.clone(), Duration::from_secs(5));
        let report = executor.execute(&job(JobAction::Redeploy), &site(), &target()).await;
        assert!(report.result.is_ok());
        let commands = shell.commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].starts_with("docker pull"));
        assert!(commands[1].starts_with("docker rm -f"));
        assert!(commands[2].starts_with("docker run"));
        assert!(report.output.contains("$ docker pull nginx:1.27"));
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let shell = Arc::new(FakeShell {
            fail_on: Some("docker pull"),
            ..Default::default()
        });
        let executor = DeployExecutor::new(shell.clone(), Duration::from_secs(5));
        let report = executor.execute(&job(JobAction::Deploy), &site(), &target()).await;
        match &report.result {
            Err(DeployError::StepFailed { step, exit_code, stderr }) => {
                assert_eq!(step, "pull");
                assert_eq!(*exit_code, Some(1));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected StepFailed, got {:?}", other),
        }
        assert_eq!(shell.commands.lock().unwrap().len(), 1);
        let outcome = report.into_outcome();
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_inactive_target_never_connects() {
        let shell = Arc::new(FakeShell::default());
        let executor = DeployExecutor::new(shell.clone(), Duration::from_secs(5));
        let mut inactive = target();
        inactive.is_active = false;
        let report = executor.execute(&job(JobAction::Stop), &site(), &inactive).await;
        assert!(matches!(
            report.result,
            Err(DeployError::TargetInactive { target_id: 1 })
        ));
        assert!(shell.commands.lock().unwrap().is_empty());
    }
}
