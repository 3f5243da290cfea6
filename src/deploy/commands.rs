//! Docker command lines run on the target for each job action.

use super::models::{CustomerSite, JobAction};

/// One remote command with a short name used in errors and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    pub name: &'static str,
    pub command: String,
}

/// Quote `value` for a POSIX shell. Plain words are left untouched.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"_@%+=:,./-".contains(&b));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn pull(site: &CustomerSite) -> CommandStep {
    CommandStep {
        name: "pull",
        command: format!("docker pull {}", shell_quote(&site.image)),
    }
}

fn force_remove(site: &CustomerSite) -> CommandStep {
    CommandStep {
        name: "remove",
        command: format!("docker rm -f {}", shell_quote(&site.container_name())),
    }
}

fn run(site: &CustomerSite) -> CommandStep {
    let mut parts = vec![
        "docker run -d".to_string(),
        format!("--name {}", shell_quote(&site.container_name())),
        "--restart unless-stopped".to_string(),
        format!("-p {}:{}", site.host_port, site.container_port),
    ];
    // BTreeMap iterates in key order
    for (key, value) in &site.env {
        parts.push(format!("-e {}", shell_quote(&format!("{}={}", key, value))));
    }
    parts.push(shell_quote(&site.image));
    CommandStep {
        name: "run",
        command: parts.join(" "),
    }
}

/// The ordered steps that carry out `action` for `site`.
pub fn steps_for(action: JobAction, site: &CustomerSite) -> Vec<CommandStep> {
    let container = shell_quote(&site.container_name());
    match action {
        JobAction::Deploy => vec![pull(site), run(site)],
        JobAction::Redeploy => vec![pull(site), force_remove(site), run(site)],
        JobAction::Stop => vec![CommandStep {
            name: "stop",
            command: format!("docker stop {}", container),
        }],
        JobAction::Start => vec![CommandStep {
            name: "start",
            command: format!("docker start {}", container),
        }],
        JobAction::Remove => vec![force_remove(site)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::models::SiteStatus;
    use crate::market::models::Audit;
    use std::collections::BTreeMap;

    fn site() -> CustomerSite {
        let mut env = BTreeMap::new();
        env.insert("ZED".to_string(), "last".to_string());
        env.insert("APP_NAME".to_string(), "Jo's shop".to_string());
        CustomerSite {
            id: 1,
            tenant_id: 1,
            user_id: None,
            template_id: None,
            target_id: 1,
            name: "Jo".into(),
            slug: "jo-shop".into(),
            domain: None,
            image: "ghcr.io/acme/storefront:1.0".into(),
            host_port: 8080,
            container_port: 80,
            env,
            status: SiteStatus::Pending,
            audit: Audit {
                is_deleted: false,
                created_at: "2026-01-01T00:00:00.000000Z".into(),
                modified_at: None,
                deleted_at: None,
            },
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("nginx:1.27"), "nginx:1.27");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_deploy_steps() {
        let steps = steps_for(JobAction::Deploy, &site());
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].command, "docker pull ghcr.io/acme/storefront:1.0");
        assert_eq!(
            steps[1].command,
            r"docker run -d --name site-jo-shop --restart unless-stopped -p 8080:80 -e 'APP_NAME=Jo'\''s shop' -e ZED=last ghcr.io/acme/storefront:1.0"
        );
    }

    #[test]
    fn test_redeploy_replaces_container() {
        let names: Vec<&str> = steps_for(JobAction::Redeploy, &site())
            .iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["pull", "remove", "run"]);
    }

    #[test]
    fn test_lifecycle_steps() {
        let s = site();
        assert_eq!(steps_for(JobAction::Stop, &s)[0].command, "docker stop site-jo-shop");
        assert_eq!(steps_for(JobAction::Start, &s)[0].command, "docker start site-jo-shop");
        assert_eq!(steps_for(JobAction::Remove, &s)[0].command, "docker rm -f site-jo-shop");
    }
}
