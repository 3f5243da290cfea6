//! Layered configuration: defaults, `.marketplace/marketplace.toml`,
//! `MARKETPLACE_*` environment variables, then CLI flags.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Directory under the project root holding config and data.
pub const MARKET_DIR: &str = ".marketplace";
pub const CONFIG_FILE: &str = "marketplace.toml";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SSH_CONNECT_TIMEOUT_SECS: u64 = 10;

// ── File layer ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct WorkerSection {
    pub poll_interval_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub ssh_binary: Option<String>,
    pub ssh_connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TenancySection {
    pub base_domain: Option<String>,
    pub default_tenant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub filter: Option<String>,
    pub json: Option<bool>,
    /// Directory for a daily-rolling log file.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StatusSection {
    pub port: Option<u16>,
    pub bind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    /// Directory holding uploaded template assets.
    pub assets_dir: Option<PathBuf>,
    /// URL prefix under which assets are served.
    pub public_url: Option<String>,
}

/// The complete marketplace.toml structure. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MarketToml {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub tenancy: TenancySection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub status: StatusSection,
    #[serde(default)]
    pub storage: StorageSection,
}

impl MarketToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse marketplace.toml")
    }

    /// Load `<market_dir>/marketplace.toml`, or defaults when it does not exist.
    pub fn load_or_default(market_dir: &Path) -> Result<Self> {
        let path = market_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

// ── Resolved configuration ────────────────────────────────────────────

/// Values given on the command line; `None` leaves lower layers in effect.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub db_path: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    pub ssh_binary: String,
    pub ssh_connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub filter: String,
    pub json: bool,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub assets_dir: PathBuf,
    pub public_url: String,
}

#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub project_dir: PathBuf,
    pub db_path: PathBuf,
    pub worker: WorkerSettings,
    pub base_domain: Option<String>,
    pub default_tenant: Option<String>,
    pub logging: LoggingSettings,
    pub status_port: Option<u16>,
    pub status_bind: IpAddr,
    pub storage: StorageSettings,
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match env(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("Invalid value for {}: '{}'", key, raw)),
        _ => Ok(None),
    }
}

fn env_bool(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    match env(key).as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some("0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(other) => bail!("Invalid value for {}: '{}'", key, other),
    }
}

impl MarketConfig {
    /// Resolve configuration for `project_dir` from the process environment.
    pub fn load(project_dir: &Path, cli: &CliOverrides) -> Result<Self> {
        Self::load_with_env(project_dir, cli, |key| std::env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with an explicit environment lookup.
    pub fn load_with_env(
        project_dir: &Path,
        cli: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let market_dir = project_dir.join(MARKET_DIR);
        let file = MarketToml::load_or_default(&market_dir)?;

        let db_path = cli
            .db_path
            .clone()
            .or(env_parse::<PathBuf>(&env, "MARKETPLACE_DB_PATH")?)
            .or(file.database.path)
            .unwrap_or_else(|| PathBuf::from(MARKET_DIR).join("marketplace.db"));
        let db_path = if db_path.is_absolute() {
            db_path
        } else {
            project_dir.join(db_path)
        };

        let poll_interval_secs = cli
            .poll_interval_secs
            .or(env_parse(&env, "MARKETPLACE_POLL_INTERVAL")?)
            .or(file.worker.poll_interval_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        let command_timeout_secs = env_parse(&env, "MARKETPLACE_COMMAND_TIMEOUT")?
            .or(file.worker.command_timeout_secs)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
        let ssh_connect_timeout_secs = env_parse(&env, "MARKETPLACE_SSH_CONNECT_TIMEOUT")?
            .or(file.worker.ssh_connect_timeout_secs)
            .unwrap_or(DEFAULT_SSH_CONNECT_TIMEOUT_SECS);
        for (name, value) in [
            ("poll interval", poll_interval_secs),
            ("command timeout", command_timeout_secs),
            ("ssh connect timeout", ssh_connect_timeout_secs),
        ] {
            if value == 0 {
                bail!("{} must be at least 1 second", name);
            }
        }
        let ssh_binary = env("MARKETPLACE_SSH_BINARY")
            .filter(|s| !s.trim().is_empty())
            .or(file.worker.ssh_binary)
            .unwrap_or_else(|| "ssh".to_string());

        let base_domain = env("MARKETPLACE_BASE_DOMAIN")
            .or(file.tenancy.base_domain)
            .filter(|s| !s.trim().is_empty());
        let default_tenant = env("MARKETPLACE_DEFAULT_TENANT")
            .or(file.tenancy.default_tenant)
            .filter(|s| !s.trim().is_empty());

        let filter = if cli.verbose {
            "debug".to_string()
        } else {
            env("MARKETPLACE_LOG")
                .filter(|s| !s.trim().is_empty())
                .or(file.logging.filter)
                .unwrap_or_else(|| "info".to_string())
        };
        let json = env_bool(&env, "MARKETPLACE_LOG_JSON")?
            .or(file.logging.json)
            .unwrap_or(false);
        let log_dir = env_parse::<PathBuf>(&env, "MARKETPLACE_LOG_DIR")?
            .or(file.logging.dir)
            .map(|dir| if dir.is_absolute() { dir } else { project_dir.join(dir) });

        let status_port = env_parse(&env, "MARKETPLACE_STATUS_PORT")?.or(file.status.port);
        let status_bind = match env("MARKETPLACE_STATUS_BIND")
            .filter(|s| !s.trim().is_empty())
            .or(file.status.bind)
        {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid status bind address '{}'", raw))?,
            None => IpAddr::from([127, 0, 0, 1]),
        };

        let assets_dir = env_parse::<PathBuf>(&env, "MARKETPLACE_ASSETS_DIR")?
            .or(file.storage.assets_dir)
            .unwrap_or_else(|| PathBuf::from(MARKET_DIR).join("assets"));
        let assets_dir = if assets_dir.is_absolute() {
            assets_dir
        } else {
            project_dir.join(assets_dir)
        };
        let public_url = env("MARKETPLACE_ASSETS_URL")
            .filter(|s| !s.trim().is_empty())
            .or(file.storage.public_url)
            .unwrap_or_else(|| "/assets".to_string());

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            db_path,
            worker: WorkerSettings {
                poll_interval: Duration::from_secs(poll_interval_secs),
                command_timeout: Duration::from_secs(command_timeout_secs),
                ssh_binary,
                ssh_connect_timeout_secs,
            },
            base_domain,
            default_tenant,
            logging: LoggingSettings {
                filter,
                json,
                dir: log_dir,
            },
            status_port,
            status_bind,
            storage: StorageSettings {
                assets_dir,
                public_url,
            },
        })
    }

    /// Address for the status server, when one is configured.
    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status_port
            .map(|port| SocketAddr::new(self.status_bind, port))
    }

    pub fn ensure_directories(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        if let Some(dir) = &self.logging.dir {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(dir: &Path, content: &str) {
        let market_dir = dir.join(MARKET_DIR);
        std::fs::create_dir_all(&market_dir).unwrap();
        std::fs::write(market_dir.join(CONFIG_FILE), content).unwrap();
    }

    #[test]
    fn test_defaults() {
        let dir = tempdir().unwrap();
        let config = MarketConfig::load_with_env(dir.path(), &CliOverrides::default(), no_env).unwrap();
        assert_eq!(config.db_path, dir.path().join(".marketplace/marketplace.db"));
        assert_eq!(config.worker.poll_interval, Duration::from_secs(10));
        assert_eq!(config.worker.command_timeout, Duration::from_secs(300));
        assert_eq!(config.worker.ssh_binary, "ssh");
        assert_eq!(config.worker.ssh_connect_timeout_secs, 10);
        assert_eq!(config.logging.filter, "info");
        assert!(!config.logging.json);
        assert!(config.status_addr().is_none());
        assert!(config.base_domain.is_none());
        assert_eq!(config.storage.assets_dir, dir.path().join(".marketplace/assets"));
        assert_eq!(config.storage.public_url, "/assets");
    }

    #[test]
    fn test_storage_layers() {
        let dir = tempdir().unwrap();
        write_config(
            dir.path(),
            "[storage]\nassets_dir = \"media\"\npublic_url = \"https://cdn.example.com\"\n",
        );
        let config = MarketConfig::load_with_env(dir.path(), &CliOverrides::default(), no_env).unwrap();
        assert_eq!(config.storage.assets_dir, dir.path().join("media"));
        assert_eq!(config.storage.public_url, "https://cdn.example.com");

        let config = MarketConfig::load_with_env(dir.path(), &CliOverrides::default(), |key| {
            (key == "MARKETPLACE_ASSETS_DIR").then(|| "/srv/assets".to_string())
        })
        .unwrap();
        assert_eq!(config.storage.assets_dir, PathBuf::from("/srv/assets"));
    }

    #[test]
    fn test_file_layer() {
        let dir = tempdir().unwrap();
        write_config(
            dir.path(),
            r#"
[database]
path = "data/market.db"

[worker]
poll_interval_secs = 3
ssh_binary = "/usr/bin/ssh"

[tenancy]
base_domain = "example.com"
default_tenant = "main"

[status]
port = 9100
"#,
        );
        let config = MarketConfig::load_with_env(dir.path(), &CliOverrides::default(), no_env).unwrap();
        assert_eq!(config.db_path, dir.path().join("data/market.db"));
        assert_eq!(config.worker.poll_interval, Duration::from_secs(3));
        assert_eq!(config.worker.ssh_binary, "/usr/bin/ssh");
        assert_eq!(config.base_domain.as_deref(), Some("example.com"));
        assert_eq!(config.default_tenant.as_deref(), Some("main"));
        assert_eq!(
            config.status_addr(),
            Some("127.0.0.1:9100".parse().unwrap())
        );
    }

    #[test]
    fn test_env_overrides_file_and_cli_overrides_env() {
        let dir = tempdir().unwrap();
        write_config(dir.path(), "[worker]\npoll_interval_secs = 3\n");
        let env: HashMap<&str, &str> = HashMap::from([
            ("MARKETPLACE_POLL_INTERVAL", "7"),
            ("MARKETPLACE_LOG_JSON", "true"),
            ("MARKETPLACE_STATUS_PORT", "9200"),
            ("MARKETPLACE_STATUS_BIND", "0.0.0.0"),
        ]);
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let config = MarketConfig::load_with_env(dir.path(), &CliOverrides::default(), lookup).unwrap();
        assert_eq!(config.worker.poll_interval, Duration::from_secs(7));
        assert!(config.logging.json);
        assert_eq!(config.status_addr(), Some("0.0.0.0:9200".parse().unwrap()));

        let cli = CliOverrides {
            poll_interval_secs: Some(1),
            db_path: Some(PathBuf::from("/tmp/override.db")),
            verbose: true,
        };
        let config = MarketConfig::load_with_env(dir.path(), &cli, lookup).unwrap();
        assert_eq!(config.worker.poll_interval, Duration::from_secs(1));
        assert_eq!(config.db_path, PathBuf::from("/tmp/override.db"));
        assert_eq!(config.logging.filter, "debug");
    }

    #[test]
    fn test_invalid_env_value_names_variable() {
        let dir = tempdir().unwrap();
        let err = MarketConfig::load_with_env(dir.path(), &CliOverrides::default(), |key| {
            (key == "MARKETPLACE_COMMAND_TIMEOUT").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("MARKETPLACE_COMMAND_TIMEOUT"));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        write_config(dir.path(), "[worker\npoll_interval_secs = 3");
        let err = MarketConfig::load_with_env(dir.path(), &CliOverrides::default(), no_env).unwrap_err();
        assert!(format!("{:#}", err).contains("marketplace.toml"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(MarketToml::parse("[worker]\npoll_intervall_secs = 3\n").is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = tempdir().unwrap();
        let cli = CliOverrides {
            poll_interval_secs: Some(0),
            ..Default::default()
        };
        assert!(MarketConfig::load_with_env(dir.path(), &cli, no_env).is_err());
    }

    #[test]
    fn test_ensure_directories_creates_db_parent() {
        let dir = tempdir().unwrap();
        let config = MarketConfig::load_with_env(dir.path(), &CliOverrides::default(), no_env).unwrap();
        config.ensure_directories().unwrap();
        assert!(dir.path().join(MARKET_DIR).is_dir());
    }
}
