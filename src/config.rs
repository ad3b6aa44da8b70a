//! Runtime settings
//! Every value can come from a flag or an environment variable

use clap::{Args, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::command::{CommandLine, CommandRunner};
use crate::registry::{JsonFileRegistry, Registry, RegistryError, SqliteRegistry};

/// Storage engine behind the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RegistryBackend {
    Json,
    Sqlite,
}

#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Registry location (JSON file or SQLite database)
    #[arg(long, env = "REGISTRY_PATH", default_value = "./config/domains.json")]
    pub registry_path: PathBuf,

    /// Registry storage engine
    #[arg(long, env = "REGISTRY_BACKEND", value_enum, default_value_t = RegistryBackend::Json)]
    pub registry_backend: RegistryBackend,

    /// Directory holding every rendered site config
    #[arg(long, env = "NGINX_SITES_PATH", default_value = "/etc/nginx/sites-available")]
    pub sites_available: PathBuf,

    /// Directory holding links to live site configs
    #[arg(long, env = "NGINX_ENABLED_PATH", default_value = "/etc/nginx/sites-enabled")]
    pub sites_enabled: PathBuf,

    /// Certificate store, one directory per domain
    #[arg(long, env = "SSL_CERTIFICATES_PATH", default_value = "/etc/letsencrypt/live")]
    pub certificates_path: PathBuf,

    /// Upstream host every domain is proxied to
    #[arg(long, env = "DOMAIN_PREFIX", default_value = "localhost")]
    pub upstream_host: String,

    /// Upstream port every domain is proxied to
    #[arg(long, env = "DEFAULT_SERVER_PORT", default_value_t = 3000)]
    pub upstream_port: u16,

    /// Proxy syntax check
    #[arg(long, env = "NGINX_TEST_COMMAND", default_value = "nginx -t")]
    pub test_command: CommandLine,

    /// Proxy reload
    #[arg(long, env = "NGINX_RELOAD_COMMAND", default_value = "systemctl reload nginx")]
    pub reload_command: CommandLine,

    /// Proxy liveness probe
    #[arg(long, env = "NGINX_STATUS_COMMAND", default_value = "systemctl status nginx")]
    pub status_command: CommandLine,

    #[arg(long, env = "CERTBOT_COMMAND", default_value = "certbot")]
    pub certbot_command: CommandLine,

    #[arg(long, env = "CRONTAB_COMMAND", default_value = "crontab")]
    pub crontab_command: CommandLine,

    /// Cron schedule for `certbot renew`
    #[arg(long, env = "RENEWAL_SCHEDULE", default_value = "0 */12 * * *")]
    pub renewal_schedule: String,

    /// Timeout for proxy and crontab commands
    #[arg(long, env = "TOOL_TIMEOUT_SECS", default_value_t = 60)]
    pub tool_timeout_secs: u64,

    /// Timeout for certificate issuance
    #[arg(long, env = "CERTBOT_TIMEOUT_SECS", default_value_t = 300)]
    pub certbot_timeout_secs: u64,
}

impl Settings {
    /// Settings with every path placed under `root`; used by tests and dry runs
    pub fn rooted_at<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            registry_path: root.join("config").join("domains.json"),
            registry_backend: RegistryBackend::Json,
            sites_available: root.join("sites-available"),
            sites_enabled: root.join("sites-enabled"),
            certificates_path: root.join("live"),
            upstream_host: "localhost".to_string(),
            upstream_port: 3000,
            test_command: CommandLine {
                program: "nginx".to_string(),
                args: vec!["-t".to_string()],
            },
            reload_command: CommandLine {
                program: "systemctl".to_string(),
                args: vec!["reload".to_string(), "nginx".to_string()],
            },
            status_command: CommandLine {
                program: "systemctl".to_string(),
                args: vec!["status".to_string(), "nginx".to_string()],
            },
            certbot_command: CommandLine::new("certbot"),
            crontab_command: CommandLine::new("crontab"),
            renewal_schedule: "0 */12 * * *".to_string(),
            tool_timeout_secs: 60,
            certbot_timeout_secs: 300,
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn certbot_timeout(&self) -> Duration {
        Duration::from_secs(self.certbot_timeout_secs)
    }

    /// `host:port` of the upstream
    pub fn upstream_authority(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }

    /// Lock file serializing domainctl processes that share this registry
    pub fn lock_path(&self) -> PathBuf {
        let dir = self
            .registry_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        dir.join("domainctl.lock")
    }

    /// Open the configured registry backend
    pub fn open_registry(&self) -> Result<Arc<dyn Registry>, RegistryError> {
        Ok(match self.registry_backend {
            RegistryBackend::Json => Arc::new(JsonFileRegistry::new(&self.registry_path)?),
            RegistryBackend::Sqlite => Arc::new(SqliteRegistry::new(&self.registry_path)?),
        })
    }

    /// Build a reconciler wired to these settings
    pub fn build_reconciler(
        &self,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<crate::Reconciler, RegistryError> {
        let registry = self.open_registry()?;
        Ok(crate::Reconciler::from_settings(self, registry, runner))
    }
}
