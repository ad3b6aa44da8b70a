//! Certificate manager for Let's Encrypt certificates
//! Drives certbot for issuance and makes sure a renewal job is scheduled

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::command::{CommandLine, CommandRunner};
use crate::error::{DomainError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// certbot ran and the certificate is now on disk
    Issued,
    /// A certificate was already on disk; certbot was not invoked
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    AlreadyScheduled,
    Scheduled,
}

pub struct CertificateManager {
    certs_dir: PathBuf,
    certbot: CommandLine,
    crontab: CommandLine,
    schedule: String,
    runner: Arc<dyn CommandRunner>,
    issue_timeout: Duration,
    tool_timeout: Duration,
}

impl CertificateManager {
    pub fn new(
        certs_dir: impl AsRef<Path>,
        certbot: CommandLine,
        crontab: CommandLine,
        schedule: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
        issue_timeout: Duration,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            certs_dir: certs_dir.as_ref().to_path_buf(),
            certbot,
            crontab,
            schedule: schedule.into(),
            runner,
            issue_timeout,
            tool_timeout,
        }
    }

    pub fn certificate_path(&self, domain: &str) -> PathBuf {
        self.certs_dir.join(domain).join("fullchain.pem")
    }

    pub fn is_installed(&self, domain: &str) -> bool {
        self.certificate_path(domain).is_file()
    }

    /// Renewal invocation as it appears in the crontab; also identifies an existing job
    fn renewal_command(&self) -> String {
        format!("{} renew", self.certbot)
    }

    /// Issue a certificate through certbot's nginx plugin
    ///
    /// Calling this for a domain that already has a certificate is a no-op.
    pub async fn install(&self, domain: &str, email: &str) -> Result<InstallOutcome> {
        if self.is_installed(domain) {
            info!(domain = %domain, "Certificate already installed");
            return Ok(InstallOutcome::AlreadyPresent);
        }

        let invocation = self.certbot.invoke(
            [
                "--nginx",
                "-d",
                domain,
                "--non-interactive",
                "--agree-tos",
                "--email",
                email,
                "--redirect",
                "--keep-until-expiring",
                "--no-eff-email",
            ],
            self.issue_timeout,
        );
        self.runner.run_checked(&invocation).await?;

        if !self.is_installed(domain) {
            return Err(DomainError::ExternalToolFailure {
                program: self.certbot.program.clone(),
                detail: format!(
                    "reported success but {} is missing",
                    self.certificate_path(domain).display()
                ),
            });
        }

        info!(domain = %domain, "Certificate installed");
        Ok(InstallOutcome::Issued)
    }

    /// Register the periodic `certbot renew` job unless one already exists
    pub async fn ensure_auto_renewal(&self) -> Result<RenewalOutcome> {
        let listing = self
            .runner
            .run(&self.crontab.invoke(["-l"], self.tool_timeout))
            .await?;

        // `crontab -l` exits non-zero when the user has no crontab yet
        let existing = if listing.success() {
            listing.stdout
        } else {
            info!("No existing crontab found");
            String::new()
        };

        let renew = self.renewal_command();
        if existing.lines().any(|line| line.contains(&renew)) {
            info!("Certificate auto-renewal already configured");
            return Ok(RenewalOutcome::AlreadyScheduled);
        }

        let mut table = existing;
        if !table.is_empty() && !table.ends_with('\n') {
            table.push('\n');
        }
        table.push_str(&format!("{} {} --quiet\n", self.schedule, renew));

        let install = self
            .crontab
            .invoke(["-"], self.tool_timeout)
            .with_stdin(table);
        if let Err(e) = self.runner.run_checked(&install).await {
            warn!("Failed to install renewal job: {}", e);
            return Err(e.into());
        }

        info!("Certificate auto-renewal configured");
        Ok(RenewalOutcome::Scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Invocation, ToolError, ToolOutput};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::tempdir;

    /// Fake certbot + crontab backed by a directory and an in-memory table
    struct FakeTools {
        certs_dir: PathBuf,
        crontab: Mutex<Option<String>>,
        calls: Mutex<Vec<Invocation>>,
        certbot_fails: bool,
    }

    #[async_trait]
    impl CommandRunner for FakeTools {
        async fn run(&self, invocation: &Invocation) -> std::result::Result<ToolOutput, ToolError> {
            self.calls.lock().push(invocation.clone());
            let ok = |stdout: String| ToolOutput {
                code: Some(0),
                stdout,
                stderr: String::new(),
            };

            match (invocation.program.as_str(), invocation.args.first().map(String::as_str)) {
                ("certbot", _) if self.certbot_fails => Ok(ToolOutput {
                    code: Some(1),
                    stdout: String::new(),
                    stderr: "challenge failed".to_string(),
                }),
                ("certbot", _) => {
                    let domain = &invocation.args[2];
                    let live = self.certs_dir.join(domain);
                    fs::create_dir_all(&live).unwrap();
                    fs::write(live.join("fullchain.pem"), "cert").unwrap();
                    Ok(ok(String::new()))
                }
                ("crontab", Some("-l")) => match self.crontab.lock().clone() {
                    Some(table) => Ok(ok(table)),
                    None => Ok(ToolOutput {
                        code: Some(1),
                        stdout: String::new(),
                        stderr: "no crontab for root".to_string(),
                    }),
                },
                ("crontab", Some("-")) => {
                    *self.crontab.lock() = invocation.stdin.clone();
                    Ok(ok(String::new()))
                }
                _ => Ok(ok(String::new())),
            }
        }
    }

    fn setup(dir: &Path, certbot_fails: bool) -> (CertificateManager, Arc<FakeTools>) {
        setup_with(dir, certbot_fails, CommandLine::new("certbot"))
    }

    fn setup_with(
        dir: &Path,
        certbot_fails: bool,
        certbot: CommandLine,
    ) -> (CertificateManager, Arc<FakeTools>) {
        let tools = Arc::new(FakeTools {
            certs_dir: dir.to_path_buf(),
            crontab: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            certbot_fails,
        });
        let manager = CertificateManager::new(
            dir,
            certbot,
            CommandLine::new("crontab"),
            "0 */12 * * *",
            tools.clone(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        (manager, tools)
    }

    #[tokio::test]
    async fn test_install_issues_once() {
        let dir = tempdir().unwrap();
        let (manager, tools) = setup(dir.path(), false);

        assert!(!manager.is_installed("a.example.com"));
        let first = manager.install("a.example.com", "ops@example.com").await.unwrap();
        assert_eq!(first, InstallOutcome::Issued);
        assert!(manager.is_installed("a.example.com"));

        let second = manager.install("a.example.com", "ops@example.com").await.unwrap();
        assert_eq!(second, InstallOutcome::AlreadyPresent);
        assert_eq!(tools.calls.lock().len(), 1);

        let calls = tools.calls.lock();
        let args = &calls[0].args;
        for flag in ["--nginx", "--non-interactive", "--agree-tos", "--redirect"] {
            assert!(args.iter().any(|a| a == flag), "missing {}", flag);
        }
    }

    #[tokio::test]
    async fn test_install_failure() {
        let dir = tempdir().unwrap();
        let (manager, _) = setup(dir.path(), true);

        let err = manager.install("a.example.com", "ops@example.com").await.unwrap_err();
        assert!(matches!(err, DomainError::ExternalToolFailure { .. }));
        assert!(!manager.is_installed("a.example.com"));
    }

    #[tokio::test]
    async fn test_auto_renewal_is_idempotent() {
        let dir = tempdir().unwrap();
        let (manager, tools) = setup(dir.path(), false);
        *tools.crontab.lock() = Some("5 4 * * * /usr/local/bin/backup".to_string());

        assert_eq!(manager.ensure_auto_renewal().await.unwrap(), RenewalOutcome::Scheduled);
        assert_eq!(
            tools.crontab.lock().as_deref(),
            Some("5 4 * * * /usr/local/bin/backup\n0 */12 * * * certbot renew --quiet\n")
        );

        assert_eq!(
            manager.ensure_auto_renewal().await.unwrap(),
            RenewalOutcome::AlreadyScheduled
        );
    }

    #[tokio::test]
    async fn test_auto_renewal_without_crontab() {
        let dir = tempdir().unwrap();
        let (manager, tools) = setup(dir.path(), false);

        assert_eq!(manager.ensure_auto_renewal().await.unwrap(), RenewalOutcome::Scheduled);
        assert_eq!(
            tools.crontab.lock().as_deref(),
            Some("0 */12 * * * certbot renew --quiet\n")
        );
    }

    #[tokio::test]
    async fn test_auto_renewal_with_custom_certbot_command() {
        let dir = tempdir().unwrap();
        let certbot: CommandLine = "/opt/certbot/bin/certbot --config-dir /srv/le".parse().unwrap();
        let (manager, tools) = setup_with(dir.path(), false, certbot);

        assert_eq!(manager.ensure_auto_renewal().await.unwrap(), RenewalOutcome::Scheduled);
        assert_eq!(
            manager.ensure_auto_renewal().await.unwrap(),
            RenewalOutcome::AlreadyScheduled
        );
        assert_eq!(
            tools.crontab.lock().as_deref(),
            Some("0 */12 * * * /opt/certbot/bin/certbot --config-dir /srv/le renew --quiet\n")
        );
    }
}
