//! Site activation
//! Bridges rendered text to the proxy's live state: the "available"
//! directory holds every rendered config, the "enabled" directory holds links
//! to the live ones.

use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::{CommandLine, CommandRunner};
use crate::error::{DomainError, Result};

const CONFIG_EXTENSION: &str = "conf";

/// Result of asking the proxy to pick up a link change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded,
    /// The filesystem changed but the running proxy may still serve the old state
    Failed(String),
}

impl ReloadOutcome {
    pub fn warning(&self) -> Option<String> {
        match self {
            Self::Reloaded => None,
            Self::Failed(reason) => Some(format!("proxy reload failed: {}", reason)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    Running,
    Stopped,
}

/// What occupied an enabled slot before activation touched it
enum PriorEntry {
    Absent,
    Link(PathBuf),
    Copy(Vec<u8>),
}

/// Proxy commands used by the activator
#[derive(Debug, Clone)]
pub struct ProxyCommands {
    pub test: CommandLine,
    pub reload: CommandLine,
    pub status: CommandLine,
}

pub struct SiteActivator {
    available_dir: PathBuf,
    enabled_dir: PathBuf,
    commands: ProxyCommands,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl SiteActivator {
    pub fn new(
        available_dir: impl AsRef<Path>,
        enabled_dir: impl AsRef<Path>,
        commands: ProxyCommands,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            available_dir: available_dir.as_ref().to_path_buf(),
            enabled_dir: enabled_dir.as_ref().to_path_buf(),
            commands,
            runner,
            timeout,
        }
    }

    fn file_name(name: &str) -> String {
        format!("{}.{}", name, CONFIG_EXTENSION)
    }

    pub fn available_path(&self, name: &str) -> PathBuf {
        self.available_dir.join(Self::file_name(name))
    }

    pub fn enabled_path(&self, name: &str) -> PathBuf {
        self.enabled_dir.join(Self::file_name(name))
    }

    /// Current rendered text for `name`, if any
    pub fn read(&self, name: &str) -> Result<Option<String>> {
        let path = self.available_path(name);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DomainError::io(&path, e)),
        }
    }

    /// Persist rendered text to the available directory, replacing any prior content
    pub fn write(&self, name: &str, text: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.available_dir)
            .map_err(|e| DomainError::io(&self.available_dir, e))?;

        let path = self.available_path(name);
        let temp_path = self
            .available_dir
            .join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));

        fs::write(&temp_path, text).map_err(|e| DomainError::io(&temp_path, e))?;
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(DomainError::io(&path, e));
        }

        info!(domain = %name, "Wrote site configuration to {}", path.display());
        Ok(path)
    }

    /// Remove the available file; returns false if there was none
    pub fn discard(&self, name: &str) -> Result<bool> {
        let path = self.available_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(domain = %name, "Removed site configuration {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DomainError::io(&path, e)),
        }
    }

    pub fn has_config(&self, name: &str) -> bool {
        self.available_path(name).is_file()
    }

    /// True if anything (even a dangling link) occupies the enabled slot
    pub fn is_enabled(&self, name: &str) -> bool {
        fs::symlink_metadata(self.enabled_path(name)).is_ok()
    }

    pub fn available_sites(&self) -> Result<Vec<String>> {
        list_sites(&self.available_dir)
    }

    pub fn enabled_sites(&self) -> Result<Vec<String>> {
        list_sites(&self.enabled_dir)
    }

    /// Link the rendered config into the enabled set, validate, then reload
    ///
    /// If validation rejects the new set, the enabled slot is put back
    /// exactly as it was before the call.
    pub async fn activate(&self, name: &str) -> Result<ReloadOutcome> {
        let available = self.available_path(name);
        if !available.is_file() {
            error!(domain = %name, "Configuration file does not exist");
            return Err(DomainError::ConfigMissing(name.to_string()));
        }

        fs::create_dir_all(&self.enabled_dir)
            .map_err(|e| DomainError::io(&self.enabled_dir, e))?;

        let enabled = self.enabled_path(name);
        let prior = snapshot(&enabled).map_err(|e| DomainError::io(&enabled, e))?;

        if !matches!(prior, PriorEntry::Absent) {
            fs::remove_file(&enabled).map_err(|e| DomainError::io(&enabled, e))?;
            debug!(domain = %name, "Removed existing link");
        }

        let target = fs::canonicalize(&available).unwrap_or_else(|_| available.clone());
        if let Err(e) = link(&target, &enabled) {
            self.restore(name, &enabled, &prior);
            return Err(DomainError::io(&enabled, e));
        }
        info!(domain = %name, "Linked {} into enabled set", enabled.display());

        if let Err(e) = self.validate().await {
            error!(domain = %name, "Proxy rejected configuration, rolling back link: {}", e);
            let _ = fs::remove_file(&enabled);
            self.restore(name, &enabled, &prior);
            return Err(e);
        }

        Ok(self.reload().await)
    }

    /// Remove the enabled link, then reload
    pub async fn deactivate(&self, name: &str) -> Result<ReloadOutcome> {
        let enabled = self.enabled_path(name);
        if !self.is_enabled(name) {
            error!(domain = %name, "Enabled configuration does not exist");
            return Err(DomainError::NotActive(name.to_string()));
        }

        fs::remove_file(&enabled).map_err(|e| DomainError::io(&enabled, e))?;
        info!(domain = %name, "Removed {} from enabled set", enabled.display());

        Ok(self.reload().await)
    }

    /// Ask the proxy to reload; failure is reported, not raised
    pub async fn reload(&self) -> ReloadOutcome {
        let invocation = self.commands.reload.invocation(self.timeout);
        match self.runner.run_checked(&invocation).await {
            Ok(_) => {
                info!("Proxy reloaded successfully");
                ReloadOutcome::Reloaded
            }
            Err(e) => {
                warn!("Proxy reload failed: {}", e);
                ReloadOutcome::Failed(e.to_string())
            }
        }
    }

    pub async fn probe_status(&self) -> ProxyStatus {
        let invocation = self.commands.status.invocation(self.timeout);
        match self.runner.run(&invocation).await {
            Ok(output) if output.success() => ProxyStatus::Running,
            Ok(output) => {
                warn!("Proxy is not running (exit {:?})", output.code);
                ProxyStatus::Stopped
            }
            Err(e) => {
                error!("Proxy status probe failed: {}", e);
                ProxyStatus::Stopped
            }
        }
    }

    async fn validate(&self) -> Result<()> {
        let invocation = self.commands.test.invocation(self.timeout);
        let output = self.runner.run(&invocation).await?;
        if !output.success() {
            let detail = if output.stderr.trim().is_empty() {
                format!("{} exited with {:?}", invocation.display(), output.code)
            } else {
                output.stderr.trim().to_string()
            };
            return Err(DomainError::SyntaxValidationFailure(detail));
        }
        debug!("Proxy configuration syntax ok");
        Ok(())
    }

    fn restore(&self, name: &str, enabled: &Path, prior: &PriorEntry) {
        let result = match prior {
            PriorEntry::Absent => Ok(()),
            PriorEntry::Link(target) => link(target, enabled),
            PriorEntry::Copy(bytes) => fs::write(enabled, bytes),
        };
        if let Err(e) = result {
            error!(domain = %name, "Failed to restore previous enabled entry: {}", e);
        }
    }
}

fn snapshot(path: &Path) -> std::io::Result<PriorEntry> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PriorEntry::Absent),
        Err(e) => return Err(e),
    };

    if meta.file_type().is_symlink() {
        Ok(PriorEntry::Link(fs::read_link(path)?))
    } else {
        Ok(PriorEntry::Copy(fs::read(path)?))
    }
}

#[cfg(unix)]
fn link(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(not(unix))]
fn link(source: &Path, dest: &Path) -> std::io::Result<()> {
    fs::copy(source, dest).map(|_| ())
}

fn list_sites(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DomainError::io(dir, e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DomainError::io(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CONFIG_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if !stem.starts_with('.') {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Invocation, ToolError, ToolOutput};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Exits non-zero for any program listed in `failing`
    #[derive(Default)]
    struct StubRunner {
        failing: Mutex<Vec<String>>,
        calls: Mutex<Vec<String>>,
    }

    impl StubRunner {
        fn fail(&self, program: &str) {
            self.failing.lock().push(program.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for StubRunner {
        async fn run(&self, invocation: &Invocation) -> std::result::Result<ToolOutput, ToolError> {
            self.calls.lock().push(invocation.display());
            let code = if self.failing.lock().contains(&invocation.program) { 1 } else { 0 };
            Ok(ToolOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: if code == 0 { String::new() } else { "boom".to_string() },
            })
        }
    }

    fn setup(root: &Path) -> (SiteActivator, Arc<StubRunner>) {
        let runner = Arc::new(StubRunner::default());
        let activator = SiteActivator::new(
            root.join("available"),
            root.join("enabled"),
            ProxyCommands {
                test: "nginx -t".parse().unwrap(),
                reload: "systemctl reload nginx".parse().unwrap(),
                status: "systemctl status nginx".parse().unwrap(),
            },
            runner.clone(),
            Duration::from_secs(5),
        );
        (activator, runner)
    }

    #[test]
    fn test_write_overwrites() {
        let dir = tempdir().unwrap();
        let (activator, _) = setup(dir.path());

        let path = activator.write("a.example.com", "one").unwrap();
        assert_eq!(path, dir.path().join("available").join("a.example.com.conf"));
        activator.write("a.example.com", "two").unwrap();

        assert_eq!(activator.read("a.example.com").unwrap().as_deref(), Some("two"));
        assert_eq!(activator.available_sites().unwrap(), vec!["a.example.com"]);
    }

    #[tokio::test]
    async fn test_activate_requires_config() {
        let dir = tempdir().unwrap();
        let (activator, runner) = setup(dir.path());

        let err = activator.activate("a.example.com").await.unwrap_err();
        assert!(matches!(err, DomainError::ConfigMissing(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_activate_then_deactivate() {
        let dir = tempdir().unwrap();
        let (activator, runner) = setup(dir.path());
        activator.write("a.example.com", "server {}").unwrap();

        let outcome = activator.activate("a.example.com").await.unwrap();
        assert_eq!(outcome, ReloadOutcome::Reloaded);
        assert!(activator.is_enabled("a.example.com"));
        assert_eq!(activator.enabled_sites().unwrap(), vec!["a.example.com"]);
        assert_eq!(runner.calls(), vec!["nginx -t", "systemctl reload nginx"]);

        // Re-activation replaces the existing link
        activator.activate("a.example.com").await.unwrap();
        assert_eq!(activator.enabled_sites().unwrap(), vec!["a.example.com"]);

        activator.deactivate("a.example.com").await.unwrap();
        assert!(!activator.is_enabled("a.example.com"));

        let err = activator.deactivate("a.example.com").await.unwrap_err();
        assert!(matches!(err, DomainError::NotActive(_)));
    }

    #[tokio::test]
    async fn test_syntax_failure_rolls_back_new_link() {
        let dir = tempdir().unwrap();
        let (activator, runner) = setup(dir.path());
        activator.write("a.example.com", "server {").unwrap();
        runner.fail("nginx");

        let err = activator.activate("a.example.com").await.unwrap_err();
        assert!(matches!(err, DomainError::SyntaxValidationFailure(ref m) if m == "boom"));
        assert!(!activator.is_enabled("a.example.com"));
        assert!(!runner.calls().iter().any(|c| c.contains("reload")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_syntax_failure_restores_previous_link() {
        let dir = tempdir().unwrap();
        let (activator, runner) = setup(dir.path());
        activator.write("a.example.com", "server {}").unwrap();
        activator.activate("a.example.com").await.unwrap();
        let before = fs::read_link(activator.enabled_path("a.example.com")).unwrap();

        runner.fail("nginx");
        assert!(activator.activate("a.example.com").await.is_err());

        assert!(activator.is_enabled("a.example.com"));
        assert_eq!(fs::read_link(activator.enabled_path("a.example.com")).unwrap(), before);
    }

    #[tokio::test]
    async fn test_reload_failure_is_a_warning() {
        let dir = tempdir().unwrap();
        let (activator, runner) = setup(dir.path());
        activator.write("a.example.com", "server {}").unwrap();
        runner.fail("systemctl");

        let outcome = activator.activate("a.example.com").await.unwrap();
        assert!(matches!(outcome, ReloadOutcome::Failed(_)));
        assert!(outcome.warning().unwrap().contains("reload"));
        assert!(activator.is_enabled("a.example.com"));
    }

    #[tokio::test]
    async fn test_probe_status() {
        let dir = tempdir().unwrap();
        let (activator, runner) = setup(dir.path());
        assert_eq!(activator.probe_status().await, ProxyStatus::Running);

        runner.fail("systemctl");
        assert_eq!(activator.probe_status().await, ProxyStatus::Stopped);
    }

    #[test]
    fn test_discard() {
        let dir = tempdir().unwrap();
        let (activator, _) = setup(dir.path());
        activator.write("a.example.com", "x").unwrap();

        assert!(activator.discard("a.example.com").unwrap());
        assert!(!activator.discard("a.example.com").unwrap());
        assert!(!activator.has_config("a.example.com"));
    }
}
