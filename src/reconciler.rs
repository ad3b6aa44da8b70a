//! Reconciler
//!
//! The only component allowed to mutate the registry or the enabled set.
//! Every mutating operation:
//! 1. validates its input without touching anything
//! 2. takes the exclusive section for its full duration: an async mutex for
//!    callers sharing this instance plus an advisory file lock for other processes
//! 3. applies filesystem and proxy side effects, recording an undo step for each
//! 4. writes the registry last; if that fails the recorded steps are undone
//!
//! State per domain: `Absent -> Configured(inactive) <-> Active -> Active+TLS`,
//! with delete reachable from any state.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::activator::{ProxyCommands, ProxyStatus, ReloadOutcome, SiteActivator};
use crate::certificate::{CertificateManager, InstallOutcome};
use crate::command::CommandRunner;
use crate::config::Settings;
use crate::error::{DomainError, Result};
use crate::lock::FileLock;
use crate::registry::{DomainRecord, Registry};
use crate::render::{ConfigRenderer, TlsMode};
use crate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Unchanged,
}

/// Result of a mutating operation that leaves a record behind
#[derive(Debug, Clone, Serialize)]
pub struct Change {
    pub record: DomainRecord,
    pub kind: ChangeKind,
    /// Non-fatal problems, e.g. a proxy reload that did not go through
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Removal {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Partial update; `None` fields are left as they are
#[derive(Debug, Clone, Default)]
pub struct DomainPatch {
    pub subfolder: Option<String>,
    pub active: Option<bool>,
}

/// A disagreement between the registry and the filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Inconsistency {
    ActiveWithoutLink(String),
    LinkedButInactive(String),
    MissingConfig(String),
    TlsWithoutCertificate(String),
    UnregisteredConfig(String),
    UnregisteredLink(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    pub checked: usize,
    pub issues: Vec<Inconsistency>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Compensating action for one applied step
enum Undo {
    /// Put back the previous available text (or remove the file)
    Config {
        name: String,
        previous: Option<String>,
    },
    /// A link was created; remove it
    Unlink(String),
    /// A link was removed; put it back
    Relink(String),
}

/// Ordered record of applied steps, undone newest first on failure
struct Plan<'a> {
    activator: &'a SiteActivator,
    undo: Vec<Undo>,
    warnings: Vec<String>,
}

impl<'a> Plan<'a> {
    fn new(activator: &'a SiteActivator) -> Self {
        Self {
            activator,
            undo: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn write_config(&mut self, name: &str, text: &str) -> Result<()> {
        let previous = self.activator.read(name)?;
        self.activator.write(name, text)?;
        self.undo.push(Undo::Config {
            name: name.to_string(),
            previous,
        });
        Ok(())
    }

    /// Link a site that was not live before
    async fn activate(&mut self, name: &str) -> Result<()> {
        let outcome = self.activator.activate(name).await?;
        self.note(outcome);
        self.undo.push(Undo::Unlink(name.to_string()));
        Ok(())
    }

    /// Re-link a live site so a rewritten config takes effect
    async fn reactivate(&mut self, name: &str) -> Result<()> {
        let outcome = self.activator.activate(name).await?;
        self.note(outcome);
        Ok(())
    }

    async fn deactivate(&mut self, name: &str) -> Result<()> {
        let outcome = self.activator.deactivate(name).await?;
        self.note(outcome);
        self.undo.push(Undo::Relink(name.to_string()));
        Ok(())
    }

    fn note(&mut self, outcome: ReloadOutcome) {
        if let Some(warning) = outcome.warning() {
            self.warnings.push(warning);
        }
    }

    async fn rollback(self) {
        for step in self.undo.into_iter().rev() {
            let result = match &step {
                Undo::Config { name, previous } => {
                    let restored = match previous {
                        Some(text) => self.activator.write(name, text).map(|_| ()),
                        None => self.activator.discard(name).map(|_| ()),
                    };
                    // A linked site must be reloaded to drop the reverted text
                    if restored.is_ok() && self.activator.is_enabled(name) {
                        if let Some(warning) = self.activator.reload().await.warning() {
                            warn!(domain = %name, "Rollback: {}", warning);
                        }
                    }
                    restored
                }
                Undo::Unlink(name) => self.activator.deactivate(name).await.map(|_| ()),
                Undo::Relink(name) => self.activator.activate(name).await.map(|_| ()),
            };
            if let Err(e) = result {
                error!("Rollback step failed: {}", e);
            }
        }
    }
}

/// Held for the whole of one operation; the file lock is released first
struct Exclusive<'a> {
    _file: Option<FileLock>,
    _task: MutexGuard<'a, ()>,
}

pub struct Reconciler {
    registry: Arc<dyn Registry>,
    renderer: ConfigRenderer,
    activator: SiteActivator,
    certificates: CertificateManager,
    exclusive: Mutex<()>,
    lock_path: Option<PathBuf>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn Registry>,
        renderer: ConfigRenderer,
        activator: SiteActivator,
        certificates: CertificateManager,
    ) -> Self {
        Self {
            registry,
            renderer,
            activator,
            certificates,
            exclusive: Mutex::new(()),
            lock_path: None,
        }
    }

    /// Also serialize against other processes through the lock file at `path`
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    pub fn from_settings(
        settings: &Settings,
        registry: Arc<dyn Registry>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let renderer = ConfigRenderer::new(settings.upstream_authority(), &settings.certificates_path);
        let activator = SiteActivator::new(
            &settings.sites_available,
            &settings.sites_enabled,
            ProxyCommands {
                test: settings.test_command.clone(),
                reload: settings.reload_command.clone(),
                status: settings.status_command.clone(),
            },
            runner.clone(),
            settings.tool_timeout(),
        );
        let certificates = CertificateManager::new(
            &settings.certificates_path,
            settings.certbot_command.clone(),
            settings.crontab_command.clone(),
            settings.renewal_schedule.clone(),
            runner,
            settings.certbot_timeout(),
            settings.tool_timeout(),
        );
        Self::new(registry, renderer, activator, certificates)
            .with_lock_file(settings.lock_path())
    }

    pub fn activator(&self) -> &SiteActivator {
        &self.activator
    }

    pub fn certificates(&self) -> &CertificateManager {
        &self.certificates
    }

    pub fn list(&self) -> Result<Vec<DomainRecord>> {
        Ok(self.registry.list_all()?)
    }

    pub fn get(&self, name: &str) -> Result<DomainRecord> {
        let name = validate::domain_name(name)?;
        self.lookup(&name)
    }

    async fn enter(&self) -> Result<Exclusive<'_>> {
        let task = self.exclusive.lock().await;
        let file = match &self.lock_path {
            Some(path) => Some(
                FileLock::acquire_async(path.clone())
                    .await
                    .map_err(|e| DomainError::io(path, e))?,
            ),
            None => None,
        };
        Ok(Exclusive {
            _file: file,
            _task: task,
        })
    }

    fn lookup(&self, name: &str) -> Result<DomainRecord> {
        self.registry
            .get(name)?
            .ok_or_else(|| DomainError::NotFound(name.to_string()))
    }

    /// Create a domain, or update it in place if it already exists
    pub async fn create_or_update(&self, name: &str, subfolder: &str) -> Result<Change> {
        let name = validate::domain_name(name)?;
        let subfolder = validate::subfolder(subfolder)?;

        let _guard = self.enter().await?;
        let existing = self.registry.get(&name)?;

        let mut plan = Plan::new(&self.activator);
        let ssl_enabled = existing.as_ref().map(|r| r.ssl_enabled).unwrap_or(false);
        let text = self
            .renderer
            .render(&name, &subfolder, TlsMode::from_enabled(ssl_enabled));

        let applied = async {
            plan.write_config(&name, &text)?;
            match &existing {
                None => plan.activate(&name).await,
                Some(record) if record.active => plan.reactivate(&name).await,
                Some(_) => Ok(()),
            }
        }
        .await;
        if let Err(e) = applied {
            plan.rollback().await;
            return Err(e);
        }

        let (record, kind) = match existing {
            Some(mut record) => {
                info!(domain = %name, "Domain exists, updating subfolder");
                record.subfolder = subfolder;
                (record, ChangeKind::Updated)
            }
            None => {
                let mut record = DomainRecord::new(&name, subfolder);
                record.active = true;
                (record, ChangeKind::Created)
            }
        };

        self.commit(plan, record, kind).await
    }

    /// Change the subfolder and/or activation flag of an existing domain
    pub async fn update(&self, name: &str, patch: DomainPatch) -> Result<Change> {
        let name = validate::domain_name(name)?;
        let subfolder = patch.subfolder.as_deref().map(validate::subfolder).transpose()?;

        let _guard = self.enter().await?;
        let current = self.lookup(&name)?;

        if subfolder.is_none() && patch.active.map_or(true, |a| a == current.active) {
            return Ok(Change {
                record: current,
                kind: ChangeKind::Unchanged,
                warnings: Vec::new(),
            });
        }

        let mut plan = Plan::new(&self.activator);
        let mut record = current.clone();
        let mode = TlsMode::from_enabled(current.ssl_enabled);

        let applied = async {
            if let Some(subfolder) = &subfolder {
                let text = self.renderer.render(&name, subfolder, mode);
                plan.write_config(&name, &text)?;
                if current.active && patch.active != Some(false) {
                    plan.reactivate(&name).await?;
                }
                record.subfolder = subfolder.clone();
            }

            match patch.active {
                Some(true) if !current.active => {
                    if !self.activator.has_config(&name) {
                        let text = self.renderer.render(&name, &record.subfolder, mode);
                        plan.write_config(&name, &text)?;
                    }
                    plan.activate(&name).await?;
                }
                Some(false) if current.active => plan.deactivate(&name).await?,
                _ => {}
            }
            if let Some(active) = patch.active {
                record.active = active;
            }
            Ok::<(), DomainError>(())
        }
        .await;
        if let Err(e) = applied {
            plan.rollback().await;
            return Err(e);
        }

        self.commit(plan, record, ChangeKind::Updated).await
    }

    /// Deactivate (if live) and forget a domain
    pub async fn delete(&self, name: &str) -> Result<Removal> {
        let name = validate::domain_name(name)?;

        let _guard = self.enter().await?;
        let current = self.lookup(&name)?;

        let mut plan = Plan::new(&self.activator);
        if current.active {
            match plan.deactivate(&name).await {
                Ok(()) => {}
                Err(DomainError::NotActive(_)) => {
                    warn!(domain = %name, "Registry said active but no link was present");
                }
                Err(e) => {
                    plan.rollback().await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.registry.remove(&name) {
            error!(domain = %name, "Failed to remove domain from registry: {}", e);
            plan.rollback().await;
            return Err(e.into());
        }
        info!(domain = %name, "Domain deleted");

        let mut warnings = plan.warnings;
        if let Err(e) = self.activator.discard(&name) {
            warn!(domain = %name, "Could not remove rendered configuration: {}", e);
            warnings.push(format!("rendered configuration left behind: {}", e));
        }

        Ok(Removal { name, warnings })
    }

    /// Issue a certificate for a domain and record it
    pub async fn install_tls(&self, name: &str, email: Option<&str>) -> Result<Change> {
        let email = validate::email(email)?;
        let name = validate::domain_name(name)?;

        let _guard = self.enter().await?;
        let current = self.lookup(&name)?;

        if current.ssl_enabled {
            info!(domain = %name, "TLS already enabled");
            return Ok(Change {
                record: current,
                kind: ChangeKind::Unchanged,
                warnings: Vec::new(),
            });
        }

        let mut plan = Plan::new(&self.activator);
        let issued = self.certificates.install(&name, &email).await?;

        if issued == InstallOutcome::AlreadyPresent {
            // certbot did not touch the config, so emit the TLS listener ourselves
            let text = self.renderer.render(&name, &current.subfolder, TlsMode::Tls);
            let applied = async {
                plan.write_config(&name, &text)?;
                if current.active {
                    plan.reactivate(&name).await?;
                }
                Ok::<(), DomainError>(())
            }
            .await;
            if let Err(e) = applied {
                plan.rollback().await;
                return Err(e);
            }
        }

        if let Err(e) = self.certificates.ensure_auto_renewal().await {
            warn!(domain = %name, "Certificate auto-renewal not scheduled: {}", e);
            plan.warnings
                .push(format!("certificate auto-renewal not scheduled: {}", e));
        }

        let mut record = current;
        record.ssl_enabled = true;
        self.commit(plan, record, ChangeKind::Updated).await
    }

    /// Whether the proxy process currently responds as running
    pub async fn probe_proxy_status(&self) -> ProxyStatus {
        self.activator.probe_status().await
    }

    /// Compare registry flags with what is actually on disk; never mutates
    pub async fn check_consistency(&self) -> Result<ConsistencyReport> {
        let _guard = self.enter().await?;

        let records = self.registry.list_all()?;
        let available = self.activator.available_sites()?;
        let enabled = self.activator.enabled_sites()?;

        let mut report = ConsistencyReport {
            checked: records.len(),
            issues: Vec::new(),
        };

        for record in &records {
            let name = &record.name;
            let linked = self.activator.is_enabled(name);
            if record.active && !linked {
                report.issues.push(Inconsistency::ActiveWithoutLink(name.clone()));
            }
            if !record.active && linked {
                report.issues.push(Inconsistency::LinkedButInactive(name.clone()));
            }
            if !self.activator.has_config(name) {
                report.issues.push(Inconsistency::MissingConfig(name.clone()));
            }
            if record.ssl_enabled && !self.certificates.is_installed(name) {
                report
                    .issues
                    .push(Inconsistency::TlsWithoutCertificate(name.clone()));
            }
        }

        let known = |site: &String| records.iter().any(|r| &r.name == site);
        for site in available.iter().filter(|s| !known(*s)) {
            report.issues.push(Inconsistency::UnregisteredConfig(site.clone()));
        }
        for site in enabled.iter().filter(|s| !known(*s)) {
            report.issues.push(Inconsistency::UnregisteredLink(site.clone()));
        }

        if !report.is_consistent() {
            warn!("Consistency check found {} issue(s)", report.issues.len());
        }
        Ok(report)
    }

    /// Persist the record as the final step, undoing side effects if that fails
    async fn commit(&self, plan: Plan<'_>, record: DomainRecord, kind: ChangeKind) -> Result<Change> {
        match self.registry.upsert(record) {
            Ok(record) => {
                info!(domain = %record.name, ?kind, "Domain saved");
                Ok(Change {
                    record,
                    kind,
                    warnings: plan.warnings,
                })
            }
            Err(e) => {
                error!("Failed to persist domain: {}", e);
                plan.rollback().await;
                Err(e.into())
            }
        }
    }
}
