//! domainctl - nginx site and certificate reconciliation
//!
//! Turns a declarative "domain -> subfolder" registry into live nginx
//! configuration:
//! - Registry of domain records (JSON file or SQLite)
//! - Pure rendering of per-domain site configs
//! - Available/enabled link management with validated reloads
//! - Let's Encrypt issuance and renewal scheduling through certbot

pub mod activator;
pub mod certificate;
pub mod command;
pub mod config;
pub mod envelope;
pub mod error;
pub mod lock;
pub mod reconciler;
pub mod registry;
pub mod render;
pub mod validate;

pub use activator::{ProxyStatus, SiteActivator};
pub use certificate::CertificateManager;
pub use command::{CommandLine, CommandRunner, SystemCommandRunner};
pub use config::Settings;
pub use envelope::Envelope;
pub use error::DomainError;
pub use reconciler::{Change, ChangeKind, ConsistencyReport, DomainPatch, Reconciler, Removal};
pub use registry::{DomainRecord, JsonFileRegistry, Registry, SqliteRegistry};
pub use render::{ConfigRenderer, TlsMode};
