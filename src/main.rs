//! domainctl - command-line entry point
//!
//! Usage:
//!   domainctl list [--json]
//!   domainctl get <domain>
//!   domainctl create <domain> <subfolder>
//!   domainctl update <domain> [--subfolder <path>] [--active <bool>]
//!   domainctl delete <domain>
//!   domainctl install-tls <domain> --email <email>
//!   domainctl status
//!   domainctl check

use anyhow::Result;
use clap::{Parser, Subcommand};
use domainctl::{
    ChangeKind, DomainError, DomainPatch, DomainRecord, Envelope, Reconciler, Settings,
    SystemCommandRunner,
};
use std::sync::Arc;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

/// Manage nginx sites and certificates for proxied domains
#[derive(Parser, Debug)]
#[command(name = "domainctl")]
#[command(author = "domainctl Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Manage nginx sites and certificates for proxied domains")]
struct Args {
    #[command(flatten)]
    settings: Settings,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List all domains
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one domain
    Get {
        domain: String,
    },

    /// Create a domain, or update it if it already exists
    Create {
        /// Domain name (e.g., blog.example.com)
        domain: String,

        /// Upstream subfolder the domain is proxied to
        subfolder: String,
    },

    /// Update an existing domain
    Update {
        domain: String,

        /// New upstream subfolder
        #[arg(short = 's', long)]
        subfolder: Option<String>,

        /// Enable or disable the site
        #[arg(short = 'a', long)]
        active: Option<bool>,
    },

    /// Disable and remove a domain
    Delete {
        domain: String,
    },

    /// Issue a Let's Encrypt certificate for a domain
    InstallTls {
        domain: String,

        /// Contact email for the certificate authority
        #[arg(short = 'e', long, env = "CERTBOT_EMAIL")]
        email: Option<String>,
    },

    /// Report whether nginx is running
    Status,

    /// Compare the registry with the files on disk
    Check,
}

fn init_logging(level: &str) {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let reconciler = args
        .settings
        .build_reconciler(Arc::new(SystemCommandRunner))?;
    debug!("Settings: {:?}", args.settings);

    let (envelope, failure) = match run(&reconciler, args.command).await {
        Ok(Output::Envelope(envelope)) => (envelope, None),
        Ok(Output::Printed) => return Ok(()),
        Err((message, err)) => (Envelope::failure(message, &err), Some(err)),
    };

    println!("{}", serde_json::to_string_pretty(&envelope)?);

    if let Some(err) = failure {
        std::process::exit(if err.is_client_error() { 2 } else { 1 });
    }
    Ok(())
}

enum Output {
    Envelope(Envelope),
    Printed,
}

type CommandResult = std::result::Result<Output, (String, DomainError)>;

fn failed(message: &str) -> impl FnOnce(DomainError) -> (String, DomainError) + '_ {
    move |err| (message.to_string(), err)
}

async fn run(reconciler: &Reconciler, command: Commands) -> CommandResult {
    let envelope = match command {
        Commands::List { json } => {
            let records = reconciler.list().map_err(failed("Could not list domains"))?;
            if !json {
                print_table(&records);
                return Ok(Output::Printed);
            }
            Envelope::ok(format!("{} domain(s)", records.len()), &records)
        }

        Commands::Get { domain } => {
            let record = reconciler
                .get(&domain)
                .map_err(failed("Could not load domain"))?;
            Envelope::ok(format!("Domain {}", record.name), &record)
        }

        Commands::Create { domain, subfolder } => {
            let change = reconciler
                .create_or_update(&domain, &subfolder)
                .await
                .map_err(failed("Could not create or update domain"))?;
            let verb = match change.kind {
                ChangeKind::Created => "created",
                _ => "updated",
            };
            Envelope::ok(format!("Domain {} {}", change.record.name, verb), &change)
        }

        Commands::Update {
            domain,
            subfolder,
            active,
        } => {
            let change = reconciler
                .update(&domain, DomainPatch { subfolder, active })
                .await
                .map_err(failed("Could not update domain"))?;
            Envelope::ok(format!("Domain {} updated", change.record.name), &change)
        }

        Commands::Delete { domain } => {
            let removal = reconciler
                .delete(&domain)
                .await
                .map_err(failed("Could not delete domain"))?;
            Envelope::ok(format!("Domain {} deleted", removal.name), &removal)
        }

        Commands::InstallTls { domain, email } => {
            let change = reconciler
                .install_tls(&domain, email.as_deref())
                .await
                .map_err(failed("Could not install TLS"))?;
            Envelope::ok(
                format!("TLS enabled for domain {}", change.record.name),
                &change,
            )
        }

        Commands::Status => {
            let status = reconciler.probe_proxy_status().await;
            Envelope::ok(
                "Proxy status",
                &serde_json::json!({ "status": status }),
            )
        }

        Commands::Check => {
            let report = reconciler
                .check_consistency()
                .await
                .map_err(failed("Could not check consistency"))?;
            let message = if report.is_consistent() {
                "Registry and filesystem agree".to_string()
            } else {
                format!("{} inconsistency(ies) found", report.issues.len())
            };
            Envelope::ok(message, &report)
        }
    };

    Ok(Output::Envelope(envelope))
}

fn print_table(records: &[DomainRecord]) {
    if records.is_empty() {
        println!("No domains found");
        return;
    }

    println!(
        "{:<40} {:<25} {:<8} {:<8} {:<25}",
        "DOMAIN", "SUBFOLDER", "ACTIVE", "TLS", "UPDATED"
    );
    println!("{}", "-".repeat(110));

    for record in records {
        println!(
            "{:<40} {:<25} {:<8} {:<8} {:<25}",
            record.name,
            record.subfolder,
            if record.active { "yes" } else { "no" },
            if record.ssl_enabled { "yes" } else { "no" },
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\nTotal: {} domain(s)", records.len());
}
