//! isp-portal - command-line front end for the subscriber portal session.
//!
//! Signs in, shows session and environment status, runs the credential
//! doctor and prints the account dashboard.

use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use isp_portal_core::auth::{ReconcileOutcome, SaveOutcome, SkipReason};
use isp_portal_core::{Config, Dashboard, SessionManager};

/// Log file name inside the cache directory
const LOG_FILE: &str = "isp-portal.log";

#[derive(Parser)]
#[command(name = "isp-portal", version, about = "ISP subscriber portal session tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and store the credential
    Login {
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Sign out and purge every stored credential
    Logout,
    /// Show routing and session state
    Status,
    /// Inspect stored credentials and repair them if the server disagrees
    Doctor,
    /// Show usage, package expiry and invoices
    Dashboard {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    let _guard = init_tracing(config.cache_dir().ok().as_deref());
    info!("isp-portal starting");

    let session = SessionManager::from_config(&config)?;
    session.on_auth_failure(|failure| {
        eprintln!(
            "Session ended: {}. Run `isp-portal login` to sign in again.",
            failure.error
        );
    });

    match cli.command {
        Command::Login { username } => login(&session, &mut config, username).await,
        Command::Logout => logout(&session).await,
        Command::Status => status(&session).await,
        Command::Doctor => doctor(&session).await,
        Command::Dashboard { json } => dashboard(&session, json).await,
    }
}

fn prompt_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read username")?;
    Ok(line.trim().to_string())
}

async fn login(session: &SessionManager, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(username) => username,
        None => prompt_line("Username: ")?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", username))
        .context("Failed to read password")?;

    let outcome = session.login(&username, &password).await?;
    println!("Signed in as {}", outcome.credential.identity().display_name());
    match outcome.storage {
        SaveOutcome::Durable { backend } => info!(backend, "Credential stored"),
        SaveOutcome::Volatile => {
            eprintln!("Warning: no credential store is available; you will need to sign in again next time.")
        }
    }

    config.last_username = Some(outcome.credential.username().to_string());
    config.save().context("Failed to save config")?;
    Ok(())
}

async fn logout(session: &SessionManager) -> Result<()> {
    let report = session.logout().await;
    for error in &report.errors {
        eprintln!("  could not clear {}", error);
    }
    println!("Signed out");
    Ok(())
}

async fn status(session: &SessionManager) -> Result<()> {
    let env = session.environment();
    println!("Origin:     {}", env.origin);
    println!("Deployment: {:?}", env.deployment);
    println!("Routing:    {:?} via {}", env.routing_mode, env.base_address);

    let Some(credential) = session.restore().await else {
        println!("Session:    signed out");
        return Ok(());
    };
    println!("Session:    {}", credential.username());
    if let Some(expires_at) = credential.expires_at() {
        println!("Expires:    {}", expires_at.format("%Y-%m-%d %H:%M UTC"));
    }
    match session.verify().await {
        Ok(identity) => println!("Server:     confirmed {}", identity.username),
        Err(e) if e.is_terminal() => println!("Server:     {} (signed out)", e),
        Err(e) => println!("Server:     {}", e),
    }
    Ok(())
}

async fn doctor(session: &SessionManager) -> Result<()> {
    session.restore().await;

    let diagnosis = session.diagnose().await;
    if diagnosis.is_healthy() {
        println!("No credential issues found");
    } else {
        println!("Issues:");
        for issue in &diagnosis.issues {
            println!("  - {}", issue);
        }
        println!("Recommendations:");
        for recommendation in &diagnosis.recommendations {
            println!("  - {}", recommendation);
        }
    }

    match session.reconcile().await {
        ReconcileOutcome::Skipped(SkipReason::LocalDevelopment) => {
            println!("Reconcile: skipped for local development")
        }
        ReconcileOutcome::Skipped(reason) => println!("Reconcile: skipped ({:?})", reason),
        outcome @ ReconcileOutcome::Finished { .. } => {
            if let Some(state) = outcome.state() {
                println!("Reconcile: {:?}", state);
            }
            if outcome.reload_recommended() {
                println!("Stored credentials were reset; sign in again.");
            }
        }
    }
    Ok(())
}

async fn dashboard(session: &SessionManager, json: bool) -> Result<()> {
    if session.restore().await.is_none() {
        bail!("Not signed in. Run `isp-portal login` first.");
    }
    let dashboard = session.api().dashboard().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&dashboard)?);
    } else {
        print_dashboard(&dashboard);
    }
    Ok(())
}

fn print_dashboard(dashboard: &Dashboard) {
    if let Some(identity) = &dashboard.identity {
        println!("Account: {} ({})", identity.display_name(), identity.username);
    }
    if let Some(usage) = &dashboard.usage {
        println!("Service: {}", usage.service);
        println!(
            "Usage:   {:.1} / {:.1} GB used, {:.1} GB remaining",
            usage.used_gb, usage.package_gb, usage.remaining_gb
        );
    }
    if let Some(days) = dashboard.days_remaining {
        println!("Expires: in {} day(s)", days);
    }
    if dashboard.has_unpaid_invoice() {
        println!("Unpaid invoices:");
        for invoice in &dashboard.unpaid_invoices {
            println!("  #{} {} {} ({})", invoice.id, invoice.date, invoice.price, invoice.service);
        }
    } else {
        println!("All {} invoice(s) paid", dashboard.invoices.len());
    }
    for warning in &dashboard.warnings {
        eprintln!("Warning: could not load {}", warning);
    }
}
