//! fin-session - command-line host for the Fin Engine session manager.
//!
//! Logs in, reports on, refreshes and clears the stored session, and can run
//! the background auto-refresh until interrupted.

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fin_session_core::{ApiClient, Config, SessionManager, SessionRecord};

const USAGE: &str = "\
Usage: fin-session <command>

Commands:
  login <username>   Authenticate and store a new session
  status             Show the stored session
  token              Print a valid access token, refreshing if needed
  refresh            Force a token refresh
  watch              Keep the session fresh until Ctrl-C
  logout             Clear the stored session";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(ExitCode::FAILURE);
    };

    let mut config = Config::load().context("Failed to load configuration")?;
    let api = ApiClient::from_config(&config).context("Failed to create API client")?;
    let store = config
        .session_store()
        .context("Failed to open session storage")?;
    let manager = SessionManager::new(store, Arc::new(api.clone()), config.session_config());

    match command.as_str() {
        "login" => {
            let username = match args.get(1) {
                Some(username) => username.clone(),
                None => match config.last_username.clone() {
                    Some(last) => last,
                    None => bail!("Usage: fin-session login <username>"),
                },
            };
            login(&manager, &api, &mut config, &username).await?;
        }
        "status" => status(&manager),
        "token" => {
            let token = manager
                .valid_access_token(|| eprintln!("Session expired. Please log in again."))
                .await;
            match token {
                Some(token) => println!("{}", token),
                None => return Ok(ExitCode::FAILURE),
            }
        }
        "refresh" => match manager.refresh().await {
            Some(_) => {
                println!("Access token refreshed");
                status(&manager);
            }
            None => {
                eprintln!("Refresh failed. Please log in again.");
                return Ok(ExitCode::FAILURE);
            }
        },
        "watch" => watch(&manager).await?,
        "logout" => {
            manager.logout();
            println!("Logged out");
        }
        "-h" | "--help" | "help" => println!("{}", USAGE),
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            return Ok(ExitCode::FAILURE);
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn login(
    manager: &SessionManager,
    api: &ApiClient,
    config: &mut Config,
    username: &str,
) -> Result<()> {
    print!("Password for {}: ", username);
    io::stdout().flush()?;
    let password = rpassword::read_password().context("Failed to read password")?;

    let record = api
        .login(username, &password)
        .await
        .context("Login failed")?;
    if !manager.store(&record) {
        bail!("Failed to store session");
    }

    config.last_username = Some(username.to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    info!(username, "Logged in");
    println!("Logged in as {}", display_user(&record, username));
    Ok(())
}

fn status(manager: &SessionManager) {
    let Some(record) = manager.load() else {
        println!("Not logged in");
        return;
    };

    println!("User:           {}", display_user(&record, "unknown"));
    println!(
        "Access token:   {}",
        describe_expiry(record.access_token().is_some(), record.access_expires_at())
    );
    println!(
        "Refresh token:  {}",
        describe_expiry(record.refresh_token().is_some(), record.refresh_expires_at())
    );
    if let Some(last) = record.last_refresh {
        println!("Last refresh:   {}", format_time(last));
    }
}

/// Reconcile once, then keep refreshing in the background until Ctrl-C.
async fn watch(manager: &SessionManager) -> Result<()> {
    if manager.reconcile_on_load().await {
        println!("Stale session refreshed");
    }
    if !manager.schedule_auto_refresh() {
        bail!("No session with a readable expiry. Please log in first.");
    }
    println!("Keeping session fresh. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    manager.stop_auto_refresh();
    println!("Stopped");
    Ok(())
}

fn display_user(record: &SessionRecord, fallback: &str) -> String {
    match record.user {
        Some(ref user) => {
            let roles = if user.roles.is_empty() {
                String::new()
            } else {
                format!(" ({})", user.roles.join(", "))
            };
            format!("{}{}", user.display_name(), roles)
        }
        None => fallback.to_string(),
    }
}

fn describe_expiry(present: bool, expires_at: Option<DateTime<Utc>>) -> String {
    match (present, expires_at) {
        (false, _) => "missing".to_string(),
        (true, None) => "present (no readable expiry)".to_string(),
        (true, Some(expiry)) => {
            let remaining = expiry - Utc::now();
            if remaining.num_seconds() <= 0 {
                format!("expired at {}", format_time(expiry))
            } else {
                format!(
                    "valid until {} ({}m left)",
                    format_time(expiry),
                    remaining.num_minutes()
                )
            }
        }
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}
