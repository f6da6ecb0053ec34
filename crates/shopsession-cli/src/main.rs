//! shopsession - command-line client for storefront and admin sessions.
//!
//! Logs in against the shop API, keeps the credential pair in the configured
//! store, and issues authenticated requests with transparent token refresh.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Method;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shopsession_core::{
    ApiRequest, Config, Deployment, MultipartField, RequestBody, SessionManager, SessionState,
};

/// How long `whoami` waits for the identity fetch to settle.
const IDENTITY_WAIT_SECS: u64 = 10;

#[derive(Parser)]
#[command(name = "shopsession", version, about = "Storefront and admin session client")]
struct Cli {
    /// Which application's session to use
    #[arg(long, env = "SHOPSESSION_DEPLOYMENT", global = true)]
    deployment: Option<Deployment>,

    /// API base URL, e.g. http://127.0.0.1:8000/api/
    #[arg(long, env = "SHOPSESSION_API_URL", global = true)]
    api_url: Option<String>,

    /// Also write daily-rotated logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and store the credential pair
    Login {
        /// Defaults to the last username used
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Forget the stored credentials
    Logout,
    /// Show the current session state
    Whoami,
    /// Print the stored access credential
    Token,
    /// Send an authenticated request and print the response
    Request {
        /// Endpoint relative to the API URL, or an absolute URL
        endpoint: String,
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// JSON request body
        #[arg(long, conflicts_with_all = ["field", "file"])]
        json: Option<String>,
        /// Multipart text field, name=value
        #[arg(long)]
        field: Vec<String>,
        /// Multipart file field, name=path
        #[arg(long)]
        file: Vec<String>,
    },
    /// Keep the session alive and print state changes until interrupted
    Watch,
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "shopsession.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(filter)
                .init();
            None
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load()?;
    config.apply_env()?;
    if let Some(deployment) = cli.deployment {
        config.deployment = deployment;
    }
    if let Some(ref url) = cli.api_url {
        config.api_url = url.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_ref());

    let config = load_config(&cli)?;
    info!(deployment = %config.deployment, "shopsession starting");

    let manager = SessionManager::builder(config.clone())
        .on_session_expired(|reason| eprintln!("Session expired: {reason}. Please log in again."))
        .build()?;

    let result = run(&cli.command, &manager, &config).await;
    manager.shutdown().await;
    result
}

async fn run(command: &Command, manager: &SessionManager, config: &Config) -> Result<()> {
    match command {
        Command::Login { username } => {
            let username = match username.clone().or_else(|| config.last_username.clone()) {
                Some(username) => username,
                None => prompt("Username: ")?,
            };
            let password = match std::env::var("SHOPSESSION_PASSWORD") {
                Ok(password) => password,
                Err(_) => rpassword::prompt_password("Password: ")
                    .context("Failed to read password")?,
            };

            if manager.login(&username, &password).await? {
                Config::remember_username(&username)?;
                println!("Logged in as {} ({})", username, config.deployment);
            } else {
                anyhow::bail!("Login failed: invalid credentials or insufficient privileges");
            }
        }
        Command::Logout => {
            manager.logout()?;
            println!("Logged out");
        }
        Command::Whoami => {
            let state = settled_state(manager).await;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Token => {
            println!("{}", manager.access_token()?.as_str());
        }
        Command::Request {
            endpoint,
            method,
            json,
            field,
            file,
        } => {
            let request = build_request(method, json.as_deref(), field, file)?;
            let response = manager.authenticated_request(endpoint, &request).await?;
            let status = response.status();
            let body = response.text().await.context("Failed to read response body")?;
            eprintln!("{}", status);
            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(_) => println!("{}", body),
            }
        }
        Command::Watch => watch(manager).await?,
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;

    eprint!("{}", label);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Wait for the publisher to move past `Unresolved`, or give up and report it.
async fn settled_state(manager: &SessionManager) -> SessionState {
    let mut rx = manager.watch_state();
    let waited = tokio::time::timeout(
        Duration::from_secs(IDENTITY_WAIT_SECS),
        rx.wait_for(|state| *state != SessionState::Unresolved),
    )
    .await;
    match waited {
        Ok(Ok(state)) => state.clone(),
        _ => manager.session_state(),
    }
}

fn split_pair(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Expected name=value, got {}", raw))
}

fn build_request(
    method: &str,
    json: Option<&str>,
    fields: &[String],
    files: &[String],
) -> Result<ApiRequest> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method {}", method))?;
    let request = ApiRequest::new(method);

    if let Some(json) = json {
        let value: serde_json::Value =
            serde_json::from_str(json).context("--json is not valid JSON")?;
        return Ok(request.body(RequestBody::Json(value)));
    }

    if fields.is_empty() && files.is_empty() {
        return Ok(request);
    }

    let mut parts = Vec::with_capacity(fields.len() + files.len());
    for raw in fields {
        let (name, value) = split_pair(raw)?;
        parts.push(MultipartField::text(name, value));
    }
    for raw in files {
        let (name, path) = split_pair(raw)?;
        let path = PathBuf::from(path);
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        parts.push(MultipartField::file(name, file_name, bytes, None));
    }
    Ok(request.multipart(parts))
}

async fn watch(manager: &SessionManager) -> Result<()> {
    let mut states = manager.watch_state();
    let mut events = manager.subscribe();
    println!("{}", serde_json::to_string(&*states.borrow_and_update())?);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", serde_json::to_string(&*states.borrow_and_update())?);
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    eprintln!("event: {:?}", event);
                }
            }
        }
    }
    Ok(())
}
