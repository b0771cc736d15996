//! Keyward - a terminal front end for the session coordinator.
//!
//! Signs in against the configured API, keeps credentials in the OS keychain
//! (or a credentials file), and issues authenticated requests that refresh
//! the access token transparently.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use keyward_core::api::Method;
use keyward_core::{
    ApiRequest, ApiResponse, Config, NoticeLevel, Notifier, SessionError, SessionManager,
};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Directory for an optional log file, in addition to stderr
const LOG_DIR_ENV: &str = "KEYWARD_LOG_DIR";

const LOG_FILE: &str = "keyward.log";

const USAGE: &str = "\
Usage: keyward <command>

Commands:
  login [username]                 Sign in (prompts for the password)
  logout                           Sign out and forget stored credentials
  status                           Show the current session
  get <path>                       Authenticated GET against the API
  request <method> <path> [json]   Authenticated request with an optional JSON body";

enum Command {
    Login { username: Option<String> },
    Logout,
    Status,
    Request {
        method: Method,
        target: String,
        body: Option<serde_json::Value>,
    },
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["login"] => Ok(Command::Login { username: None }),
            ["login", username] => Ok(Command::Login {
                username: Some(username.to_string()),
            }),
            ["logout"] => Ok(Command::Logout),
            ["status"] => Ok(Command::Status),
            ["get", target] => Ok(Command::Request {
                method: Method::GET,
                target: target.to_string(),
                body: None,
            }),
            ["request", method, target, rest @ ..] if rest.len() <= 1 => {
                let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .with_context(|| format!("Invalid HTTP method: {}", method))?;
                let body = rest
                    .first()
                    .map(|raw| serde_json::from_str(raw).context("Request body is not valid JSON"))
                    .transpose()?;
                Ok(Command::Request {
                    method,
                    target: target.to_string(),
                    body,
                })
            }
            _ => Err(anyhow::anyhow!("{}", USAGE)),
        }
    }
}

/// Prints notices for the person at the terminal
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Success => eprintln!("✓ {}", message),
            NoticeLevel::Warning => eprintln!("! {}", message),
            NoticeLevel::Error => eprintln!("✗ {}", message),
        }
    }

    fn redirect_to_login(&self) {
        eprintln!("Run `keyward login` to sign in.");
    }
}

/// Initialize the tracing subscriber for logging.
/// The returned guard flushes the log file on drop.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    match std::env::var(LOG_DIR_ENV) {
        Ok(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    let mut config = Config::load()?;
    let manager = SessionManager::from_config(&config, Arc::new(ConsoleNotifier))?;

    // A failed restore already forced a clean logged-out state
    if let Err(e) = manager.initialize().await {
        warn!(error = %e, "Could not restore session");
    }

    match command {
        Command::Login { username } => login(&manager, &mut config, username).await,
        Command::Logout => {
            manager.logout().await;
            Ok(())
        }
        Command::Status => {
            println!("{}", manager.session().describe());
            Ok(())
        }
        Command::Request {
            method,
            target,
            body,
        } => request(&manager, method, target, body).await,
    }
}

async fn login(manager: &SessionManager, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username {
        Some(username) => username,
        None => prompt_username(config.last_username.as_deref())?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    println!("Authenticating...");
    manager.login(&username, &password).await?;

    config.last_username = Some(username);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
    info!("Login complete");
    Ok(())
}

fn prompt_username(last_username: Option<&str>) -> Result<String> {
    match last_username {
        Some(last) => print!("Username [{}]: ", last),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    match (input.is_empty(), last_username) {
        (true, Some(last)) => Ok(last.to_string()),
        _ => Ok(input.to_string()),
    }
}

async fn request(
    manager: &SessionManager,
    method: Method,
    target: String,
    body: Option<serde_json::Value>,
) -> Result<()> {
    let mut request = ApiRequest::new(method, target);
    if let Some(body) = body {
        request = request.json(&body)?;
    }

    match manager.client().execute(request).await {
        Ok(response) => {
            print_response(&response);
            Ok(())
        }
        Err(SessionError::SessionExpired) => {
            // The notifier already told the user
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn print_response(response: &ApiResponse) {
    eprintln!("HTTP {}", response.status);
    match response.json::<serde_json::Value>() {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{}", response.text()),
        },
        Err(_) => println!("{}", response.text()),
    }
}
