//! Storefront CLI - drive the session layer from a terminal.
//!
//! Runs the same calls a screen would: restore the session, sign in, check
//! the session before a sensitive action, issue a request, log out.

use std::io;

use anyhow::{anyhow, bail, Context, Result};
use storefront_core::{ClientConfig, RequestDescriptor, Storefront};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: storefront <command>

Commands:
  status              Restore the session and print it
  validate            Check the session with the backend
  login <email>       Sign in with email and password
  logout              Log out and clear stored credentials
  sync                Mint a backend token for the signed-in identity
  get <path> [--auth] Send a GET request through the pipeline
  guest               Print the guest session id
";

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). When `STOREFRONT_LOG_DIR`
/// is set, logs are also written to a daily file there; the returned guard
/// must be held until exit so buffered lines are flushed.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = fmt::layer().with_writer(io::stderr);

    match std::env::var_os("STOREFRONT_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "storefront.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stderr).with(filter).init();
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
    let Some(command) = args.first() else {
        eprint!("{}", USAGE);
        return Ok(());
    };

    let config = ClientConfig::load().context("Failed to load configuration")?;
    let storefront = Storefront::builder(config).build()?;
    info!(command = %command, "storefront starting");

    let result = run(&storefront, command, &args[1..]).await;
    storefront.dispose();
    result
}

async fn run(storefront: &Storefront, command: &str, args: &[String]) -> Result<()> {
    match command {
        "status" => {
            storefront.initialize_session().await;
            print_session(storefront)
        }
        "validate" => {
            storefront.initialize_session().await;
            let valid = storefront.is_session_valid().await;
            println!("{}", if valid { "valid" } else { "invalid" });
            print_session(storefront)
        }
        "login" => {
            let email = args.first().ok_or_else(|| anyhow!("login needs an email address"))?;
            login(storefront, email).await
        }
        "logout" => {
            storefront.initialize_session().await;
            storefront.logout().await;
            println!("Logged out");
            Ok(())
        }
        "sync" => {
            storefront.initialize_session().await;
            if !storefront.sync_backend_auth().await {
                bail!("Backend sign-in could not be synchronized");
            }
            print_session(storefront)
        }
        "get" => {
            let path = args.first().ok_or_else(|| anyhow!("get needs a path"))?;
            let mut descriptor = RequestDescriptor::get(path.as_str());
            if args.iter().any(|a| a == "--auth") {
                descriptor = descriptor.authenticated();
            }
            storefront.initialize_session().await;
            match storefront.request(descriptor).await {
                Ok(response) => {
                    match serde_json::from_str::<serde_json::Value>(&response.body) {
                        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                        Err(_) => println!("{}", response.body),
                    }
                    Ok(())
                }
                Err(e) => bail!("{} ({})", e.user_message(), e),
            }
        }
        "guest" => {
            println!("{}", storefront.guest_session_id().await?);
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

async fn login(storefront: &Storefront, email: &str) -> Result<()> {
    let identity = storefront
        .sign_in()
        .ok_or_else(|| anyhow!("Password sign-in is not available"))?;
    if storefront.config().identity.api_key.is_empty() {
        bail!("No identity API key configured (set STOREFRONT_IDENTITY_API_KEY)");
    }

    storefront.initialize_session().await;
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

    let user = identity
        .sign_in_with_password(email, &password)
        .await
        .map_err(|e| anyhow!("Sign-in failed: {}", e))?;
    let session = storefront
        .create_session(&user, user.login_method())
        .await
        .map_err(|e| anyhow!("{} ({})", e.user_message(), e))?;

    println!(
        "Signed in as {}",
        session
            .display_name
            .or(session.email)
            .unwrap_or_else(|| user.uid.clone())
    );
    Ok(())
}

fn print_session(storefront: &Storefront) -> Result<()> {
    let session = storefront.session_state();
    println!("{}", serde_json::to_string_pretty(&session)?);
    if let Some(minutes) = session.duration_minutes() {
        println!("Session age: {} min", minutes);
    }
    Ok(())
}
