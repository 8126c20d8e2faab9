//! Menowell CLI - a thin host for the menowell session layer.
//!
//! Plays the part of the app's route guard: it initializes the auth
//! controller, waits for initialization to complete, and then acts on the
//! resulting state. Useful for checking a Supabase project end to end and
//! for recovering a device stuck mid-migration.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use menowell_core::api::SupabaseClient;
use menowell_core::auth::{AuthError, EmergencySessionManager, SessionOrigin};
use menowell_core::storage::{FileBackend, KeyringBackend};
use menowell_core::{
    AuthController, Clock, Config, MigrationCoordinator, PersistentStore, SyncQueue, SystemClock,
};

// ============================================================================
// Constants
// ============================================================================

/// Keychain service name for credential captures
const KEYRING_SERVICE: &str = "menowell";

const USAGE: &str = "\
Usage: menowell <command>

Commands:
  status                       Restore the session and print the auth state
  login [email]                Sign in (falls back to offline sign-in)
  logout                       Sign out and forget offline credentials
  migrate                      Upload legacy onboarding data for the signed-in user
  retry-migration              Clear the migration marker and migrate again
  queue <table> <id> <json>    Queue a local change for upload
  sync                         Push queued changes

Logging is controlled with RUST_LOG (default: warn).";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr and, when a log directory is available, to a daily
/// rolling file. The returned guard must live until exit to flush the file.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "menowell.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
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

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load()?;
    let cache_dir = config.cache_dir()?;
    let _log_guard = init_tracing(Some(&cache_dir.join("logs")));
    info!(command, "Menowell CLI starting");

    let app = App::build(&config, &cache_dir)?;

    match command {
        "status" => {
            app.controller.initialize().await;
            print_status(&app.controller)?;
        }
        "login" => {
            let email = match args.get(1) {
                Some(email) => email.clone(),
                None => prompt_email(config.last_email.as_deref())?,
            };
            let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

            // Let the controller resolve any existing session first
            app.controller.initialize().await;
            match app.controller.login(&email, &password).await {
                Ok(sign_in) => {
                    config.last_email = Some(email);
                    config.save()?;
                    match sign_in.origin {
                        SessionOrigin::Remote => println!("Signed in as {}", sign_in.user.display()),
                        SessionOrigin::Offline => println!(
                            "Signed in offline as {}. Changes will sync when the connection returns.",
                            sign_in.user.display()
                        ),
                    }
                }
                Err(AuthError::CircuitOpen(secs)) => {
                    bail!("Sign-in is paused after repeated failures. Try again in {} seconds.", secs)
                }
                Err(e) => return Err(e.into()),
            }
        }
        "logout" => {
            app.controller.logout().await;
            println!("Signed out");
        }
        "migrate" | "retry-migration" => {
            let state = app.controller.initialize().await;
            let Some(user) = state.user else {
                bail!("Not signed in. Run `menowell login` first.");
            };
            if app.controller.session_origin() == Some(SessionOrigin::Offline) {
                bail!("Migration needs a connection to the server; you are signed in offline.");
            }

            let result = if command == "migrate" {
                app.controller.run_migration(&user.id).await
            } else {
                app.controller.retry_migration(&user.id).await
            };
            match result {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => println!("A migration is already running"),
            }
        }
        "queue" => {
            let (Some(table), Some(record_id), Some(raw)) = (args.get(1), args.get(2), args.get(3)) else {
                bail!("Usage: menowell queue <table> <id> <json>");
            };
            let payload: serde_json::Value =
                serde_json::from_str(raw).context("Change payload must be valid JSON")?;
            let change = app.sync.enqueue(table, record_id, payload);
            println!("Queued {} ({} pending)", change.id, app.sync.len());
        }
        "sync" => {
            let state = app.controller.initialize().await;
            if !state.is_authenticated || app.controller.session_origin() != Some(SessionOrigin::Remote) {
                bail!("Sync needs an online session. Run `menowell login` first.");
            }
            let report = app.sync.flush(app.client.as_ref()).await;
            println!(
                "Pushed {}, discarded {} stale, {} still pending",
                report.pushed,
                report.discarded.len(),
                report.remaining
            );
        }
        other => {
            eprintln!("Unknown command: {}\n", other);
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }

    Ok(())
}

// ============================================================================
// Wiring
// ============================================================================

struct App {
    controller: AuthController,
    client: Arc<SupabaseClient>,
    sync: SyncQueue,
}

impl App {
    fn build(config: &Config, cache_dir: &Path) -> Result<Self> {
        let Some(supabase) = config.supabase_config() else {
            bail!("Supabase is not configured. Set MENOWELL_SUPABASE_URL and MENOWELL_SUPABASE_ANON_KEY.");
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = PersistentStore::new(FileBackend::new(cache_dir.join("store"))?);
        let keychain = PersistentStore::new(KeyringBackend::new(KEYRING_SERVICE));

        let client = Arc::new(SupabaseClient::new(supabase, store.clone(), clock.clone())?);

        let emergency = EmergencySessionManager::new(store.clone(), keychain, clock.clone())
            .with_ttls(config.credential_ttl(), config.offline_session_ttl());
        let migration = MigrationCoordinator::new(store.clone(), client.clone(), clock.clone());

        let controller = AuthController::new(client.clone(), emergency, migration, clock.clone())
            .with_circuit_breaker(config.circuit_breaker())
            .with_retry(config.max_restore_attempts, config.retry_delay());

        let sync = SyncQueue::new(store, clock).with_circuit_breaker(config.circuit_breaker());

        Ok(Self {
            controller,
            client,
            sync,
        })
    }
}

// ============================================================================
// Output helpers
// ============================================================================

fn print_status(controller: &AuthController) -> Result<()> {
    let state = controller.snapshot();
    println!("{}", serde_json::to_string_pretty(&state)?);

    match (&state.user, controller.session_origin()) {
        (Some(user), Some(SessionOrigin::Offline)) => {
            let minutes = controller
                .emergency()
                .get_offline_session()
                .map(|session| session.minutes_until_expiry(SystemClock.now()))
                .unwrap_or(0);
            eprintln!("Signed in offline as {} (offline session ends in {} min)", user.display(), minutes);
        }
        (Some(user), _) => {
            eprintln!("Signed in as {}", user.display());
            if controller.migration().has_pending_legacy_data(&user.id) {
                eprintln!("Saved onboarding answers have not been uploaded yet. Run `menowell retry-migration`.");
            }
        }
        (None, _) => eprintln!("Not signed in"),
    }
    if let Some(ref error) = state.error {
        eprintln!("Error: {}", error);
    }
    Ok(())
}

fn prompt_email(last_email: Option<&str>) -> Result<String> {
    match last_email {
        Some(last) => print!("Email [{}]: ", last),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let email = line.trim();

    match (email.is_empty(), last_email) {
        (false, _) => Ok(email.to_string()),
        (true, Some(last)) => Ok(last.to_string()),
        (true, None) => bail!("An email address is required"),
    }
}
