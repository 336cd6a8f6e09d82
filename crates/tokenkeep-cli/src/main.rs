//! tokenkeep - sign in once, stay signed in, call protected APIs.
//!
//! A thin command-line front end over `tokenkeep-core`.

mod app;

use std::io;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::App;

// ============================================================================
// Constants
// ============================================================================

/// Default polling interval for `watch <path>` (in seconds)
const DEFAULT_WATCH_INTERVAL_SECS: u64 = 60;

const USAGE: &str = "\
Usage: tokenkeep <command> [args]

Commands:
  login [username]                    Sign in and store the session
  logout                              Sign out and clear the stored session
  whoami                              Fetch the current user's profile
  status                              Show session and token state
  register <username> <email> [k=v]   Create an account
  get <path>                          GET a protected endpoint
  watch [path] [--interval secs]      Keep the session alive, optionally polling a path

Environment:
  TOKENKEEP_API_URL   Override the configured server URL
  RUST_LOG            Log filter (default: warn)";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Login { username: Option<String> },
    Logout,
    Whoami,
    Status,
    Register {
        username: String,
        email: String,
        extra: Vec<(String, String)>,
    },
    Get { path: String },
    Watch { path: Option<String>, interval: Duration },
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(command) = args.first() else {
        return Ok(Command::Help);
    };
    let rest = &args[1..];

    Ok(match command.as_str() {
        "login" => Command::Login {
            username: rest.first().cloned(),
        },
        "logout" => Command::Logout,
        "whoami" => Command::Whoami,
        "status" => Command::Status,
        "register" => {
            let [username, email, extra @ ..] = rest else {
                bail!("register needs <username> <email>");
            };
            let extra = extra
                .iter()
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
                    _ => bail!("expected key=value, got '{}'", pair),
                })
                .collect::<Result<Vec<_>>>()?;
            Command::Register {
                username: username.clone(),
                email: email.clone(),
                extra,
            }
        }
        "get" => match rest.first() {
            Some(path) => Command::Get { path: path.clone() },
            None => bail!("get needs <path>"),
        },
        "watch" => {
            let mut path = None;
            let mut interval = DEFAULT_WATCH_INTERVAL_SECS;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                if arg == "--interval" {
                    let Some(value) = iter.next() else {
                        bail!("--interval needs a number of seconds");
                    };
                    interval = match value.parse::<u64>() {
                        Ok(secs) if secs > 0 => secs,
                        _ => bail!("invalid interval '{}'", value),
                    };
                } else {
                    path = Some(arg.clone());
                }
            }
            Command::Watch {
                path,
                interval: Duration::from_secs(interval),
            }
        }
        "help" | "--help" | "-h" => Command::Help,
        other => bail!("unknown command '{}'", other),
    })
}

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
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };
    if command == Command::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    info!(?command, "tokenkeep starting");
    let mut app = App::new()?;

    let result = match command {
        Command::Login { username } => app.login(username).await,
        Command::Logout => app.logout().await,
        Command::Whoami => app.whoami().await,
        Command::Status => app.status(),
        Command::Register {
            username,
            email,
            extra,
        } => app.register(&username, &email, extra).await,
        Command::Get { path } => app.get(&path).await,
        Command::Watch { path, interval } => app.watch(path.as_deref(), interval).await,
        Command::Help => Ok(()),
    };

    app.shutdown();

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
