//! PhazeVPN CLI - tunnel client/server
//!
//! Runs as either a server (accepting handshakes and relaying for many
//! clients) or a client (connecting to one server), configured from an
//! INI-style file. Also hashes passwords for `[User]` sections.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use phazevpn::crypto::password::hash_password;
use phazevpn::error::ConfigError;
use phazevpn::{TunnelClient, TunnelConfig, TunnelServer, VpnError};

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Client,
    Server,
}

/// PhazeVPN - point-to-point UDP tunnel
#[derive(Parser, Debug)]
#[command(name = "phazevpn")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, required_unless_present = "hash_password")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Force server mode
    #[arg(long, conflicts_with = "client")]
    server: bool,

    /// Force client mode
    #[arg(long, conflicts_with = "server")]
    client: bool,

    /// Print the password hash for USER (password read from stdin)
    #[arg(long, value_name = "USER", conflicts_with_all = ["config", "server", "client"])]
    hash_password: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt().with_env_filter(filter).with_target(false).init();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), VpnError> {
    if let Some(user) = &args.hash_password {
        return print_password_hash(user);
    }

    let config_path = args.config.as_ref().ok_or_else(|| ConfigError::MissingField {
        field: "--config".to_string(),
    })?;
    tracing::info!("Loading configuration from: {}", config_path.display());

    let config = TunnelConfig::from_file(config_path)?;

    match determine_mode(&args, &config)? {
        Mode::Client => {
            tracing::info!("PhazeVPN client starting...");
            let client = TunnelClient::connect(&config).await?;
            run_client(&client).await
        }
        Mode::Server => {
            tracing::info!("PhazeVPN server starting...");
            let server = TunnelServer::bind(&config).await?;
            run_server(&server).await
        }
    }
}

/// Read one password line from stdin and print its hex hash
fn print_password_hash(user: &str) -> Result<(), VpnError> {
    let mut password = String::new();
    std::io::stdin().lock().read_line(&mut password)?;
    let password = password.trim_end_matches(['\r', '\n']);

    let hash = hash_password(user, password)?;
    println!("{}", hex::encode(hash));
    Ok(())
}

/// Determine operating mode from args and config
fn determine_mode(args: &Args, config: &TunnelConfig) -> Result<Mode, VpnError> {
    // Explicit flags take precedence
    if args.server {
        return Ok(Mode::Server);
    }
    if args.client {
        return Ok(Mode::Client);
    }

    match (&config.server, &config.client) {
        (Some(_), None) => {
            tracing::info!("Auto-detected server mode ([Server] section present)");
            Ok(Mode::Server)
        }
        (None, Some(_)) => {
            tracing::info!("Auto-detected client mode ([Client] section present)");
            Ok(Mode::Client)
        }
        // Ambiguous - require explicit flag
        _ => Err(ConfigError::ParseError {
            line: 0,
            message: "Cannot determine mode. Use --server or --client flag.".to_string(),
        }
        .into()),
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}

/// Run the client with graceful shutdown on Ctrl+C or SIGTERM
async fn run_client(client: &TunnelClient) -> Result<(), VpnError> {
    let run = client.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = shutdown_signal() => {
            client.stop();
            run.await
        }
    }
}

/// Run the server with graceful shutdown on Ctrl+C or SIGTERM
async fn run_server(server: &TunnelServer) -> Result<(), VpnError> {
    let run = server.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = shutdown_signal() => {
            server.stop();
            run.await
        }
    }
}
