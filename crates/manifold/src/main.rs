//! Manifold: a local gateway that aggregates MCP backends behind one
//! unified endpoint.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use manifold_config::{default_config_dir, BackendStatus, ConfigStore};
use manifold_credentials::CredentialStore;
use manifold_mcp::{Authorizer, CallbackHub, ConnectionManager, McpError};
use manifold_server::GatewayState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "manifold", version, about = "Local MCP gateway")]
struct Cli {
    /// Configuration directory (defaults to the platform config dir).
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value_t = 8090)]
        port: u16,
    },
    /// Inspect and control configured backends.
    Backends {
        #[command(subcommand)]
        command: BackendsCommand,
    },
    /// Manage backend authorization.
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
}

#[derive(Subcommand)]
enum BackendsCommand {
    /// List configured backends and their status.
    List,
    /// Enable a backend.
    Enable { id: String },
    /// Disable a backend.
    Disable { id: String },
}

#[derive(Subcommand)]
enum AuthCommand {
    /// Run the browser authorization flow for a backend and connect.
    Login {
        id: String,
        /// Port for the local callback endpoint.
        #[arg(short, long, default_value_t = 8090)]
        port: u16,
    },
    /// Delete everything stored for a backend.
    Clear { id: String },
}

/// Initialize logging to stdout with an env-filter.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        "manifold=debug,manifold_config=debug,manifold_credentials=debug,manifold_mcp=debug,manifold_server=debug,tower_http=debug"
    } else {
        "manifold=info,manifold_mcp=info,manifold_server=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

fn config_dir(cli: &Cli) -> Result<PathBuf> {
    match &cli.config_dir {
        Some(dir) => Ok(dir.clone()),
        None => default_config_dir().context("Could not determine config directory"),
    }
}

struct Services {
    config: Arc<ConfigStore>,
    credentials: Arc<CredentialStore>,
    callbacks: Arc<CallbackHub>,
    manager: Arc<ConnectionManager>,
}

async fn build_services(dir: PathBuf, port: u16) -> Result<Services> {
    let config = Arc::new(ConfigStore::open(dir).await?);
    let credentials = Arc::new(CredentialStore::new()?);
    let callbacks = Arc::new(CallbackHub::new());
    let authorizer = Authorizer::new(credentials.clone(), callbacks.clone(), port);
    let manager = Arc::new(ConnectionManager::new(
        config.clone(),
        credentials.clone(),
        authorizer,
    ));
    Ok(Services {
        config,
        credentials,
        callbacks,
        manager,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let dir = config_dir(&cli)?;

    match cli.command {
        Command::Serve { port } => serve(dir, port).await,
        Command::Backends { command } => backends(dir, command).await,
        Command::Auth { command } => auth(dir, command).await,
    }
}

async fn serve(dir: PathBuf, port: u16) -> Result<()> {
    let services = build_services(dir, port).await?;
    let state = GatewayState::new(
        services.config.clone(),
        services.credentials,
        services.manager.clone(),
        services.callbacks.clone(),
        port,
    );

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind 127.0.0.1:{port}"))?;

    // Bring up every enabled backend; failures are reflected in the
    // persisted status fields rather than aborting startup.
    for backend in services.config.backends().await {
        if backend.enabled {
            if let Err(e) = services.manager.start(&backend.id, false).await {
                warn!(backend = %backend.id, error = %e, "Backend failed to start");
            }
        }
    }
    state.registry.refresh().await;

    let manager = services.manager.clone();
    let callbacks = services.callbacks;
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
        callbacks.cancel_all().await;
        manager.shutdown().await;
    };

    manifold_server::serve(state, listener, shutdown).await?;
    Ok(())
}

async fn backends(dir: PathBuf, command: BackendsCommand) -> Result<()> {
    let config = ConfigStore::open(dir).await?;
    match command {
        BackendsCommand::List => {
            let backends = config.backends().await;
            if backends.is_empty() {
                println!("No backends configured.");
                return Ok(());
            }
            println!(
                "{:<24} {:<12} {:<9} {:<8} error",
                "id", "code", "status", "enabled"
            );
            for backend in backends {
                println!(
                    "{:<24} {:<12} {:<9} {:<8} {}",
                    backend.id,
                    backend.code,
                    format!("{:?}", backend.status).to_lowercase(),
                    backend.enabled,
                    backend.latest_error.as_deref().unwrap_or("-"),
                );
            }
        }
        BackendsCommand::Enable { id } => {
            config.set_enabled(&id, true).await?;
            println!("Enabled {id}. Takes effect on the next gateway reload.");
        }
        BackendsCommand::Disable { id } => {
            config.set_enabled(&id, false).await?;
            config
                .set_backend_status(&id, BackendStatus::Stopped, None, None)
                .await?;
            println!("Disabled {id}.");
        }
    }
    Ok(())
}

async fn auth(dir: PathBuf, command: AuthCommand) -> Result<()> {
    match command {
        AuthCommand::Login { id, port } => {
            let services = build_services(dir, port).await?;
            let state = GatewayState::new(
                services.config.clone(),
                services.credentials,
                services.manager.clone(),
                services.callbacks.clone(),
                port,
            );

            // The authorization flow needs the callback endpoint up on
            // the same port the redirect URI names.
            let listener = TcpListener::bind(("127.0.0.1", port))
                .await
                .with_context(|| {
                    format!("Failed to bind 127.0.0.1:{port} (is the gateway already running?)")
                })?;
            let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
            let server = tokio::spawn(manifold_server::serve(state, listener, async move {
                let _ = stop_rx.await;
            }));

            println!("Starting authorization for {id}; your browser will open.");
            let result = services.manager.start(&id, true).await;
            let _ = stop_tx.send(());
            let _ = server.await;

            match result {
                Ok(()) => {
                    println!("Authorized and connected.");
                    services.manager.shutdown().await;
                    Ok(())
                }
                Err(McpError::AuthRequired) => {
                    anyhow::bail!("Authorization did not complete; try again")
                }
                Err(e) => Err(e).context("Authorization failed"),
            }
        }
        AuthCommand::Clear { id } => {
            let credentials = CredentialStore::new()?;
            if credentials.clear_backend(&id).await? {
                println!("Cleared credentials for {id}.");
            } else {
                println!("No credentials stored for {id}.");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::parse_from(["manifold", "serve"]);
        match cli.command {
            Command::Serve { port } => assert_eq!(port, 8090),
            _ => panic!("Expected serve command"),
        }
        assert!(!cli.verbose);
    }

    #[test]
    fn test_serve_with_port_and_verbose() {
        let cli = Cli::parse_from(["manifold", "-v", "serve", "--port", "9999"]);
        match cli.command {
            Command::Serve { port } => assert_eq!(port, 9999),
            _ => panic!("Expected serve command"),
        }
        assert!(cli.verbose);
    }

    #[test]
    fn test_backends_subcommands() {
        let cli = Cli::parse_from(["manifold", "backends", "enable", "srv/a"]);
        match cli.command {
            Command::Backends {
                command: BackendsCommand::Enable { id },
            } => assert_eq!(id, "srv/a"),
            _ => panic!("Expected backends enable"),
        }
    }

    #[test]
    fn test_auth_login_port() {
        let cli = Cli::parse_from(["manifold", "auth", "login", "srv/a", "--port", "7001"]);
        match cli.command {
            Command::Auth {
                command: AuthCommand::Login { id, port },
            } => {
                assert_eq!(id, "srv/a");
                assert_eq!(port, 7001);
            }
            _ => panic!("Expected auth login"),
        }
    }

    #[test]
    fn test_config_dir_override() {
        let cli = Cli::parse_from(["manifold", "--config-dir", "/tmp/x", "serve"]);
        assert_eq!(config_dir(&cli).unwrap(), PathBuf::from("/tmp/x"));
    }
}
