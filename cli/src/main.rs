//! Cipher Fleet — CLI host for the connection fleet supervisor.
//!
//! Two subcommands:
//! - `cipher-fleet serve`: start the fleet and its HTTP management surface
//! - `cipher-fleet check`: validate a config file and print it with
//!   secrets redacted
//!
//! Exit codes: 0 clean shutdown, 1 unhandled error, 2 configuration error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use cipher_fleet::tools::builtin::register_builtin_tools;
use cipher_fleet::tools::internal::{InternalToolManager, InternalToolRegistry, ToolServices};
use cipher_fleet::{
    ApiState, ConnectionSettings, EmbeddingGate, FleetConfig, LifecycleConfig, LifecycleManager,
    NullSink, OperatingMode, UnifiedToolManager, router,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Cipher Fleet — supervisor for external tool servers.
#[derive(Parser)]
#[command(
    name = "cipher-fleet",
    version,
    about = "Cipher Fleet — supervisor for external tool servers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the fleet and serve the HTTP management surface
    Serve {
        /// Path to cipher.toml [default: ./cipher.toml or ~/.config/cipher/cipher.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// HTTP port to listen on
        #[arg(short, long, default_value = "3100")]
        port: u16,
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Operating mode for the unified tool catalog
        #[arg(long, default_value = "api")]
        mode: String,
    },
    /// Validate a config file and print it with secrets redacted
    Check {
        /// Path to cipher.toml [default: ./cipher.toml or ~/.config/cipher/cipher.toml]
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("INTERNAL_ERROR: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let outcome = runtime.block_on(async {
        match cli.command {
            Commands::Serve {
                config,
                port,
                host,
                mode,
            } => run_serve(config, host, port, &mode).await,
            Commands::Check { config } => run_check(config).await,
        }
    });

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("INTERNAL_ERROR: {e}");
            ExitCode::from(1)
        }
    }
}

/// Start the fleet from config and serve the management surface until ctrl-c.
async fn run_serve(
    config_path: Option<PathBuf>,
    host: String,
    port: u16,
    mode: &str,
) -> Result<ExitCode> {
    let Some(config) = load_validated_config(config_path).await? else {
        return Ok(ExitCode::from(2));
    };

    let mode = match parse_mode(mode) {
        Some(mode) => mode,
        None => {
            eprintln!("BAD_REQUEST: unknown mode '{mode}' (default|cli|aggregator|api)");
            return Ok(ExitCode::from(2));
        }
    };

    let sink = Arc::new(NullSink);
    let lifecycle = LifecycleManager::new(
        LifecycleConfig::default(),
        ConnectionSettings::default(),
        sink.clone(),
    );

    let registry = InternalToolRegistry::new();
    register_builtin_tools(&registry)
        .map_err(|e| anyhow::anyhow!("builtin tool registration failed: {e}"))?;
    let internal = Arc::new(InternalToolManager::new(
        registry.clone(),
        Arc::new(ToolServices::default()),
        sink.clone(),
    ));
    let tools = Arc::new(UnifiedToolManager::new(
        lifecycle.clone(),
        internal,
        mode,
        EmbeddingGate::default(),
        sink,
    ));

    if let Err(e) = lifecycle.start_all(&config).await {
        eprintln!("{}: {e}", e.code());
        lifecycle.shutdown().await;
        return Ok(ExitCode::from(2));
    }

    let app = router(Arc::new(ApiState {
        lifecycle: lifecycle.clone(),
        tools,
    }));

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    tracing::info!(host = %host, port = %port, "management surface listening");

    let shutdown_fleet = lifecycle.clone();
    let served = axum::serve(listener, app).with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down cipher-fleet");
    });

    let result = served.await;
    shutdown_fleet.shutdown().await;
    registry.clear(true).ok();

    match result {
        Ok(()) => Ok(ExitCode::from(0)),
        Err(e) => Err(anyhow::anyhow!("management surface error: {e}")),
    }
}

/// Validate the config and print the redacted export.
async fn run_check(config_path: Option<PathBuf>) -> Result<ExitCode> {
    let Some(config) = load_validated_config(config_path).await? else {
        return Ok(ExitCode::from(2));
    };
    match config.to_redacted_toml() {
        Ok(exported) => {
            println!("{exported}");
            Ok(ExitCode::from(0))
        }
        Err(e) => {
            eprintln!("{}: {e}", e.code());
            Ok(ExitCode::from(2))
        }
    }
}

fn parse_mode(mode: &str) -> Option<OperatingMode> {
    match mode {
        "default" => Some(OperatingMode::Default),
        "cli" => Some(OperatingMode::Cli),
        "aggregator" => Some(OperatingMode::Aggregator),
        "api" => Some(OperatingMode::Api),
        _ => None,
    }
}

/// Resolve, read, parse, and validate the config. Prints the error and
/// returns `None` when the config is at fault (exit code 2 territory).
async fn load_validated_config(explicit: Option<PathBuf>) -> Result<Option<FleetConfig>> {
    let path = match resolve_config(explicit) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("MCP_SERVER_ERROR: {e}");
            return Ok(None);
        }
    };

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) => {
            eprintln!("MCP_SERVER_ERROR: failed to read {path:?}: {e}");
            return Ok(None);
        }
    };

    let config: FleetConfig = match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("MCP_SERVER_ERROR: failed to parse {path:?}: {e}");
            return Ok(None);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("{}: {e}", e.code());
        return Ok(None);
    }

    Ok(Some(config))
}

/// Resolve config file path: explicit flag → ./cipher.toml → ~/.config/cipher/cipher.toml.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("cipher.toml");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("cipher").join("cipher.toml");
        if xdg.exists() {
            return Ok(xdg);
        }
    }

    Err(anyhow::anyhow!(
        "no cipher.toml found. Searched ./cipher.toml and ~/.config/cipher/cipher.toml. \
         Use --config to specify a path."
    ))
}
