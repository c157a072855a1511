mod config;
mod error;
mod weather;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mcp::{Hub, HubConfig};
use reactor::Reactor;
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use error::{Error, Result};

const CONFIG_FILE: &str = "mcphub.toml";

#[derive(Parser)]
#[command(name = "mcphub")]
#[command(about = "Launch, inspect and serve stdio tool providers", long_about = None)]
#[command(version)]
struct Cli {
    /// Log filter (e.g. "debug", "mcp=trace"); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Path to mcphub.toml
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo weather provider over stdio
    Serve,
    /// Load providers and list their tools
    Tools {
        /// Provider configuration (mcp.json or .toml)
        #[arg(short, long)]
        config: PathBuf,
        /// Print function-calling declarations as JSON
        #[arg(long)]
        json: bool,
    },
    /// Call a tool through the hub
    Call {
        /// Provider configuration (mcp.json or .toml)
        #[arg(short, long)]
        config: PathBuf,
        /// Function name, `<provider>__<tool>`
        function: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };
    // A pending stdin read in `serve` would otherwise block runtime shutdown.
    std::process::exit(code);
}

/// Logs go to stderr; stdout carries protocol traffic in `serve` mode.
fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_or_default(&cli.settings)?;

    match cli.command {
        Commands::Serve => cmd_serve(&config).await,
        Commands::Tools { config: hub, json } => cmd_tools(&config, &hub, json).await,
        Commands::Call {
            config: hub,
            function,
            args,
        } => cmd_call(&config, &hub, &function, &args).await,
    }
}

async fn cmd_serve(config: &Config) -> Result<()> {
    let reactor = Arc::new(Reactor::new(config.reactor_config()));
    weather::provider().register(reactor.registry());

    let signals = reactor.supervisor().listen_for_signals();
    let served = reactor.serve_stdio().await;
    // The listener exits once shutdown is requested.
    reactor.supervisor().shutdown();
    let _ = signals.await;

    info!("server stopped");
    served?;
    Ok(())
}

async fn cmd_tools(config: &Config, hub_config: &Path, json: bool) -> Result<()> {
    let hub = load_hub(config, hub_config).await?;

    if json {
        let declarations = hub.function_declarations();
        println!("{}", serde_json::to_string_pretty(&declarations)?);
    } else {
        for client in hub.clients() {
            println!("{}", client.name());
            for tool in client.tools() {
                let name = mcp::function_name(client.name(), &tool.name);
                println!("  {name:<40}  {}", tool.description);
                for param in &tool.parameters {
                    let marker = if param.required { "*" } else { " " };
                    println!(
                        "    {marker}{:<20}  {:<8}  {}",
                        param.name,
                        param.param_type.as_str(),
                        param.description
                    );
                }
            }
        }
    }

    dispose(hub).await;
    Ok(())
}

async fn cmd_call(config: &Config, hub_config: &Path, function: &str, args: &str) -> Result<()> {
    let arguments = parse_args(args)?;
    let hub = load_hub(config, hub_config).await?;

    let result = hub.call_function(function, arguments).await;
    dispose(hub).await;

    println!("{}", result?);
    Ok(())
}

fn parse_args(args: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(args) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::InvalidArgs(format!("expected a JSON object, got {other}"))),
        Err(e) => Err(Error::InvalidArgs(e.to_string())),
    }
}

async fn load_hub(config: &Config, path: &Path) -> Result<Hub> {
    let hub_config = HubConfig::load(path)?;
    let mut hub = Hub::with_options(config.client_options());

    let report = hub.load(&hub_config).await;
    for (name, error) in &report.failed {
        eprintln!("warning: provider '{name}' failed: {error}");
    }
    if hub.is_empty() {
        return Err(Error::NoProviders);
    }
    Ok(hub)
}

async fn dispose(mut hub: Hub) {
    hub.dispose_all().await;
}
