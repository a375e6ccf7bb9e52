use clap::Parser;
use log::{error, info};
use raypoint::config::Config;
use raypoint::error::Result;
use raypoint::registry::{init_global_registry, Registry};
use raypoint::server::Server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "raypoint")]
#[command(about = "A pluggable proxy endpoint: one inbound protocol routed through one outbound protocol")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Args::parse()).await {
        error!("{}", e);
        eprintln!("raypoint: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Override config with command line arguments
    if args.debug {
        config.logging.level = "debug".to_string();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.logging.level)).init();

    let registry = init_global_registry(Registry::with_builtin()?)?;
    info!(
        "Protocols: inbound {:?}, outbound {:?}",
        registry.inbound_protocols(),
        registry.outbound_protocols()
    );

    let server = Server::new(&config.server, registry)?;
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
