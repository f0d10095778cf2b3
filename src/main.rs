use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nextdhcp::database::DatabaseConfig;
use nextdhcp::{Config, DhcpServer, Error, ProtocolEngine, Result, store};

#[derive(Parser)]
#[command(name = "nextdhcp")]
#[command(author, version, about = "A DHCPv4 server with PostgreSQL-backed leases", long_about = None)]
struct Cli {
    /// Configuration directory (containing config.json) or file.
    #[arg(short, long, env = "NEXTDHCP_CONFIG", default_value = "/config")]
    config: PathBuf,

    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(flatten)]
    database: DatabaseConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve DHCP on port 67 (default).
    Run,
    /// Print the validated configuration.
    ShowConfig,
    /// Write a default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print every lease known to the lease store.
    ListLeases,
    /// Expire lapsed offers and bindings once and exit.
    SweepLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli.config, &cli.database).await,
        Commands::ShowConfig => {
            let config = load_config(&cli.config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::InitConfig { force } => init_config(&cli.config, force),
        Commands::ListLeases => list_leases(&cli.config, &cli.database).await,
        Commands::SweepLeases => {
            let config = load_config(&cli.config)?;
            let store = store::connect(&cli.database, &config).await?;
            let report = store.expire().await?;
            store.flush().await?;
            println!(
                "Expired {} offer(s) and {} binding(s); cleared {} declined address(es).",
                report.offers_expired, report.bindings_expired, report.declines_cleared
            );
            Ok(())
        }
    }
}

/// Configuration problems are fatal before anything binds.
fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).inspect_err(|error| {
        error!("Failed to load configuration from {}: {}", path.display(), error);
    })
}

async fn run(config_path: &Path, database: &DatabaseConfig) -> Result<()> {
    let config = load_config(config_path)?;
    info!("Starting DHCP server with config: {:?}", config_path);
    info!("Lease store: {:?}", database);

    let store = store::connect(database, &config).await?;
    let engine = ProtocolEngine::start(config, store).await?;
    let server = DhcpServer::new(engine).await?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping server...");
            if let Err(error) = server.shutdown().await {
                error!("Failed to flush leases on shutdown: {}", error);
            }
            Ok(())
        }
    }
}

async fn list_leases(config_path: &Path, database: &DatabaseConfig) -> Result<()> {
    let config = load_config(config_path)?;
    let store = store::connect(database, &config).await?;
    let leases = store.list_leases().await?;

    if leases.is_empty() {
        println!("No leases.");
        return Ok(());
    }

    println!(
        "{:<24} {:<16} {:<10} {:<9} {:<24} {:<10}",
        "Client ID", "IP Address", "Subnet", "State", "Expires At", "Remaining"
    );
    println!("{}", "-".repeat(98));

    for lease in leases {
        let remaining_str = if lease.is_active() && !lease.is_expired() {
            format!("{}s", lease.remaining_seconds())
        } else {
            "-".to_string()
        };

        println!(
            "{:<24} {:<16} {:<10} {:<9} {:<24} {:<10}",
            lease.client_id,
            lease.ip_address,
            lease.subnet,
            lease.state.as_str(),
            lease.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
            remaining_str
        );
    }

    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    let target = Config::resolve_path(path);
    if target.exists() && !force {
        return Err(Error::InvalidConfig(format!(
            "{} already exists (use --force to overwrite)",
            target.display()
        )));
    }

    Config::default().save(&target)?;
    println!("Wrote default configuration to {}", target.display());
    Ok(())
}
