// Main binary that starts the zonegate daemon and its operator commands.

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use std::io::stderr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

use zonegate_server::config::Config;
use zonegate_server::run as run_server;

mod cmd;

#[derive(Parser, Debug)]
#[command(author, version, about = "zonegate — DNS control-plane daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the YAML config file (default: search /etc/zonegate and CWD)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the zonegate daemon
    Serve,
    /// Query a running daemon's /status endpoint and print a summary
    Status,
    /// Register this node as an extra DNS server on every configured upstream
    Register,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let default_directives = format!(
        "zonegate={level},zonegate_server={level},zonegate_common={level},tower=warn,hyper=warn,sqlx=warn,rustls=warn,h2=warn,reqwest=warn,mio=warn",
        level = default_level
    );
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Serve => {
            info!("Starting zonegate server — press Ctrl+C to stop");
            if let Err(e) = run_server(config).await {
                error!("Server failed: {:#}", e);
                eprintln!("Error running zonegate: {e}");
                std::process::exit(1);
            }
        }
        Commands::Status => {
            if let Err(e) = cmd::status::print_status(&config).await {
                eprintln!("Error fetching status: {e}");
                std::process::exit(1);
            }
        }
        Commands::Register => {
            if let Err(e) = cmd::register::register_with_upstreams(&config).await {
                error!("Registration failed: {:#}", e);
                eprintln!("Error registering with upstreams: {e}");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
