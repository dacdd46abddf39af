//! CLI entry point for `mxserver`.
//!
//! # Usage
//!
//! Serve a database:
//! ```bash
//! mxserver -f config/mxserver.db.toml -p 9727
//! ```
//!
//! List registered drivers:
//! ```bash
//! mxserver driverinfo --json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mx_core::{CallbackSender, DriverRegistry};
use mx_server::{ConnectionAcl, MxServer};
use rust_mx::{config::ServerConfig, database, driverinfo, logging};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mxserver")]
#[command(about = "Instrument control server", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Device database
    #[arg(short = 'f', long)]
    database: Option<PathBuf>,

    /// Connection access control list
    #[arg(short = 'C', long)]
    acl: Option<PathBuf>,

    /// TCP port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Also listen on this Unix domain socket
    #[arg(short = 'u', long)]
    unix: Option<PathBuf>,

    /// Value format for new connections (ascii, raw, xdr)
    #[arg(short = 'b', long)]
    data_format: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print superclasses, classes and drivers, then exit
    Driverinfo {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(path) = &self.database {
            config.database.path = path.clone();
        }
        if let Some(path) = &self.acl {
            config.database.acl_path = Some(path.clone());
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = &self.unix {
            config.server.unix_path = Some(path.clone());
        }
        if let Some(format) = &self.data_format {
            config.server.data_format = format.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        ServerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let mut registry = DriverRegistry::new();
    let count = mx_driver_soft::register_all(&mut registry).context("Driver registration failed")?;
    if let Err(e) = registry.verify_all() {
        error!(error = %e, "Driver table verification failed");
        std::process::exit(1);
    }
    info!(drivers = count, "Drivers registered");

    if let Some(Commands::Driverinfo { json }) = cli.command {
        if json {
            println!("{}", driverinfo::render_json(&registry)?);
        } else {
            print!("{}", driverinfo::render(&registry));
        }
        return Ok(());
    }

    run_server(config, registry).await
}

async fn run_server(config: ServerConfig, registry: DriverRegistry) -> Result<()> {
    let options = config.server_options()?;

    let acl = match &config.database.acl_path {
        Some(path) => ConnectionAcl::load(path)
            .with_context(|| format!("Failed to load ACL {}", path.display()))?,
        None => ConnectionAcl::allow_all(),
    };

    let (notifier, callbacks_rx) = CallbackSender::channel(options.callback_queue_capacity);
    let records = database::load_database(&registry, &config.database.path, Some(notifier.clone()))
        .await
        .context("Failed to load device database")?;

    let server = MxServer::bind(
        options,
        Arc::new(registry),
        records,
        acl,
        (notifier, callbacks_rx),
    )
    .await
    .context("Failed to start server")?;

    info!(address = %server.local_addr(), "mxserver ready");

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    server.run().await.context("Server loop failed")?;
    info!("mxserver stopped");
    Ok(())
}
