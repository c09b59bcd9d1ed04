//! BlueDroid Service - background sensor acquisition.
//!
//! Run with: `cargo run -p bluedroid-service`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use bluedroid_core::{BtleDriver, MockDriver, PeripheralDriver, SubscriberRegistry};
use bluedroid_service::{Config, ConsoleEndpoint, SensorService, default_config_path};

/// BlueDroid Service - discover BLE sensors, log their channels and stream readings.
#[derive(Parser, Debug)]
#[command(name = "bluedroid-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Sample log directory (overrides config).
    #[arg(short, long, global = true)]
    directory: Option<PathBuf>,

    /// Use simulated peripherals instead of Bluetooth.
    #[arg(long, global = true, value_name = "COUNT", num_args = 0..=1, default_missing_value = "1")]
    simulate: Option<usize>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the service in the foreground (default behavior).
    Run,

    /// Manage the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration.
    Show,

    /// Print the configuration file path.
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Command::Config { ref action }) => handle_config_action(&args, action),
        Some(Command::Run) | None => run_service(args).await,
    }
}

fn config_path(args: &Args) -> PathBuf {
    args.config.clone().unwrap_or_else(default_config_path)
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    if let Some(directory) = &args.directory {
        config.storage.directory = directory.clone();
    }
    Ok(config)
}

fn handle_config_action(args: &Args, action: &ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { force } => {
            let path = config_path(args);
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(&path)?;
            println!("Wrote {}", path.display());
        }
        ConfigAction::Show => {
            let config = load_config(args)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => println!("{}", config_path(args).display()),
    }
    Ok(())
}

async fn run_service(args: Args) -> anyhow::Result<()> {
    // Initialize logging
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("bluedroid_service={}", level).parse()?)
                .add_directive(format!("bluedroid_core={}", level).parse()?),
        )
        .init();

    let config = load_config(&args)?;
    config.validate()?;

    let driver: Arc<dyn PeripheralDriver> = match args.simulate {
        Some(count) => {
            info!("Simulating {} peripheral(s)", count);
            let driver = MockDriver::builder().acceleration(0.0, 0.0, 1.0).build();
            for _ in 0..count {
                driver.add_mock_peripheral();
            }
            Arc::new(driver)
        }
        None => Arc::new(
            BtleDriver::new(config.ble.to_options())
                .await
                .context("Bluetooth is unavailable")?,
        ),
    };

    let registry = Arc::new(SubscriberRegistry::new());
    registry.register(Arc::new(ConsoleEndpoint::stdout()));

    let service = SensorService::new(driver, registry);
    service.start(&config).await?;
    info!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    service.stop().await;

    Ok(())
}
