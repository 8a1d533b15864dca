//! Binary entrypoint for the evogateway CLI.
//!
//! Commands:
//! - `start` - run the gateway: open serial links, connect to the broker, poll
//! - `init` - create a starter `evogateway.toml`
//! - `status` - print the configuration summary and the device registry
//!
//! See the library crate docs for module-level details: `evogateway::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use evogateway::config::Config;
use evogateway::gateway::Gateway;
use evogateway::registry::Registry;

#[derive(Parser)]
#[command(name = "evogateway")]
#[command(about = "evohome RF listener/sender gateway bridging serial radios to MQTT")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "evogateway.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start,
    /// Write a default configuration file
    Init,
    /// Show the configuration summary and known devices
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config early to configure logging (except for Init which writes it)
    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            info!("Starting evogateway v{}", env!("CARGO_PKG_VERSION"));
            let mut gateway = Gateway::new(config).await?;
            gateway.run().await?;
        }
        Commands::Init => {
            if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                eprintln!("Refusing to overwrite existing {}", cli.config);
                std::process::exit(1);
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            let registry = Registry::load(
                &config.files.devices_file,
                &config.files.new_devices_file,
                &config.sender.controller_id,
                &config.sender.gateway_id,
                &config.sender.gateway_name,
            )?;
            println!("evogateway v{}", env!("CARGO_PKG_VERSION"));
            println!("Controller: {}", config.sender.controller_id);
            println!(
                "Gateway:    {} ({})",
                config.sender.gateway_id, config.sender.gateway_name
            );
            for (name, port) in &config.serial.ports {
                println!(
                    "Serial:     {} @ {} baud{}",
                    name,
                    port.baud,
                    if port.is_send_port { " [send]" } else { "" }
                );
            }
            if config.mqtt.server.is_empty() {
                println!("MQTT:       disabled (listener only)");
            } else {
                println!("MQTT:       {}:{}", config.mqtt.server, config.mqtt.port);
            }
            registry.log_devices();
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);
    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    if let Some(path) = log_file {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // When stdout is not a terminal (service unit, cron) the file is
            // the only sink; no point duplicating lines into a captured pipe.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        } else {
            eprintln!("Warning: could not open log file {}", path);
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
