//! # Bus Configuration Validator
//!
//! Loads a bus configuration file (plus `ORCHBUS__*` environment overrides),
//! validates it and prints the effective configuration. Exits non-zero when
//! the configuration is invalid.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use orchbus_core::config::{BusConfig, ConfigLoader};
use std::path::PathBuf;
use std::process;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate bus configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// TOML configuration file; defaults only when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format for the effective configuration
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Tables to show resolved channel settings for
    #[arg(short, long = "table")]
    tables: Vec<String>,
}

fn main() {
    orchbus_core::logging::init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("❌ Configuration invalid: {e:#}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let config = loader.load().context("failed to load bus configuration")?;

    match cli.format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&config)
                .context("failed to render configuration")?;
            println!("{json}");
        }
        OutputFormat::Text => print_summary(&config, &cli.tables),
    }

    println!("✅ Configuration valid");
    Ok(())
}

fn print_summary(config: &BusConfig, tables: &[String]) {
    println!("multiplexer.wait_timeout_ms   = {}", config.multiplexer.wait_timeout_ms);
    println!("channel_defaults.batch_size   = {}", config.channel_defaults.batch_size);
    println!("channel_defaults.priority     = {}", config.channel_defaults.priority);
    println!("store.backend                 = {:?}", config.store.backend);
    println!(
        "store.database_url            = {}",
        if config.store.database_url.is_some() { "<set>" } else { "<unset>" }
    );
    println!("store.notification_buffer     = {}", config.store.notification_buffer_size);
    println!("store.max_payload_size        = {}", config.store.max_payload_size);
    println!("store.keyspace_notifications  = {}", config.store.keyspace_notifications);
    println!("retry.stuck_threshold_secs    = {}", config.retry.stuck_threshold_secs);

    let mut configured: Vec<_> = config.channels.keys().cloned().collect();
    configured.sort();
    for table in configured.iter().chain(tables) {
        let channel = config.channel(table);
        println!(
            "channels.{table}: batch_size={} priority={}",
            channel.batch_size, channel.priority
        );
    }
}
