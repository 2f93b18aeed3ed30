//! pcmcast - audio fan-out daemon for Linux
//!
//! Run with `pcmcast` or `pcmcast daemon` to start the daemon.
//! Use `pcmcast devices` to list what the daemon would offer.
//! Use `pcmcast config` to show the effective configuration, or
//! `pcmcast config --default` for a commented starting file.

use clap::Parser;
use pcmcast::catalog::Catalog;
use pcmcast::cli::{Cli, Commands};
use pcmcast::config::{self, Config};
use pcmcast::daemon;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("pcmcast={},warn", log_level))),
        )
        .with_target(false)
        .init();

    // Load configuration
    let mut config = config::load_config(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.no_local_scan {
        config.devices.local_scan = false;
    }

    // Run the appropriate command
    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => {
            let mut daemon = daemon::Daemon::new(config);
            daemon.run().await?;
        }

        Commands::Devices { json } => {
            let catalog = daemon::discover(&config).await;
            show_devices(&catalog, json)?;
        }

        Commands::Config { default } => {
            if default {
                print!("{}", config::DEFAULT_CONFIG);
            } else {
                show_config(&config)?;
            }
        }
    }

    Ok(())
}

/// Print inputs and outputs
fn show_devices(catalog: &Catalog, json: bool) -> anyhow::Result<()> {
    let inputs = catalog.inputs();
    let outputs = catalog.unified_outputs();

    if json {
        let value = serde_json::json!({
            "inputs": inputs,
            "outputs": outputs,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Inputs\n");
    for input in &inputs {
        println!("  {:<60} {}", input.id, input.display_name);
    }

    println!("\nOutputs\n");
    if outputs.is_empty() {
        println!("  (none found)");
    }
    for output in &outputs {
        let stereo = if output.is_stereo { " [stereo]" } else { "" };
        println!("  {:<40} {}{}", output.ui_id, output.display_name, stereo);
        for member in &output.members {
            println!("      {}", member);
        }
    }

    Ok(())
}

/// Show current configuration
fn show_config(config: &Config) -> anyhow::Result<()> {
    println!("Current Configuration\n");
    println!("=====================\n");
    println!("{}", toml::to_string_pretty(config)?);

    println!("---");
    println!(
        "Config file: {:?}",
        Config::default_path().unwrap_or_else(|| PathBuf::from("(not found)"))
    );
    println!("Control server: http://{}/ws", config.bind_addr());
    println!("Documented defaults: pcmcast config --default");

    Ok(())
}
