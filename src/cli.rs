// Command-line interface definitions for pcmcast
//
// This module is separate so it can be used by both the binary (main.rs)
// and build.rs for generating man pages.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pcmcast")]
#[command(author, version, about = "Capture one audio input and fan it out to local and networked speakers")]
#[command(long_about = "
pcmcast captures audio from one input (a sound card or a Bluetooth phone)
and plays it live on any number of local sound cards and network receivers.
A browser connected to the control WebSocket picks the input, the outputs
and the volume.

SETUP:
  1. Install alsa-utils (arecord/aplay)
  2. Install a streaming program for network receivers (default: raop_play)
  3. Optionally install bluez-alsa to capture from Bluetooth devices
  4. Run: pcmcast devices (to check what will be offered)
  5. Run: pcmcast (to start the daemon)

USAGE:
  Connect a control client to ws://<host>:3000/ws.
  Only one connection controls the daemon at a time; others can take over.
")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Override the control server port
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Do not rescan local sound cards periodically
    #[arg(long)]
    pub no_local_scan: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as daemon (default if no command specified)
    Daemon,

    /// List the inputs and outputs the daemon would offer
    Devices {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show current configuration
    Config {
        /// Print the documented default config file instead
        #[arg(long)]
        default: bool,
    },
}
