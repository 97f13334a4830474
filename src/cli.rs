use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// The command line interface for serial mux.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// The physical serial device to share (overrides the configuration file)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Baud rate of the physical device (overrides the configuration file)
    #[arg(short, long)]
    pub baud: Option<u32>,

    /// Where to publish a virtual port, may be repeated (replaces the configured list)
    #[arg(short = 'p', long = "virtual-port")]
    pub virtual_ports: Vec<PathBuf>,

    /// Enable logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Also write logs to daily rolling files in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Apply command line overrides on top of a configuration.
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(device) = &self.device {
            config.device.path = device.clone();
        }

        if let Some(baud) = self.baud {
            config.device.baud = baud;
        }

        if !self.virtual_ports.is_empty() {
            config.virtual_ports = self.virtual_ports.clone();
        }

        config
    }
}

/// Commands available in the command line interface.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone, Debug)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}

/// Run a subcommand, printing its output to stdout.
pub fn handle_command(command: Commands) {
    match command {
        Commands::Examples(Examples::Config) => {
            println!("{}", Config::example().serialize_pretty());
        }
    }
}
