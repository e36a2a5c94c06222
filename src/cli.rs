use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "proxup", about = "Declarative Proxmox VM provisioning from YAML")]
pub struct Cli {
    /// Directory containing VM configuration YAML files
    #[arg(short, long, default_value = "./config")]
    pub config_dir: PathBuf,

    /// Output format for declarations and exports
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download boot images, create the configured VMs, and print exports
    Up {
        /// Interface slot (after the first reported entry) for the first
        /// exported IPv4 address
        #[arg(long, default_value_t = 6)]
        ip_first: usize,

        /// Interface slot (after the first reported entry) for the second
        /// exported IPv4 address
        #[arg(long, default_value_t = 7)]
        ip_second: usize,
    },

    /// Build declarations from the config directory and print them without
    /// contacting the cluster
    Plan,

    /// Check that every config file builds into valid declarations
    Validate,
}

#[derive(ValueEnum, Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}
