use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "conntrack-relay",
    about = "Relay TCP connections to an upstream with per-connection accounting"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Accept clients and relay them to the upstream until Ctrl-C
    Run(RunArgs),
    /// Manage conntrack configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Address to accept clients on
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Address to relay every client to
    #[arg(long, value_name = "ADDR")]
    pub upstream: Option<String>,

    /// Remote-host label for the upstream leg (defaults to the address)
    #[arg(long, value_name = "LABEL")]
    pub upstream_label: Option<String>,

    /// Seconds without traffic before a relay is closed as idle
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// Seconds to wait for open relays on shutdown
    #[arg(long, value_name = "SECS")]
    pub drain_timeout: Option<u64>,

    /// Load an additional config file on top of defaults
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore all config files; use only CLI flags
    #[arg(long)]
    pub no_config: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file
    Init {
        #[arg(long)]
        global: bool,
    },
    /// Print the effective merged configuration
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}
