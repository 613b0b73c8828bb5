use std::path::PathBuf;

use clap::{Parser, ValueHint};

/// Drive kms outputs directly, without a display server.
#[derive(clap::Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The drm device to use. May be given more than once
    #[arg(
        short,
        long,
        value_name("PATH"),
        value_hint(ValueHint::FilePath),
        default_value = "/dev/dri/card0",
        global = true
    )]
    pub device: Vec<PathBuf>,

    /// Read the output layout from this TOML file
    #[arg(short, long, value_name("FILE"), value_hint(ValueHint::FilePath), global = true)]
    pub config: Option<PathBuf>,

    /// Also write logs to a file in this directory
    #[arg(long, value_name("DIR"), value_hint(ValueHint::DirPath), global = true)]
    pub log_dir: Option<PathBuf>,

    /// Use atomic modesetting if the driver supports it
    ///
    /// Overrides `modeset` in the config file.
    #[arg(long, global = true)]
    pub atomic: bool,

    #[command(subcommand)]
    pub subcommand: CliSubcommand,
}

#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CliSubcommand {
    /// Print the drivers, connectors and modes of the devices
    Info,
    /// Light up every configured output and flip through solid colours
    Run(RunArgs),
}

#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    /// How many frames to post before exiting
    #[arg(short, long, default_value_t = 120)]
    pub frames: u32,

    /// Never scan out client buffers directly
    #[arg(long)]
    pub no_bypass: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
