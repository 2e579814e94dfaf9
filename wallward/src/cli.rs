use clap::Parser;

use std::path::PathBuf;

/// Wallward system service - confines Docker container traffic with the
/// kernel packet filter
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Directory to keep persistent rule records in
    #[arg(short = 'd', long, env = "WALLWARD_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    /// Log sink, `stdout` or a file path
    #[arg(short = 'l', long, env = "WALLWARD_LOG_FILE", default_value = "stdout")]
    pub log: String,

    /// Verbose logging
    #[arg(long)]
    pub debug: bool,

    /// Remove every owned rule, chain, set and record, then exit
    #[arg(long)]
    pub clear: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}
