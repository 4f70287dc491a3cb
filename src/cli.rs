use std::path::PathBuf;

use clap::Parser;

/// Unattended file-transfer daemon: watches an ingest directory and fans
/// completed files out to filesystem/S3/FTP/SFTP destinations.
#[derive(Parser, Debug)]
#[command(name = "replicatord", version, about)]
pub struct Cli {
    /// Path to a YAML config file. Defaults to `./replicatord.yaml` if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the ingest root directory.
    #[arg(long)]
    pub ingest_root: Option<PathBuf>,

    /// Override the worker pool size.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Override the bounded queue capacity.
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Override the completeness gate's round count.
    #[arg(long)]
    pub rounds: Option<usize>,

    /// Override the health HTTP listener port.
    #[arg(long)]
    pub health_port: Option<u16>,

    /// Override the log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}
