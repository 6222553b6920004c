use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "ghproxy", about = "Streaming reverse proxy for GitHub content")]
pub struct Cli {
    /// Optional settings file (defaults to ./ghproxy.toml if present). Environment variables
    /// prefixed with GH_PROXY_ override file values.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
