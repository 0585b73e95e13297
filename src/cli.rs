use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// sitewalker cli
#[derive(Parser)]
#[command(name = "sitewalker")]
#[command(about = "A coordinated web crawler with archival resource handlers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a crawl from a JSON config file until it completes
    Start {
        /// path to the config file
        #[arg(default_value = "sitewalker.config.json")]
        config: PathBuf,
    },

    /// Print the canonical form of a URL
    Normalize {
        /// url to canonicalize
        url: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
