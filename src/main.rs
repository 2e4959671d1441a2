//! Main entry point for the amplicon_otu application.
//!
//! Turns raw 16S amplicon reads into sample-resolved OTU tables:
//! 1. Splitting the raw reads into chunks.
//! 2. Demultiplexing, primer removal, and quality/length trimming per chunk.
//! 3. Merging, renumbering and dereplicating the trimmed reads.
//! 4. Clustering OTUs and matching them against a reference database.
//! 5. Building OTU tables and the dataset results folder.
//!
//! Taxonomy collapsing and feature assembly run as separate subcommands over
//! a results folder.

mod bio;
mod cli;
mod config;
mod features;
mod io;
mod otu_table;
mod pipeline;
mod summary;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{run_cli, Cli};
use log::info;
use std::fs::File;
use std::path::Path;

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;
    info!("Starting amplicon_otu {}", env!("CARGO_PKG_VERSION"));

    run_cli(cli)
}
