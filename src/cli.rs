use crate::bio::{collapse, LineageMap, TaxonomicRank};
use crate::config::{KernelKind, PipelineConfig};
use crate::features::assemble_features;
use crate::otu_table::OtuTable;
use crate::pipeline::{generate_report, AmpliconProcessor, RunOptions, SUMMARY_FILE_NAME};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "16S amplicon reads to OTU tables and sample features", long_about = None)]
pub struct Cli {
    /// JSON pipeline configuration; built-in defaults when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Worker threads per stage (defaults to the number of CPUs)
    #[arg(short, long, global = true)]
    pub threads: Option<usize>,

    /// Write log output to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process the raw reads of a dataset into OTU tables
    Process {
        /// Dataset directory holding summary_file.txt and the files it lists
        #[arg(short, long)]
        input_dir: PathBuf,

        /// Working directory (default: $HOME/proc/<dataset>_proc_16S)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Primers were already removed from the reads
        #[arg(short, long)]
        primers_removed: bool,

        /// Reads are already split by sample
        #[arg(short = 'b', long)]
        split_by_barcodes: bool,

        /// Reference database for closed-reference OTU ids
        #[arg(long)]
        reference_db: Option<PathBuf>,

        /// Trim reads in-process instead of with usearch
        #[arg(long)]
        native_kernel: bool,
    },

    /// Collapse an OTU table to relative abundances at a taxonomic rank
    Collapse {
        /// OTU table in classic tab-separated format
        #[arg(long)]
        table: PathBuf,

        /// OTU id to lineage file
        #[arg(long)]
        taxonomy: PathBuf,

        /// kingdom, phylum, class, order, family, genus or species
        #[arg(long)]
        rank: TaxonomicRank,

        /// Only keep taxa under this parent-rank name
        #[arg(long)]
        parent: Option<String>,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Assemble per-sample feature vectors of a processed dataset
    Features {
        /// Summary file in the results folder
        #[arg(short, long)]
        summary: PathBuf,

        /// Additional predicted metagenome tables (BIOM JSON)
        #[arg(long)]
        predictions: Vec<PathBuf>,

        #[arg(short, long)]
        output: PathBuf,
    },
}

/// Main entry point for CLI
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if cli.threads.is_some() {
        config.threads = cli.threads;
    }

    match cli.command {
        Commands::Process {
            input_dir,
            output_dir,
            primers_removed,
            split_by_barcodes,
            reference_db,
            native_kernel,
        } => {
            if reference_db.is_some() {
                config.otu.reference_database = reference_db;
            }
            if native_kernel {
                config.tools.kernel = KernelKind::Native;
            }
            let processor = AmpliconProcessor::new(config)?;
            let options = RunOptions {
                output_dir,
                primers_removed,
                split_by_barcodes,
            };
            let summary_path = input_dir.join(SUMMARY_FILE_NAME);
            let results = processor
                .run(&summary_path, &options)
                .with_context(|| format!("Processing of {} failed", input_dir.display()))?;
            println!("{}", generate_report(&results)?);
        }

        Commands::Collapse {
            table,
            taxonomy,
            rank,
            parent,
            output,
        } => {
            let otu_table = OtuTable::read_classic(&table)
                .with_context(|| format!("Failed to read OTU table {}", table.display()))?;
            let lineages = LineageMap::load(&taxonomy)
                .with_context(|| format!("Failed to read taxonomy {}", taxonomy.display()))?;
            let collapsed = collapse(&otu_table, &lineages, rank, parent.as_deref())?;
            collapsed.write(&output)?;
            info!(
                "Wrote {} {} taxa to {}",
                collapsed.taxa.len(),
                rank,
                output.display()
            );
        }

        Commands::Features {
            summary,
            predictions,
            output,
        } => {
            let features = assemble_features(&summary, &predictions)
                .with_context(|| format!("Feature assembly from {} failed", summary.display()))?;
            features.write_json(&output)?;
            info!(
                "Wrote {} features x {} samples to {}",
                features.n_features(),
                features.sample_ids.len(),
                output.display()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_process_flags() {
        let cli = Cli::parse_from(["amplicon_otu", "process", "-i", "data", "-p", "-b", "--threads", "3"]);
        assert_eq!(cli.threads, Some(3));
        match cli.command {
            Commands::Process {
                input_dir,
                primers_removed,
                split_by_barcodes,
                native_kernel,
                ..
            } => {
                assert_eq!(input_dir, PathBuf::from("data"));
                assert!(primers_removed && split_by_barcodes);
                assert!(!native_kernel);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_rank() {
        let cli = Cli::parse_from([
            "amplicon_otu",
            "collapse",
            "--table",
            "t.tsv",
            "--taxonomy",
            "tax.txt",
            "--rank",
            "genus",
            "-o",
            "out.tsv",
        ]);
        assert!(matches!(
            cli.command,
            Commands::Collapse {
                rank: TaxonomicRank::Genus,
                ..
            }
        ));
    }
}
