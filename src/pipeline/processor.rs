use crate::config::{validate_separator, ConfigError, KernelKind, PipelineConfig};
use crate::io::fastq::{FastxError, SeqFormat};
use crate::io::{copy_into_dir, file_size, resolve_path};
use crate::otu_table::{build_otu_tables, write_sequence_table, TableError};
use crate::pipeline::chunker::{lines_per_chunk, prepare_input, split, ChunkError};
use crate::pipeline::derep::{dereplicate, write_uniques, DerepError, DerepSort, DerepStats};
use crate::pipeline::external::{
    parse_alignment, NativeKernel, OtuClusterer, ReferenceAligner, SequenceKernel, ToolError, Usearch,
};
use crate::pipeline::merge::{merge_and_renumber, MergeError, MergeReport, SampleLabels};
use crate::pipeline::qc::{LengthTrimReport, QualityTrimOutcome};
use crate::pipeline::stages::{
    load_primers, BarcodeMap, BarcodeMode, BarcodeSplitStage, FastaConversionStage, LengthTrimStage, Primer,
    PrimerTrimStage, QualityTrimStage,
};
use crate::summary::{keys, SummaryError, SummaryRecord, SECTION_16S};
use crate::utils::{ParallelError, StageRunner};
use log::{info, warn};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Name of the summary file inside a dataset input directory.
pub const SUMMARY_FILE_NAME: &str = "summary_file.txt";

// --- Error Type ---
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Summary error: {0}")]
    Summary(#[from] SummaryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sequence error: {0}")]
    Fastx(#[from] FastxError),

    #[error("Chunking error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Parallel execution error: {0}")]
    Parallel(#[from] ParallelError),

    #[error("External tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("Dereplication error: {0}")]
    Derep(#[from] DerepError),

    #[error("OTU table error: {0}")]
    Table(#[from] TableError),

    #[error("Invalid input file {path}: {reason}")]
    InvalidInput { path: PathBuf, reason: String },

    #[error("{0} holds no records")]
    EmptyOutput(PathBuf),

    #[error("Stage '{stage}' failed on {chunk}: {reason}")]
    Stage {
        stage: String,
        chunk: PathBuf,
        reason: String,
    },

    #[error("Postcondition failed: {0}")]
    Postcondition(String),

    #[error("Failed to lock mutex: {0}")]
    MutexLockError(String),
}

impl<T> From<std::sync::PoisonError<T>> for ProcessingError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ProcessingError::MutexLockError(err.to_string())
    }
}

/// Switches for steps already done upstream.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Working directory; `$HOME/proc/<id>_proc_16S` when unset.
    pub output_dir: Option<PathBuf>,
    pub primers_removed: bool,
    pub split_by_barcodes: bool,
}

/// Input files and parameters resolved from a summary record.
#[derive(Debug, Clone)]
pub struct PipelineInputs {
    pub dataset_id: String,
    pub raw_file: PathBuf,
    pub format: SeqFormat,
    /// `None` when primers were already removed.
    pub primers: Option<PathBuf>,
    /// `None` when reads are already split by sample.
    pub barcodes: Option<(PathBuf, BarcodeMode)>,
    pub ascii_offset: u8,
    pub metadata: Option<PathBuf>,
    pub separator: char,
}

fn config_error(message: String) -> ProcessingError {
    ProcessingError::Summary(SummaryError::Config(message))
}

/// Quality offset named by `ASCII_ENCODING`. Anything but an explicit 33
/// encoding is read as 64.
pub fn ascii_offset(encoding: Option<&str>) -> u8 {
    match encoding.map(str::trim) {
        Some("ASCII_BASE_33") | Some("ASCII_33") | Some("33") => 33,
        Some("ASCII_BASE_64") | Some("ASCII_64") | Some("64") => 64,
        Some(other) => {
            warn!("Unknown ASCII encoding '{}', using ASCII 64", other);
            64
        }
        None => {
            warn!("No ASCII encoding specified for the quality scores, using ASCII 64");
            64
        }
    }
}

impl PipelineInputs {
    /// Resolves every input the run needs. Paths are relative to `input_dir`.
    pub fn from_summary(
        summary: &SummaryRecord,
        input_dir: &Path,
        options: &RunOptions,
        default_separator: char,
    ) -> Result<Self, ProcessingError> {
        let attr = |key| summary.get_opt(SECTION_16S, key);

        let (raw, format) = match (attr(keys::RAW_FASTQ_FILE), attr(keys::RAW_FASTA_FILE)) {
            (Some(fastq), _) => (fastq, SeqFormat::Fastq),
            (None, Some(fasta)) => {
                info!("No raw FASTQ file listed, using raw FASTA");
                (fasta, SeqFormat::Fasta)
            }
            (None, None) => {
                return Err(config_error(format!(
                    "neither {} nor {} is listed in section '{}'",
                    keys::RAW_FASTQ_FILE,
                    keys::RAW_FASTA_FILE,
                    SECTION_16S
                )))
            }
        };

        let primers = if options.primers_removed {
            None
        } else {
            let value = summary.require(SECTION_16S, keys::PRIMERS_FILE)?;
            Some(resolve_path(input_dir, value))
        };

        let barcodes = if options.split_by_barcodes {
            None
        } else {
            let map = summary.require(SECTION_16S, keys::BARCODES_MAP)?;
            let mode = summary
                .require(SECTION_16S, keys::BARCODES_MODE)?
                .parse::<BarcodeMode>()
                .map_err(config_error)?;
            Some((resolve_path(input_dir, map), mode))
        };

        let metadata = attr(keys::METADATA_FILE)
            .filter(|v| !v.trim().is_empty() && v.trim() != "None")
            .map(|v| resolve_path(input_dir, v));
        if metadata.is_none() {
            warn!("No metadata file listed for {}", summary.dataset_id());
        }

        let separator = match attr(keys::BARCODES_SEPARATOR) {
            Some(value) => {
                let mut chars = value.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => c,
                    _ => {
                        return Err(ConfigError::Invalid(format!(
                            "{} must be a single character, got '{}'",
                            keys::BARCODES_SEPARATOR,
                            value
                        ))
                        .into())
                    }
                }
            }
            None => default_separator,
        };
        validate_separator(separator)?;

        Ok(PipelineInputs {
            dataset_id: summary.dataset_id().to_string(),
            raw_file: resolve_path(input_dir, raw),
            format,
            primers,
            barcodes,
            ascii_offset: if format == SeqFormat::Fastq {
                ascii_offset(attr(keys::ASCII_ENCODING))
            } else {
                64
            },
            metadata,
            separator,
        })
    }
}

/// Every file a run writes, derived from the dataset id.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub work_dir: PathBuf,
    pub chunk_dir: PathBuf,
    pub trimmed_fasta: PathBuf,
    pub dereplicated_fasta: PathBuf,
    pub otu_database: PathBuf,
    pub otu_fasta: PathBuf,
    pub otu_clustering: PathBuf,
    pub otu_sequences_table: PathBuf,
    pub alignment: PathBuf,
    pub otu_table: PathBuf,
    pub reference_otu_table: PathBuf,
    pub results_dir: PathBuf,
}

impl OutputPaths {
    pub fn new(work_dir: &Path, dataset_id: &str) -> Self {
        let file = |suffix: &str| work_dir.join(format!("{}.{}", dataset_id, suffix));
        OutputPaths {
            work_dir: work_dir.to_path_buf(),
            chunk_dir: work_dir.join("chunks"),
            trimmed_fasta: file("raw_trimmed.fasta"),
            dereplicated_fasta: file("raw_dereplicated.fasta"),
            otu_database: file("otu_database"),
            otu_fasta: file("otu_seqs.fasta"),
            otu_clustering: file("otu_clustering.tab"),
            otu_sequences_table: file("otu_seqs.table"),
            alignment: work_dir.join("gg_alignments.aln"),
            otu_table: file("otu_table.classic"),
            reference_otu_table: file("otu_table.gg.classic"),
            results_dir: work_dir.join(format!("{}_results", dataset_id)),
        }
    }
}

/// Outcome of a full run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub dataset_id: String,
    pub input_format: SeqFormat,
    pub work_dir: PathBuf,
    pub results_dir: PathBuf,
    pub summary_file: PathBuf,
    pub chunks: usize,
    pub threads: usize,
    pub quality_outcomes: Vec<QualityTrimOutcome>,
    pub length_reports: Vec<LengthTrimReport>,
    pub merge: MergeReport,
    pub derep: DerepStats,
    pub otus: usize,
    pub samples: usize,
    pub table_reads: u64,
    /// Rows of the closed-reference table, when an alignment ran.
    pub reference_otus: Option<usize>,
    pub processing_time_seconds: f64,
}

fn default_work_dir(dataset_id: &str) -> Result<PathBuf, ProcessingError> {
    let home = env::var_os("HOME")
        .ok_or_else(|| ConfigError::Invalid("HOME is not set and no output directory was given".to_string()))?;
    Ok(PathBuf::from(home)
        .join("proc")
        .join(format!("{}_proc_16S", dataset_id)))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// --- AmpliconProcessor ---

/// Raw reads to OTU tables for one dataset.
pub struct AmpliconProcessor {
    config: PipelineConfig,
    kernel: Arc<dyn SequenceKernel>,
    clusterer: Arc<dyn OtuClusterer>,
    aligner: Option<Arc<dyn ReferenceAligner>>,
}

impl AmpliconProcessor {
    /// Builds the processor with the collaborators named by `config`.
    pub fn new(config: PipelineConfig) -> Result<Self, ProcessingError> {
        config.validate()?;
        let usearch = Usearch::new(&config.tools.usearch_binary);
        let kernel: Arc<dyn SequenceKernel> = match config.tools.kernel {
            KernelKind::Usearch => Arc::new(usearch.clone()),
            KernelKind::Native => Arc::new(NativeKernel),
        };
        let aligner = config.otu.reference_database.as_ref().map(|db| {
            Arc::new(usearch.clone().with_reference(db, config.otu.reference_identity)) as Arc<dyn ReferenceAligner>
        });
        info!(
            "Initialized processor: {:?} trimming kernel, reference alignment {}",
            config.tools.kernel,
            if aligner.is_some() { "enabled" } else { "disabled" }
        );
        Ok(Self::with_collaborators(config, kernel, Arc::new(usearch), aligner))
    }

    pub fn with_collaborators(
        config: PipelineConfig,
        kernel: Arc<dyn SequenceKernel>,
        clusterer: Arc<dyn OtuClusterer>,
        aligner: Option<Arc<dyn ReferenceAligner>>,
    ) -> Self {
        AmpliconProcessor {
            config,
            kernel,
            clusterer,
            aligner,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs the whole pipeline for the dataset described by `summary_path`.
    ///
    /// Configuration problems are reported before anything is written. The
    /// input summary is never modified; the updated copy is saved into the
    /// results folder.
    pub fn run(&self, summary_path: &Path, options: &RunOptions) -> Result<RunSummary, ProcessingError> {
        let start_time = Instant::now();
        let mut summary = SummaryRecord::load(summary_path)?;
        let input_dir = summary_path.parent().unwrap_or_else(|| Path::new(""));
        let inputs = PipelineInputs::from_summary(&summary, input_dir, options, self.config.otu.id_separator)?;
        info!(
            "Processing dataset '{}' from {} ({:?})",
            inputs.dataset_id,
            inputs.raw_file.display(),
            inputs.format
        );

        let barcode_stage = match &inputs.barcodes {
            Some((path, mode)) => Some(BarcodeSplitStage {
                barcodes: BarcodeMap::load(path)?,
                mode: *mode,
                max_mismatches: self.config.demux.barcode_mismatches,
                format: inputs.format,
            }),
            None => None,
        };
        let primers: Option<Vec<Primer>> = inputs.primers.as_deref().map(load_primers).transpose()?;
        if !inputs.raw_file.is_file() {
            return Err(config_error(format!(
                "raw data file {} does not exist",
                inputs.raw_file.display()
            )));
        }

        let work_dir = match &options.output_dir {
            Some(dir) => dir.clone(),
            None => default_work_dir(&inputs.dataset_id)?,
        };
        let paths = OutputPaths::new(&work_dir, &inputs.dataset_id);
        fs::create_dir_all(&paths.chunk_dir)?;
        info!("Working directory: {}", work_dir.display());

        // --- Chunked stages ---
        let raw = prepare_input(&inputs.raw_file, &work_dir)?;
        let lines = lines_per_chunk(file_size(&raw), &self.config.chunking);
        let mut chunks = split(&raw, &paths.chunk_dir, lines, inputs.format)?;
        let chunk_count = chunks.len();
        let runner = StageRunner::new(self.config.threads, &paths.chunk_dir)?;

        if let Some(stage) = &barcode_stage {
            chunks = runner.run(stage, &chunks)?;
        } else {
            info!("Reads already split by barcodes");
        }
        if let Some(primers) = primers {
            let stage = PrimerTrimStage {
                primers,
                max_mismatches: self.config.demux.primer_mismatches,
                format: inputs.format,
            };
            chunks = runner.run(&stage, &chunks)?;
        } else {
            info!("Primers already removed");
        }

        let mut quality_outcomes = Vec::new();
        if inputs.format == SeqFormat::Fastq {
            let stage = QualityTrimStage::new(
                Arc::clone(&self.kernel),
                inputs.ascii_offset,
                self.config.quality.clone(),
            );
            chunks = runner.run(&stage, &chunks)?;
            quality_outcomes = stage.outcomes()?;
        }

        let length_stage = LengthTrimStage::new(
            Arc::clone(&self.kernel),
            inputs.format,
            inputs.ascii_offset,
            self.config.length.clone(),
        );
        chunks = runner.run(&length_stage, &chunks)?;
        let length_reports = length_stage.reports()?;

        if inputs.format == SeqFormat::Fastq {
            chunks = runner.run(&FastaConversionStage, &chunks)?;
        }

        // --- Whole-dataset steps ---
        let labels = if inputs.barcodes.is_some() {
            SampleLabels::Demultiplexed
        } else {
            SampleLabels::PreSplit
        };
        let merge = merge_and_renumber(&chunks, &paths.trimmed_fasta, inputs.separator, labels)?;

        let derep = dereplicate(&paths.trimmed_fasta, DerepSort::Abundance)?;
        if derep.map.is_empty() {
            return Err(ProcessingError::Postcondition(format!(
                "no reads left after trimming for dataset '{}'",
                inputs.dataset_id
            )));
        }
        if derep.map.len() != derep.stats.unique_sequences
            || derep.map.total_members() != derep.stats.input_sequences
        {
            return Err(ProcessingError::Postcondition(format!(
                "dereplication map holds {} reads in {} groups, expected {} in {}",
                derep.map.total_members(),
                derep.map.len(),
                derep.stats.input_sequences,
                derep.stats.unique_sequences
            )));
        }
        write_uniques(&paths.dereplicated_fasta, &derep.uniques)?;
        derep.map.write(&paths.otu_database)?;

        self.clusterer
            .cluster(&paths.dereplicated_fasta, &paths.otu_fasta, &paths.otu_clustering)?;
        let sequence_rows = write_sequence_table(&paths.otu_fasta, &paths.otu_sequences_table)?;

        let alignment = match &self.aligner {
            Some(aligner) => {
                aligner.align(&paths.otu_fasta, &paths.alignment)?;
                Some(parse_alignment(&paths.alignment)?)
            }
            None => {
                warn!("No reference database configured, skipping the closed-reference table");
                None
            }
        };

        let tables = build_otu_tables(&paths.otu_fasta, &derep.map, alignment.as_ref(), inputs.separator)?;
        tables.full.write_classic(&paths.otu_table)?;
        if let Some(reference) = &tables.reference {
            reference.write_classic(&paths.reference_otu_table)?;
        }

        if tables.full.is_empty() || file_size(&paths.otu_fasta) == 0 || sequence_rows == 0 {
            return Err(ProcessingError::Postcondition(format!(
                "no OTUs were produced for dataset '{}'",
                inputs.dataset_id
            )));
        }

        // --- Results folder ---
        fs::create_dir_all(&paths.results_dir)?;
        copy_into_dir(&paths.otu_table, &paths.results_dir)?;
        copy_into_dir(&paths.otu_fasta, &paths.results_dir)?;
        copy_into_dir(&paths.otu_sequences_table, &paths.results_dir)?;
        if tables.reference.is_some() {
            copy_into_dir(&paths.reference_otu_table, &paths.results_dir)?;
            summary.set(
                SECTION_16S,
                keys::OTU_TABLE_CLOSED_REF,
                file_name(&paths.reference_otu_table),
            );
        }

        let metadata = match &inputs.metadata {
            Some(path) if path.is_file() => Some(copy_into_dir(path, &paths.results_dir)?),
            Some(path) => {
                warn!("Metadata file {} does not exist", path.display());
                None
            }
            None => None,
        };

        summary.set(SECTION_16S, keys::OTU_TABLE_OPEN_REF, file_name(&paths.otu_table));
        summary.set(
            SECTION_16S,
            keys::OTU_SEQUENCES_TABLE,
            file_name(&paths.otu_sequences_table),
        );
        summary.set(SECTION_16S, keys::OTU_SEQUENCES_FASTA, file_name(&paths.otu_fasta));
        summary.set(
            SECTION_16S,
            keys::METADATA_FILE,
            metadata.as_deref().map_or_else(|| "None".to_string(), file_name),
        );
        summary.set(SECTION_16S, keys::PROCESSED, "True");

        let summary_name = summary_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| SUMMARY_FILE_NAME.into());
        let summary_file = paths.results_dir.join(summary_name);
        summary.save(&summary_file)?;

        let (otus, samples) = tables.full.dimensions();
        let result = RunSummary {
            dataset_id: inputs.dataset_id,
            input_format: inputs.format,
            work_dir,
            results_dir: paths.results_dir,
            summary_file,
            chunks: chunk_count,
            threads: runner.threads(),
            quality_outcomes,
            length_reports,
            merge,
            derep: derep.stats,
            otus,
            samples,
            table_reads: tables.full.total(),
            reference_otus: tables.reference.as_ref().map(|t| t.dimensions().0),
            processing_time_seconds: start_time.elapsed().as_secs_f64(),
        };
        self.log_summary_metrics(&result);
        Ok(result)
    }

    fn log_summary_metrics(&self, result: &RunSummary) {
        info!("--- Dataset Summary: {} ---", result.dataset_id);
        info!("  Chunks: {} on {} threads", result.chunks, result.threads);
        info!(
            "  Reads merged: {} across {} samples",
            result.merge.records,
            result.merge.samples.len()
        );
        info!(
            "  Unique sequences: {} ({} singletons)",
            result.derep.unique_sequences, result.derep.singletons
        );
        info!("  OTUs: {} x {} samples", result.otus, result.samples);
        info!("  Processing time: {:.2}s", result.processing_time_seconds);
        info!("------------------------------------");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LengthTrimConfig;
    use crate::io::fastq::read_records;
    use crate::otu_table::OtuTable;
    use tempfile::tempdir;

    struct CopyClusterer;

    impl OtuClusterer for CopyClusterer {
        fn cluster(&self, uniques: &Path, otus: &Path, report: &Path) -> Result<(), ToolError> {
            fs::copy(uniques, otus)?;
            fs::write(report, "")?;
            Ok(())
        }
    }

    struct SingleReference;

    impl ReferenceAligner for SingleReference {
        fn align(&self, otus: &Path, report: &Path) -> Result<(), ToolError> {
            let text: String = read_records(otus)?
                .iter()
                .map(|r| format!(" Query 8nt >{}\nTarget 8nt >ref1\n\n", r.id))
                .collect();
            fs::write(report, text)?;
            Ok(())
        }
    }

    fn processor() -> AmpliconProcessor {
        let config = PipelineConfig {
            length: LengthTrimConfig {
                target_length: 8,
                ..LengthTrimConfig::default()
            },
            threads: Some(2),
            ..PipelineConfig::default()
        };
        AmpliconProcessor::with_collaborators(
            config,
            Arc::new(NativeKernel),
            Arc::new(CopyClusterer),
            Some(Arc::new(SingleReference)),
        )
    }

    fn write_dataset(dir: &Path, with_primers: bool) -> PathBuf {
        fs::write(
            dir.join("reads.fastq"),
            "@r1\nAAAAACGTGGGGCCCC\n+\nIIIIIIIIIIIIIIII\n\
@r2\nTTTTACGTCCCCGGGG\n+\nIIIIIIIIIIIIIIII\n\
@r3\nGGGGACGTCCCCGGGG\n+\nIIIIIIIIIIIIIIII\n",
        )
        .unwrap();
        fs::write(dir.join("barcodes.lst"), "AAAA\tS1\nTTTT\tS2\n").unwrap();
        fs::write(dir.join("primers.lst"), "ACGT\n").unwrap();
        fs::write(dir.join("meta.txt"), "sample\tgroup\n").unwrap();

        let primers = if with_primers { "PRIMERS_FILE\tprimers.lst\n" } else { "" };
        let summary = format!(
            "DATASET_ID\ttoy\n\n#16S_start\nRAW_FASTQ_FILE\treads.fastq\n{}BARCODES_MAP\tbarcodes.lst\n\
BARCODES_MODE\t1\nASCII_ENCODING\tASCII_BASE_33\nMETADATA_FILE\tmeta.txt\n#16S_end\n",
            primers
        );
        let path = dir.join(SUMMARY_FILE_NAME);
        fs::write(&path, summary).unwrap();
        path
    }

    #[test]
    fn test_end_to_end_two_samples() {
        let dir = tempdir().unwrap();
        let summary_path = write_dataset(dir.path(), true);
        let work = dir.path().join("work");
        let options = RunOptions {
            output_dir: Some(work.clone()),
            ..RunOptions::default()
        };

        let result = processor().run(&summary_path, &options).unwrap();
        assert_eq!(result.merge.records, 2);
        assert_eq!((result.otus, result.samples), (2, 2));
        assert_eq!(result.reference_otus, Some(1));
        assert_eq!(result.quality_outcomes.len(), 1);

        let table = OtuTable::read_classic(work.join("toy.otu_table.classic")).unwrap();
        assert_eq!(table.sample_ids(), &["S1".to_string(), "S2".to_string()]);
        assert_eq!(table.column_sums(), vec![1, 1]);
        assert_eq!(table.get("Uniq1", "S2"), Some(1));
        assert_eq!(table.get("Uniq2", "S1"), Some(1));

        let reference = OtuTable::read_classic(work.join("toy.otu_table.gg.classic")).unwrap();
        assert_eq!(reference.get("ref1", "S1"), Some(1));
        assert_eq!(reference.get("ref1", "S2"), Some(1));

        let results = work.join("toy_results");
        assert!(results.join("meta.txt").is_file());
        assert!(results.join("toy.otu_seqs.table").is_file());
        let updated = SummaryRecord::load(results.join(SUMMARY_FILE_NAME)).unwrap();
        assert_eq!(updated.get(SECTION_16S, keys::PROCESSED).unwrap(), "True");
        assert_eq!(
            updated.get(SECTION_16S, keys::OTU_TABLE_CLOSED_REF).unwrap(),
            "toy.otu_table.gg.classic"
        );
        assert_eq!(updated.get(SECTION_16S, keys::METADATA_FILE).unwrap(), "meta.txt");

        let original = SummaryRecord::load(&summary_path).unwrap();
        assert!(original.get_opt(SECTION_16S, keys::PROCESSED).is_none());
    }

    #[test]
    fn test_missing_primers_is_a_config_error() {
        let dir = tempdir().unwrap();
        let summary_path = write_dataset(dir.path(), false);
        let work = dir.path().join("work");
        let options = RunOptions {
            output_dir: Some(work.clone()),
            ..RunOptions::default()
        };

        let err = processor().run(&summary_path, &options).unwrap_err();
        assert!(matches!(err, ProcessingError::Summary(SummaryError::Config(_))));
        assert!(!work.exists());
    }

    #[test]
    fn test_primers_not_required_when_removed() {
        let dir = tempdir().unwrap();
        let summary_path = write_dataset(dir.path(), false);
        let summary = SummaryRecord::load(&summary_path).unwrap();
        let options = RunOptions {
            primers_removed: true,
            split_by_barcodes: true,
            ..RunOptions::default()
        };

        let inputs = PipelineInputs::from_summary(&summary, dir.path(), &options, '_').unwrap();
        assert!(inputs.primers.is_none());
        assert!(inputs.barcodes.is_none());
        assert_eq!(inputs.ascii_offset, 33);
        assert_eq!(inputs.raw_file, dir.path().join("reads.fastq"));
    }

    #[test]
    fn test_separator_from_summary() {
        let mut summary = SummaryRecord::new("toy");
        summary.set(SECTION_16S, keys::RAW_FASTA_FILE, "reads.fasta");
        summary.set(SECTION_16S, keys::BARCODES_SEPARATOR, ".");
        let options = RunOptions {
            primers_removed: true,
            split_by_barcodes: true,
            ..RunOptions::default()
        };

        let inputs = PipelineInputs::from_summary(&summary, Path::new("/data"), &options, '_').unwrap();
        assert_eq!(inputs.separator, '.');
        assert_eq!(inputs.format, SeqFormat::Fasta);

        summary.set(SECTION_16S, keys::BARCODES_SEPARATOR, "7");
        assert!(matches!(
            PipelineInputs::from_summary(&summary, Path::new("/data"), &options, '_'),
            Err(ProcessingError::Config(_))
        ));
    }

    #[test]
    fn test_ascii_offset() {
        assert_eq!(ascii_offset(Some("ASCII_BASE_33")), 33);
        assert_eq!(ascii_offset(Some("ASCII_64")), 64);
        assert_eq!(ascii_offset(Some("phred")), 64);
        assert_eq!(ascii_offset(None), 64);
    }

    #[test]
    fn test_output_paths() {
        let paths = OutputPaths::new(Path::new("/w"), "obio");
        assert_eq!(paths.trimmed_fasta, PathBuf::from("/w/obio.raw_trimmed.fasta"));
        assert_eq!(paths.reference_otu_table, PathBuf::from("/w/obio.otu_table.gg.classic"));
        assert_eq!(paths.results_dir, PathBuf::from("/w/obio_results"));
    }
}
