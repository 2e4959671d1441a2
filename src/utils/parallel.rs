use crate::pipeline::processor::ProcessingError;
use crate::pipeline::stages::ChunkStage;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParallelError {
    #[error("Thread error: {0}")]
    ThreadError(String),
}

/// Runs one chunk stage over every chunk on a dedicated thread pool.
///
/// Chunks are independent: each task reads one input file and writes one
/// output file. `run` only returns once every chunk has finished, so stages
/// never overlap.
pub struct StageRunner {
    pool: rayon::ThreadPool,
    work_dir: PathBuf,
}

impl StageRunner {
    /// `threads = None` uses one thread per available CPU.
    pub fn new(threads: Option<usize>, work_dir: impl Into<PathBuf>) -> Result<Self, ParallelError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.unwrap_or(0))
            .build()
            .map_err(|e| ParallelError::ThreadError(format!("Failed to build thread pool: {}", e)))?;
        Ok(StageRunner {
            pool,
            work_dir: work_dir.into(),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// `<work_dir>/<input file name>.<stage suffix>`
    pub fn output_path(&self, stage: &dyn ChunkStage, input: &Path) -> PathBuf {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "chunk".to_string());
        self.work_dir.join(format!("{}.{}", name, stage.suffix()))
    }

    /// Applies `stage` to every chunk and returns the outputs in input order.
    ///
    /// When any chunk fails, every failure is logged and the first one (in
    /// chunk order) is returned.
    pub fn run(&self, stage: &dyn ChunkStage, chunks: &[PathBuf]) -> Result<Vec<PathBuf>, ProcessingError> {
        let start = Instant::now();
        let outputs: Vec<PathBuf> = chunks.iter().map(|c| self.output_path(stage, c)).collect();
        info!(
            "Stage '{}': {} chunks on {} threads",
            stage.name(),
            chunks.len(),
            self.threads()
        );

        let results: Vec<Result<(), ProcessingError>> = self.pool.install(|| {
            chunks
                .par_iter()
                .zip(outputs.par_iter())
                .map(|(input, output)| {
                    stage
                        .process(input, output)
                        .and_then(|_| verify_output(input, output))
                        .map_err(|e| ProcessingError::Stage {
                            stage: stage.name().to_string(),
                            chunk: input.clone(),
                            reason: e.to_string(),
                        })
                })
                .collect()
        });

        let mut failures = results.into_iter().filter_map(Result::err).collect::<Vec<_>>();
        if !failures.is_empty() {
            for failure in &failures {
                error!("{}", failure);
            }
            error!(
                "Stage '{}' failed on {} of {} chunks",
                stage.name(),
                failures.len(),
                chunks.len()
            );
            return Err(failures.swap_remove(0));
        }

        debug!(
            "Stage '{}' finished in {:.2}s",
            stage.name(),
            start.elapsed().as_secs_f64()
        );
        Ok(outputs)
    }
}

fn verify_output(input: &Path, output: &Path) -> Result<(), ProcessingError> {
    let size = match fs::metadata(output) {
        Ok(meta) => meta.len(),
        Err(_) => {
            return Err(ProcessingError::Postcondition(format!(
                "{} was not produced",
                output.display()
            )))
        }
    };
    if size == 0 && fs::metadata(input).map(|m| m.len() > 0).unwrap_or(false) {
        warn!(
            "{} is empty: every read of {} was filtered",
            output.display(),
            input.display()
        );
    }
    Ok(())
}
