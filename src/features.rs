//! Per-sample feature vectors for downstream analytics.
//!
//! A [`FeatureSet`] starts from the samples of the closed-reference OTU table
//! and grows by appending whole feature blocks: OTU abundances, predicted
//! pathway abundances and phylogenetic balances. Every vector always has one
//! value per registered feature name.

use crate::bio::phylogeny::{BalanceTable, PhyloError};
use crate::bio::{lminusr_balances, PhyloTree};
use crate::io::biom::{BiomError, PathwayTable};
use crate::io::resolve_path;
use crate::otu_table::{OtuTable, TableError};
use crate::summary::{keys, SummaryError, SummaryRecord, SECTION_16S};
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Summary error: {0}")]
    Summary(#[from] SummaryError),

    #[error("OTU table error: {0}")]
    Table(#[from] TableError),

    #[error("Prediction table error: {0}")]
    Biom(#[from] BiomError),

    #[error("Phylogeny error: {0}")]
    Phylo(#[from] PhyloError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Sample '{sample}' of {origin} is not a registered sample")]
    UnknownSample { origin: String, sample: String },
}

/// Feature names plus one aligned vector per sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub dataset_id: String,
    pub feature_names: Vec<String>,
    pub sample_ids: Vec<String>,
    pub vectors: IndexMap<String, Vec<f64>>,
}

impl FeatureSet {
    /// Registers the samples of `canonical`; no features yet.
    pub fn new(dataset_id: impl Into<String>, canonical: &OtuTable) -> Self {
        let sample_ids = canonical.sample_ids().to_vec();
        let vectors = sample_ids.iter().map(|s| (s.clone(), Vec::new())).collect();
        FeatureSet {
            dataset_id: dataset_id.into(),
            feature_names: Vec::new(),
            sample_ids,
            vectors,
        }
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    #[cfg(test)]
    pub fn vector(&self, sample: &str) -> Option<&[f64]> {
        self.vectors.get(sample).map(Vec::as_slice)
    }

    /// Appends one feature block. `value(feature, column)` reads the source,
    /// where `column` indexes `samples`. Nothing changes when `samples` holds
    /// an unregistered id.
    fn append<F>(&mut self, origin: &str, names: Vec<String>, samples: &[String], value: F) -> Result<(), FeatureError>
    where
        F: Fn(usize, usize) -> f64,
    {
        if let Some(unknown) = samples.iter().find(|s| !self.vectors.contains_key(*s)) {
            return Err(FeatureError::UnknownSample {
                origin: origin.to_string(),
                sample: unknown.clone(),
            });
        }
        let column: HashMap<&str, usize> = samples.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect();

        for (sample, vector) in self.vectors.iter_mut() {
            match column.get(sample.as_str()) {
                Some(&col) => vector.extend((0..names.len()).map(|f| value(f, col))),
                None => {
                    warn!("Sample {} is absent from {}; its features are zero", sample, origin);
                    vector.extend(std::iter::repeat(0.0).take(names.len()));
                }
            }
        }
        debug!("Added {} features from {}", names.len(), origin);
        self.feature_names.extend(names);
        Ok(())
    }

    /// OTU abundances as they appear in the table, named `OTU <id>`.
    pub fn load_otu_table(&mut self, table: &OtuTable) -> Result<(), FeatureError> {
        let names = table.otu_ids().iter().map(|id| format!("OTU {}", id)).collect();
        let counts = table.counts();
        self.append("OTU table", names, table.sample_ids(), |f, s| counts[[f, s]] as f64)
    }

    /// Predicted pathway abundances, named by pathway id.
    pub fn load_functional_prediction(&mut self, table: &PathwayTable) -> Result<(), FeatureError> {
        self.append(
            "functional prediction",
            table.pathways.clone(),
            &table.samples,
            |f, s| table.values[[f, s]],
        )
    }

    /// Node balances, named `phylo_LminusR_<node>`.
    pub fn load_phylogenetic_features(&mut self, balances: &BalanceTable) -> Result<(), FeatureError> {
        let names = balances
            .balances
            .keys()
            .map(|node| format!("phylo_LminusR_{}", node))
            .collect();
        let rows: Vec<&Vec<f64>> = balances.balances.values().collect();
        self.append("phylogenetic tree", names, &balances.sample_ids, |f, s| rows[f][s])
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), FeatureError> {
        let path = path.as_ref();
        let io_err = |source| FeatureError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush().map_err(io_err)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn read_json(path: impl AsRef<Path>) -> Result<Self, FeatureError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| FeatureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_reader(io::BufReader::new(file))?)
    }
}

/// Builds the feature set of a processed dataset.
///
/// File locations come from the summary and are relative to its directory.
/// `extra_predictions` are further BIOM tables appended after the one the
/// summary names.
pub fn assemble_features(summary_path: &Path, extra_predictions: &[PathBuf]) -> Result<FeatureSet, FeatureError> {
    let summary = SummaryRecord::load(summary_path)?;
    let base = summary_path.parent().unwrap_or_else(|| Path::new(""));
    let file = |key| -> Result<PathBuf, FeatureError> {
        Ok(resolve_path(base, summary.require(SECTION_16S, key)?))
    };
    let closed_path = file(keys::OTU_TABLE_CLOSED_REF)?;
    let open_path = file(keys::OTU_TABLE_OPEN_REF)?;
    let predictions_path = file(keys::METAGENOME_PREDICTIONS)?;
    let tree_path = file(keys::PHYLOGENETIC_TREE_OPEN_REF)?;

    let closed = OtuTable::read_classic(&closed_path)?;
    let mut features = FeatureSet::new(summary.dataset_id(), &closed);
    features.load_otu_table(&closed)?;

    for path in std::iter::once(&predictions_path).chain(extra_predictions) {
        info!("Loading predicted metagenome {}", path.display());
        features.load_functional_prediction(&PathwayTable::load(path)?)?;
    }

    let open = OtuTable::read_classic(&open_path)?;
    let tree = PhyloTree::load(&tree_path)?;
    features.load_phylogenetic_features(&lminusr_balances(&tree, &open))?;

    info!(
        "Assembled {} features for {} samples of {}",
        features.n_features(),
        features.sample_ids.len(),
        features.dataset_id
    );
    Ok(features)
}
