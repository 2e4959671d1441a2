use crate::pipeline::processor::{ProcessingError, RunSummary};
use crate::pipeline::qc::CutoffDecision;
use itertools::Itertools;
use std::collections::BTreeMap;

/// Renders a plain-text report of a pipeline run.
pub fn generate_report(results: &RunSummary) -> Result<String, ProcessingError> {
    let mut report = String::new();

    // Header
    report.push_str(&format!("16S Processing Report for Dataset: {}\n", results.dataset_id));
    report.push_str("=================================================\n\n");

    report.push_str("Run:\n");
    report.push_str(&format!("  Input format: {:?}\n", results.input_format));
    report.push_str(&format!(
        "  Chunks: {} on {} threads\n",
        results.chunks, results.threads
    ));
    report.push_str(&format!("  Working directory: {}\n", results.work_dir.display()));
    report.push_str(&format!(
        "  Processing time: {:.2} seconds\n\n",
        results.processing_time_seconds
    ));

    if !results.quality_outcomes.is_empty() {
        let mut by_cutoff: BTreeMap<u8, usize> = BTreeMap::new();
        let mut fallbacks = 0;
        for outcome in &results.quality_outcomes {
            *by_cutoff.entry(outcome.cutoff).or_insert(0) += 1;
            if outcome.decision == CutoffDecision::Fallback {
                fallbacks += 1;
            }
        }
        report.push_str("Quality Trimming:\n");
        report.push_str(&format!(
            "  Cutoffs used: {}\n",
            by_cutoff
                .iter()
                .map(|(q, n)| format!("Q{} x{}", q, n))
                .join(", ")
        ));
        report.push_str(&format!(
            "  Chunks at fallback cutoff: {} of {}\n\n",
            fallbacks,
            results.quality_outcomes.len()
        ));
    }

    let (input_bytes, output_bytes) = results
        .length_reports
        .iter()
        .fold((0u64, 0u64), |(i, o), r| (i + r.input_bytes, o + r.output_bytes));
    report.push_str("Length Trimming:\n");
    report.push_str(&format!(
        "  Bytes retained: {} of {} ({:.1}%)\n\n",
        output_bytes,
        input_bytes,
        if input_bytes == 0 {
            100.0
        } else {
            100.0 * output_bytes as f64 / input_bytes as f64
        }
    ));

    report.push_str("Reads per Sample:\n");
    if results.merge.samples.is_empty() {
        report.push_str("  No reads survived trimming.\n");
    }
    for (sample, reads) in &results.merge.samples {
        report.push_str(&format!("  {:<20} {}\n", sample, reads));
    }
    report.push('\n');

    report.push_str("OTUs:\n");
    report.push_str(&format!(
        "  Unique sequences: {} (max abundance {}, {} singletons)\n",
        results.derep.unique_sequences, results.derep.max_abundance, results.derep.singletons
    ));
    report.push_str(&format!(
        "  OTU table: {} OTUs x {} samples, {} reads\n",
        results.otus, results.samples, results.table_reads
    ));
    match results.reference_otus {
        Some(n) => report.push_str(&format!("  Closed-reference table: {} reference ids\n", n)),
        None => report.push_str("  Closed-reference table: not produced\n"),
    }
    report.push('\n');

    report.push_str(&format!("Results folder: {}\n", results.results_dir.display()));
    report.push_str(&format!("Updated summary: {}\n", results.summary_file.display()));

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::fastq::SeqFormat;
    use crate::pipeline::derep::DerepStats;
    use crate::pipeline::merge::MergeReport;
    use crate::pipeline::qc::{LengthTrimReport, QualityTrimOutcome};
    use std::path::PathBuf;

    #[test]
    fn test_report_sections() {
        let mut merge = MergeReport::default();
        merge.records = 3;
        merge.samples.insert("S1".to_string(), 2);
        merge.samples.insert("S2".to_string(), 1);
        let results = RunSummary {
            dataset_id: "obio".to_string(),
            input_format: SeqFormat::Fastq,
            work_dir: PathBuf::from("/w"),
            results_dir: PathBuf::from("/w/obio_results"),
            summary_file: PathBuf::from("/w/obio_results/summary_file.txt"),
            chunks: 2,
            threads: 4,
            quality_outcomes: vec![
                QualityTrimOutcome {
                    decision: CutoffDecision::Accepted(9),
                    cutoff: 9,
                },
                QualityTrimOutcome {
                    decision: CutoffDecision::Fallback,
                    cutoff: 5,
                },
            ],
            length_reports: vec![LengthTrimReport::new(200, 50)],
            merge,
            derep: DerepStats {
                input_sequences: 3,
                unique_sequences: 2,
                max_abundance: 2,
                singletons: 1,
            },
            otus: 2,
            samples: 2,
            table_reads: 3,
            reference_otus: None,
            processing_time_seconds: 1.5,
        };

        let report = generate_report(&results).unwrap();
        assert!(report.starts_with("16S Processing Report for Dataset: obio\n"));
        assert!(report.contains("Cutoffs used: Q5 x1, Q9 x1"));
        assert!(report.contains("Chunks at fallback cutoff: 1 of 2"));
        assert!(report.contains("Bytes retained: 50 of 200 (25.0%)"));
        assert!(report.contains("2 OTUs x 2 samples, 3 reads"));
        assert!(report.contains("Closed-reference table: not produced"));
    }
}
