pub mod chunker;
pub mod derep;
pub mod external;
pub mod merge;
pub mod processor;
pub mod qc;
pub mod report;
pub mod stages;

pub use processor::{AmpliconProcessor, ProcessingError, RunOptions, RunSummary, SUMMARY_FILE_NAME};
pub use report::generate_report;
