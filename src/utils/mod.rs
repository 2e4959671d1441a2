pub mod parallel;

pub use parallel::{ParallelError, StageRunner};
