//! Module runner and the pluggable analysis modules it drives.

pub mod module_trait;
pub mod output;
pub mod protocol_stats;
pub mod registry;
pub mod runner;

pub use module_trait::{AnalysisModule, Detection, ModuleSummary};
pub use output::DetectionWriter;
pub use registry::ModuleRegistry;
pub use runner::{ModuleRunner, OutcomeRecord, RunOutcome, RunnerConfig, RunnerStatus};
