//! Analysis step types, plan validation, execution, and reporting.

pub mod executor;
pub mod plan;
pub mod report;
pub mod steps;

pub use executor::{AnalysisExecutor, PlanError, ProgressEvent, ProgressStatus};
pub use plan::{AnalysisPlan, Source};
pub use report::ReportItem;
pub use steps::{AnalysisStep, GeometryKind, SpatialAggregator, SpatialPredicate};
