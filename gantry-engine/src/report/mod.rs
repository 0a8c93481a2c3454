// Reporting Module
// Verdict aggregation and report rendering

pub mod aggregator;
pub mod reporter;

pub use aggregator::{FailureDetail, Outcome, ResultAggregator, SkipDetail, Verdict};
pub use reporter::{ReportFormat, SummaryReporter};
