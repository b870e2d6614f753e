pub mod analyze;
pub mod backend;
pub mod build;
pub mod collector;
pub mod normalize;
pub mod otlp;

pub use analyze::{AnalyzeOutcome, Analyzer};
pub use collector::{Collector, CollectorConfig, TickOutcome};
pub use normalize::NormalizeConfig;
