//! Lead qualification: scoring thresholds and lead records.

pub mod engine;
pub mod model;

pub use engine::{evaluate, should_qualify};
pub use model::{
    AgentStats, ExtractedLead, LeadFields, LeadUpsert, QualificationResult, ScoreReport,
};
