//! Conversation workers.
//!
//! - `processor`: the per-job state machine ([`ConversationWorker`])
//! - `pool`: fixed-size set of claim loops feeding it ([`WorkerPool`])

pub mod pool;
pub mod processor;

pub use pool::WorkerPool;
pub use processor::{ConversationWorker, QualificationSchedule};
