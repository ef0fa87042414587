//! The caching build engine.
//!
//! Given a table of rules, the engine produces each demanded rule's outputs
//! by the cheapest safe route: proving existing on-disk outputs identical,
//! fetching a prebuilt artifact (by default, input-based, or manifest-routed
//! dep-file key), or executing the rule's steps locally and uploading the
//! result. Results are memoized per target for the engine's lifetime.

mod engine;
mod events;
mod result;
mod scheduler;

pub use engine::BuildEngine;
pub use events::{EngineEvent, EventSink, MemoryEventSink, NullEventSink};
pub use result::{BuildKind, BuildReport, BuildResult, BuildStatus, EngineError, FirstFailure};
pub use scheduler::{ResourcePermit, Scheduler};
