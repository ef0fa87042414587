//! The rule model: targets, the build-rule trait with its capability
//! surface, opaque steps, and engine configuration.
//!
//! Rule graph construction and target parsing live outside the engine core;
//! this crate defines what a rule must expose for the engine to build it.

mod config;
pub mod depfile;
mod rule;
mod step;
mod target;

pub use config::{BuildMode, DepFileMode, EngineConfig, ResourceAmounts};
pub use rule::{BuildRule, InputDescriptor, KeySink, RuleTable};
pub use step::{Step, StepContext, StepError, StepOutcome};
pub use target::{BuildTarget, TargetError, TargetId};
