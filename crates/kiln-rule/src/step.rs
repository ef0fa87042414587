//! Opaque build steps.
//!
//! The engine never looks inside a step; it runs a rule's steps in order and
//! treats any non-zero exit as the rule's failure.

use async_trait::async_trait;
use thiserror::Error;

use kiln_hash::ProjectFilesystem;

use crate::BuildTarget;

/// Context handed to every step execution.
pub struct StepContext {
    pub fs: ProjectFilesystem,
    pub target: BuildTarget,
}

/// Outcome of a completed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub exit_code: i32,
}

impl StepOutcome {
    pub const SUCCESS: StepOutcome = StepOutcome { exit_code: 0 };

    pub fn is_success(self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("step i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// One executable unit a rule contributes.
#[async_trait]
pub trait Step: Send + Sync {
    /// Short identifier for logs and failure messages.
    fn short_name(&self) -> &str;

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError>;
}
