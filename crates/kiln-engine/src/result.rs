//! Build outcomes and the engine error taxonomy.

use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use kiln_cache::CacheResult;
use kiln_keys::KeyError;
use kiln_rule::BuildTarget;

/// How a successful rule got its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    BuiltLocally,
    FetchedFromCache,
    FetchedFromCacheInputBased,
    FetchedFromCacheManifestBased,
    MatchingRuleKey,
    MatchingInputBasedRuleKey,
    MatchingDepFileRuleKey,
}

impl BuildKind {
    /// Whether this outcome wrote anything to disk. False exactly for the
    /// on-disk key matches, where prior outputs were proven current.
    pub fn outputs_changed(self) -> bool {
        !matches!(
            self,
            BuildKind::MatchingRuleKey
                | BuildKind::MatchingInputBasedRuleKey
                | BuildKind::MatchingDepFileRuleKey
        )
    }

    pub fn fetched_from_cache(self) -> bool {
        matches!(
            self,
            BuildKind::FetchedFromCache
                | BuildKind::FetchedFromCacheInputBased
                | BuildKind::FetchedFromCacheManifestBased
        )
    }

    pub fn built_locally(self) -> bool {
        matches!(self, BuildKind::BuiltLocally)
    }
}

/// Why a rule (or the whole build) failed.
///
/// `Clone` because results flow through shared futures; non-clonable sources
/// are wrapped in `Arc`.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("{target}: step `{step}` exited with code {exit_code}")]
    StepFailed {
        target: BuildTarget,
        step: String,
        exit_code: i32,
    },

    #[error("{target}: step `{step}` failed: {description}")]
    StepError {
        target: BuildTarget,
        step: String,
        description: String,
    },

    #[error("{target}: dependency {dep} failed")]
    DepFailed {
        target: BuildTarget,
        dep: BuildTarget,
    },

    #[error("{target}: local builds are disabled while populating from the remote cache")]
    LocalBuildsDisabled { target: BuildTarget },

    #[error("{target}: declared output `{path}` missing after build")]
    MissingOutput {
        target: BuildTarget,
        path: Utf8PathBuf,
    },

    #[error("i/o error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("archive error: {0}")]
    Archive(#[source] Arc<kiln_archive::ArchiveError>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }
}

impl From<kiln_archive::ArchiveError> for EngineError {
    fn from(e: kiln_archive::ArchiveError) -> Self {
        Self::Archive(Arc::new(e))
    }
}

/// Terminal state of one rule.
#[derive(Debug, Clone)]
pub enum BuildStatus {
    Success {
        kind: BuildKind,
        /// What the artifact cache contributed to this outcome.
        cache: CacheResult,
    },
    Failure {
        error: EngineError,
    },
    Canceled {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub target: BuildTarget,
    pub status: BuildStatus,
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, BuildStatus::Success { .. })
    }

    pub fn kind(&self) -> Option<BuildKind> {
        match &self.status {
            BuildStatus::Success { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&EngineError> {
        match &self.status {
            BuildStatus::Failure { error } => Some(error),
            _ => None,
        }
    }
}

/// The first failure observed by the engine; later tasks short-circuit to
/// `Canceled` against it unless keep-going is set.
#[derive(Debug, Clone)]
pub struct FirstFailure {
    pub target: BuildTarget,
    pub message: String,
}

/// Everything a `build` call produced, in demand order.
#[derive(Debug)]
pub struct BuildReport {
    pub results: Vec<BuildResult>,
    pub first_failure: Option<FirstFailure>,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.results.iter().all(BuildResult::is_success)
    }

    /// Nonzero when any demanded rule failed or was canceled.
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &BuildResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}
