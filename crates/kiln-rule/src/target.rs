//! Build target identity.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Index of a rule in the central [`RuleTable`](crate::RuleTable).
///
/// Everything inside the engine keys on `TargetId`; the string form is for
/// persistence and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u32);

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("target `{0}` must start with `//`")]
    MissingRootPrefix(String),

    #[error("target `{0}` must contain exactly one `:`")]
    BadRuleSeparator(String),

    #[error("target `{0}` has an empty rule name")]
    EmptyRuleName(String),
}

/// Stable string identity of a rule across invocations, e.g. `//lib/core:core`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildTarget {
    full: String,
}

impl BuildTarget {
    pub fn new(full: impl Into<String>) -> Result<Self, TargetError> {
        let full = full.into();
        let Some(rest) = full.strip_prefix("//") else {
            return Err(TargetError::MissingRootPrefix(full));
        };
        let mut parts = rest.split(':');
        let _base = parts.next();
        let Some(name) = parts.next() else {
            return Err(TargetError::BadRuleSeparator(full));
        };
        if parts.next().is_some() {
            return Err(TargetError::BadRuleSeparator(full));
        }
        if name.is_empty() {
            return Err(TargetError::EmptyRuleName(full));
        }
        Ok(Self { full })
    }

    pub fn full_name(&self) -> &str {
        &self.full
    }

    /// Base path component, without the leading `//`.
    pub fn base_path(&self) -> &str {
        let rest = &self.full[2..];
        &rest[..rest.find(':').unwrap_or(0)]
    }

    /// Rule name component, after the `:`.
    pub fn rule_name(&self) -> &str {
        let rest = &self.full[2..];
        &rest[rest.find(':').map(|i| i + 1).unwrap_or(0)..]
    }

    /// Filesystem-friendly form: `//lib/core:core` → `lib/core/core`.
    ///
    /// Used to place per-target metadata directories.
    pub fn short_path(&self) -> Utf8PathBuf {
        let base = self.base_path();
        if base.is_empty() {
            Utf8PathBuf::from(self.rule_name())
        } else {
            Utf8PathBuf::from(base).join(self.rule_name())
        }
    }
}

impl std::fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full)
    }
}
