//! The build-rule trait and the central rule table.

use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use kiln_hash::{ProjectFilesystem, RuleKey};

use crate::{BuildTarget, ResourceAmounts, Step, TargetId};

/// One dep-file entry: a project-relative path a prior local build actually
/// read. Persisted as JSON under the `DEP_FILE` metadata key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub path: Utf8PathBuf,
}

impl InputDescriptor {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Hash sponge a rule feeds its key-relevant fields into.
///
/// Implemented by the key factory; rules only ever call these methods from
/// `append_to_rule_key`. Which calls contribute to which key variant is the
/// sink's business:
/// - `add_non_input_*` fields are dropped from input-based, dep-file, and
///   manifest keys (flags that change behavior but not inputs);
/// - `add_source` paths covered by the rule's dep-file predicate are dropped
///   from dep-file and manifest keys (the observed/potential file lists
///   replace them).
pub trait KeySink {
    fn add_str(&mut self, name: &str, value: &str);
    fn add_u64(&mut self, name: &str, value: u64);
    fn add_bool(&mut self, name: &str, value: bool);
    /// Ordered collection; element order is significant.
    fn add_str_seq(&mut self, name: &str, values: &[String]);
    /// Unordered collection; the sink canonicalizes ordering.
    fn add_str_set(&mut self, name: &str, values: &[String]);
    fn add_non_input_str(&mut self, name: &str, value: &str);
    /// A source file, contributed by resolved content hash.
    fn add_source(&mut self, name: &str, path: &Utf8Path);
}

/// A build rule, as the engine sees it.
///
/// Capability predicates default to the least capable variant; concrete rule
/// kinds opt in to input-based keys, dep-file keys, post-build steps, and
/// runtime deps.
pub trait BuildRule: Send + Sync {
    fn target(&self) -> &BuildTarget;

    /// Rule kind name, folded into every key.
    fn type_name(&self) -> &str;

    /// Declared build-time deps.
    fn deps(&self) -> &[TargetId];

    /// Project-relative paths this rule writes.
    fn declared_outputs(&self) -> &[Utf8PathBuf];

    /// The universe of files that may influence this rule. Manifest keys
    /// hash the subset covered by `covered_by_dep_file`.
    fn declared_sources(&self) -> &[Utf8PathBuf];

    /// Feed key-relevant fields to the sink. Name, type, deps, and the seed
    /// are contributed by the factory; rules feed only their own fields.
    fn append_to_rule_key(&self, sink: &mut dyn KeySink);

    /// Build steps, in execution order.
    fn steps(&self) -> Vec<Arc<dyn Step>>;

    fn is_cacheable(&self) -> bool {
        true
    }

    fn supports_input_based_rule_key(&self) -> bool {
        false
    }

    fn uses_dep_file_rule_keys(&self) -> bool {
        false
    }

    /// Whether `path` belongs to the dep-file-covered input set.
    fn covered_by_dep_file(&self, _path: &Utf8Path) -> bool {
        false
    }

    /// The inputs a just-finished local build actually consumed. Only called
    /// when `uses_dep_file_rule_keys` is true, after the rule's steps ran.
    fn inputs_after_building_locally(
        &self,
        _fs: &ProjectFilesystem,
    ) -> std::io::Result<Vec<InputDescriptor>> {
        Ok(Vec::new())
    }

    fn has_post_build_steps(&self) -> bool {
        false
    }

    fn post_build_steps(&self) -> Vec<Arc<dyn Step>> {
        Vec::new()
    }

    fn has_runtime_deps(&self) -> bool {
        false
    }

    /// Deps that must also resolve before this rule's result is usable.
    fn runtime_deps(&self) -> Vec<TargetId> {
        Vec::new()
    }

    /// Summary of this rule's externally visible interface, for input-based
    /// keys of dependents. `None` means dependents fall back to the full
    /// default key.
    fn abi_key(&self) -> Option<RuleKey> {
        None
    }

    /// Scheduler weight of this rule's local step execution.
    fn resource_amounts(&self) -> ResourceAmounts {
        ResourceAmounts::one_cpu()
    }
}

/// Central arena of rules; the engine references rules only by [`TargetId`].
#[derive(Default)]
pub struct RuleTable {
    rules: Vec<Arc<dyn BuildRule>>,
    by_target: HashMap<String, TargetId>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule, returning its id. Registering the same target twice
    /// returns the original id and drops the new rule.
    pub fn add(&mut self, rule: Arc<dyn BuildRule>) -> TargetId {
        let name = rule.target().full_name().to_string();
        if let Some(&existing) = self.by_target.get(&name) {
            return existing;
        }
        let id = TargetId(self.rules.len() as u32);
        self.rules.push(rule);
        self.by_target.insert(name, id);
        id
    }

    pub fn get(&self, id: TargetId) -> &Arc<dyn BuildRule> {
        &self.rules[id.0 as usize]
    }

    pub fn id_of(&self, target: &str) -> Option<TargetId> {
        self.by_target.get(target).copied()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TargetId> + '_ {
        (0..self.rules.len() as u32).map(TargetId)
    }
}
