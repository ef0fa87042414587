//! The four rule-key builders.
//!
//! Variant semantics:
//! - **Default** feeds every registered field, all declared sources by
//!   content hash, and each dep's default key. Always computable.
//! - **InputBased** drops non-input fields, feeds deps by ABI key (falling
//!   back to the dep's default key when it advertises none), and enforces a
//!   byte cap on hashed source content.
//! - **DepFile** replaces dep-file-covered sources with the observed input
//!   list from a prior local build, each entry content-hashed.
//! - **Manifest** replaces covered sources with their paths only (no
//!   content), so the key is stable across covered-file edits and can index
//!   the manifest store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::trace;

use kiln_hash::{FileHashCache, ProjectFilesystem, RuleKey};
use kiln_rule::{BuildRule, EngineConfig, InputDescriptor, KeySink, RuleTable, TargetId};

use crate::hasher::KeyHasher;
use crate::KeyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Default,
    InputBased,
    DepFile,
    Manifest,
}

/// What to do when a dep-file entry's path no longer exists.
///
/// Tolerated during pre-build lookup (the key is simply unavailable and the
/// engine advances to the next cache stage); a hard error after a local
/// build, because then the rule misreported its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingInputBehavior {
    Tolerate,
    Error,
}

/// A manifest key together with the covered input universe used for lookup.
#[derive(Debug, Clone)]
pub struct ManifestKeyAndInputs {
    pub key: RuleKey,
    pub inputs: Vec<Utf8PathBuf>,
}

/// Computes rule keys; memoizes default keys when configured to.
pub struct RuleKeyFactory {
    fs: ProjectFilesystem,
    hash_cache: Arc<dyn FileHashCache>,
    key_seed: u64,
    rule_key_caching: bool,
    input_key_size_limit: Option<u64>,
    default_keys: Mutex<HashMap<TargetId, RuleKey>>,
}

impl RuleKeyFactory {
    pub fn new(
        fs: ProjectFilesystem,
        hash_cache: Arc<dyn FileHashCache>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            fs,
            hash_cache,
            key_seed: config.key_seed,
            rule_key_caching: config.rule_key_caching,
            input_key_size_limit: config.input_key_size_limit,
            default_keys: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the memoized default key for a target (and, transitively, any
    /// caller must re-request dependents; the engine only invalidates between
    /// builds).
    pub fn invalidate(&self, id: TargetId) {
        self.default_keys.lock().unwrap().remove(&id);
    }

    /// The default key: always computable, covers everything.
    pub fn default_key(&self, table: &RuleTable, id: TargetId) -> Result<RuleKey, KeyError> {
        if self.rule_key_caching {
            if let Some(key) = self.default_keys.lock().unwrap().get(&id) {
                return Ok(*key);
            }
        }

        let rule = table.get(id);
        let mut dep_keys = Vec::with_capacity(rule.deps().len());
        for dep in rule.deps() {
            dep_keys.push(self.default_key(table, *dep)?);
        }

        let mut builder = self.builder(KeyKind::Default, rule.as_ref());
        builder.put_dep_keys(&dep_keys);
        let key = builder.finalize()?;

        trace!(rule = %rule.target(), key = %key.short_hex(), "default key");
        if self.rule_key_caching {
            self.default_keys.lock().unwrap().insert(id, key);
        }
        Ok(key)
    }

    /// The input-based key, or `SizeLimitExceeded` when the hashed source set
    /// is too large (the engine then skips input-based caching for the rule).
    pub fn input_based_key(&self, table: &RuleTable, id: TargetId) -> Result<RuleKey, KeyError> {
        let rule = table.get(id);
        let mut dep_keys = Vec::with_capacity(rule.deps().len());
        for dep in rule.deps() {
            dep_keys.push(self.dep_abi_key(table, *dep)?);
        }

        let mut builder = self.builder(KeyKind::InputBased, rule.as_ref());
        builder.put_dep_keys(&dep_keys);
        builder.finalize()
    }

    /// The dep-file key over previously observed inputs. `Ok(None)` when a
    /// listed file is gone and that is tolerated.
    pub fn dep_file_key(
        &self,
        table: &RuleTable,
        id: TargetId,
        entries: &[InputDescriptor],
        missing: MissingInputBehavior,
    ) -> Result<Option<RuleKey>, KeyError> {
        let rule = table.get(id);
        let mut dep_keys = Vec::with_capacity(rule.deps().len());
        for dep in rule.deps() {
            dep_keys.push(self.dep_abi_key(table, *dep)?);
        }

        let mut observed = Vec::with_capacity(entries.len());
        for entry in entries {
            if !self.fs.exists(&entry.path) {
                match missing {
                    MissingInputBehavior::Tolerate => {
                        trace!(path = %entry.path, "dep-file input gone; key unavailable");
                        return Ok(None);
                    }
                    MissingInputBehavior::Error => {
                        return Err(KeyError::MissingInput {
                            target: rule.target().clone(),
                            path: entry.path.clone(),
                        });
                    }
                }
            }
            let hash = self
                .hash_cache
                .get(&entry.path)
                .map_err(|e| KeyError::Io {
                    path: entry.path.clone(),
                    source: Arc::new(e),
                })?;
            observed.push((entry.path.clone(), hash));
        }

        let mut builder = self.builder(KeyKind::DepFile, rule.as_ref());
        builder.put_dep_keys(&dep_keys);
        builder.put_hashed_inputs(&observed);
        builder.finalize().map(Some)
    }

    /// The manifest key plus the covered input universe for manifest lookup.
    pub fn manifest_key(
        &self,
        table: &RuleTable,
        id: TargetId,
    ) -> Result<ManifestKeyAndInputs, KeyError> {
        let rule = table.get(id);
        let mut dep_keys = Vec::with_capacity(rule.deps().len());
        for dep in rule.deps() {
            dep_keys.push(self.dep_abi_key(table, *dep)?);
        }

        let mut inputs: Vec<Utf8PathBuf> = rule
            .declared_sources()
            .iter()
            .filter(|p| rule.covered_by_dep_file(p))
            .cloned()
            .collect();
        inputs.sort();

        let mut builder = self.builder(KeyKind::Manifest, rule.as_ref());
        builder.put_dep_keys(&dep_keys);
        builder.put_input_paths(&inputs);
        let key = builder.finalize()?;
        Ok(ManifestKeyAndInputs { key, inputs })
    }

    /// The key a dep contributes to input-based construction: its declared
    /// ABI key, or its full default key when it has none.
    fn dep_abi_key(&self, table: &RuleTable, id: TargetId) -> Result<RuleKey, KeyError> {
        match table.get(id).abi_key() {
            Some(key) => Ok(key),
            None => self.default_key(table, id),
        }
    }

    fn builder<'a>(&'a self, kind: KeyKind, rule: &'a dyn BuildRule) -> KeyBuilder<'a> {
        let mut builder = KeyBuilder {
            kind,
            hasher: KeyHasher::new(),
            fs: &self.fs,
            hash_cache: self.hash_cache.as_ref(),
            rule,
            size_limit: match kind {
                KeyKind::InputBased => self.input_key_size_limit,
                _ => None,
            },
            hashed_bytes: 0,
            error: None,
        };
        builder.hasher.put_field("seed");
        builder.hasher.put_u64(self.key_seed);
        builder.hasher.put_field("kind");
        builder.hasher.put_u64(kind as u64);
        builder.hasher.put_field("type");
        builder.hasher.put_str(rule.type_name());
        builder.hasher.put_field("name");
        builder.hasher.put_str(rule.target().full_name());
        rule.append_to_rule_key(&mut builder);
        builder
    }
}

/// Sink handed to `BuildRule::append_to_rule_key`. The first error sticks and
/// turns later calls into no-ops; `finalize` surfaces it.
struct KeyBuilder<'a> {
    kind: KeyKind,
    hasher: KeyHasher,
    fs: &'a ProjectFilesystem,
    hash_cache: &'a dyn FileHashCache,
    rule: &'a dyn BuildRule,
    size_limit: Option<u64>,
    hashed_bytes: u64,
    error: Option<KeyError>,
}

impl KeyBuilder<'_> {
    fn put_dep_keys(&mut self, keys: &[RuleKey]) {
        self.hasher.put_field("deps");
        self.hasher.put_digest_set(keys);
    }

    fn put_hashed_inputs(&mut self, inputs: &[(Utf8PathBuf, kiln_hash::ContentHash)]) {
        let mut sorted: Vec<_> = inputs.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        self.hasher.put_field("observed_inputs");
        for (path, hash) in &sorted {
            self.hasher.put_path(path.as_str());
            self.hasher.put_digest(hash);
        }
    }

    fn put_input_paths(&mut self, paths: &[Utf8PathBuf]) {
        self.hasher.put_field("input_universe");
        for path in paths {
            self.hasher.put_path(path.as_str());
        }
    }

    fn finalize(self) -> Result<RuleKey, KeyError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.hasher.finish()),
        }
    }

    fn hash_source(&mut self, path: &Utf8Path) {
        let hash = match self.hash_cache.get(path) {
            Ok(h) => h,
            Err(e) => {
                self.error = Some(KeyError::Io {
                    path: path.to_owned(),
                    source: Arc::new(e),
                });
                return;
            }
        };

        if let Some(limit) = self.size_limit {
            let size = std::fs::metadata(self.fs.resolve(path))
                .map(|m| m.len())
                .unwrap_or(0);
            self.hashed_bytes += size;
            if self.hashed_bytes > limit {
                self.error = Some(KeyError::SizeLimitExceeded {
                    target: self.rule.target().clone(),
                    limit,
                    actual: self.hashed_bytes,
                });
                return;
            }
        }

        self.hasher.put_path(path.as_str());
        self.hasher.put_digest(&hash);
    }
}

impl KeySink for KeyBuilder<'_> {
    fn add_str(&mut self, name: &str, value: &str) {
        if self.error.is_some() {
            return;
        }
        self.hasher.put_field(name);
        self.hasher.put_str(value);
    }

    fn add_u64(&mut self, name: &str, value: u64) {
        if self.error.is_some() {
            return;
        }
        self.hasher.put_field(name);
        self.hasher.put_u64(value);
    }

    fn add_bool(&mut self, name: &str, value: bool) {
        if self.error.is_some() {
            return;
        }
        self.hasher.put_field(name);
        self.hasher.put_bool(value);
    }

    fn add_str_seq(&mut self, name: &str, values: &[String]) {
        if self.error.is_some() {
            return;
        }
        self.hasher.put_field(name);
        self.hasher.put_str_seq(values);
    }

    fn add_str_set(&mut self, name: &str, values: &[String]) {
        if self.error.is_some() {
            return;
        }
        self.hasher.put_field(name);
        self.hasher.put_str_set(values);
    }

    fn add_non_input_str(&mut self, name: &str, value: &str) {
        if self.error.is_some() {
            return;
        }
        // Non-input fields only shape the default key.
        if self.kind == KeyKind::Default {
            self.hasher.put_field(name);
            self.hasher.put_str(value);
        }
    }

    fn add_source(&mut self, name: &str, path: &Utf8Path) {
        if self.error.is_some() {
            return;
        }
        match self.kind {
            KeyKind::Default | KeyKind::InputBased => {
                self.hasher.put_field(name);
                self.hash_source(path);
            }
            KeyKind::DepFile => {
                // Covered sources are replaced by the observed input list.
                if !self.rule.covered_by_dep_file(path) {
                    self.hasher.put_field(name);
                    self.hash_source(path);
                }
            }
            KeyKind::Manifest => {
                if self.rule.covered_by_dep_file(path) {
                    // Path only: the key must survive covered-content edits.
                    self.hasher.put_field(name);
                    self.hasher.put_path(path.as_str());
                } else {
                    self.hasher.put_field(name);
                    self.hash_source(path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_hash::DefaultFileHashCache;
    use kiln_rule::{BuildTarget, Step};

    struct TestRule {
        target: BuildTarget,
        deps: Vec<TargetId>,
        sources: Vec<Utf8PathBuf>,
        outputs: Vec<Utf8PathBuf>,
        comment: String,
        covered_prefix: Option<String>,
        abi: Option<RuleKey>,
    }

    impl TestRule {
        fn new(target: &str) -> Self {
            Self {
                target: BuildTarget::new(target).unwrap(),
                deps: Vec::new(),
                sources: Vec::new(),
                outputs: Vec::new(),
                comment: String::new(),
                covered_prefix: None,
                abi: None,
            }
        }
    }

    impl BuildRule for TestRule {
        fn target(&self) -> &BuildTarget {
            &self.target
        }
        fn type_name(&self) -> &str {
            "test_rule"
        }
        fn deps(&self) -> &[TargetId] {
            &self.deps
        }
        fn declared_outputs(&self) -> &[Utf8PathBuf] {
            &self.outputs
        }
        fn declared_sources(&self) -> &[Utf8PathBuf] {
            &self.sources
        }
        fn append_to_rule_key(&self, sink: &mut dyn KeySink) {
            sink.add_non_input_str("comment", &self.comment);
            for source in &self.sources {
                sink.add_source("src", source);
            }
        }
        fn steps(&self) -> Vec<Arc<dyn Step>> {
            Vec::new()
        }
        fn supports_input_based_rule_key(&self) -> bool {
            true
        }
        fn uses_dep_file_rule_keys(&self) -> bool {
            self.covered_prefix.is_some()
        }
        fn covered_by_dep_file(&self, path: &Utf8Path) -> bool {
            self.covered_prefix
                .as_deref()
                .is_some_and(|p| path.as_str().starts_with(p))
        }
        fn abi_key(&self) -> Option<RuleKey> {
            self.abi
        }
    }

    struct Env {
        _dir: tempfile::TempDir,
        fs: ProjectFilesystem,
        cache: Arc<dyn FileHashCache>,
    }

    fn env() -> Env {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let fs = ProjectFilesystem::new(root);
        let cache: Arc<dyn FileHashCache> = Arc::new(DefaultFileHashCache::new(fs.clone()));
        Env {
            _dir: dir,
            fs,
            cache,
        }
    }

    fn factory(env: &Env, config: &EngineConfig) -> RuleKeyFactory {
        RuleKeyFactory::new(env.fs.clone(), env.cache.clone(), config)
    }

    fn write(env: &Env, path: &str, contents: &str) {
        let abs = env.fs.resolve(Utf8Path::new(path));
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(abs, contents).unwrap();
    }

    #[test]
    fn default_key_is_deterministic() {
        let env = env();
        write(&env, "a.txt", "hello");

        let mut rule = TestRule::new("//:lib");
        rule.sources.push("a.txt".into());
        let mut table = RuleTable::new();
        let id = table.add(Arc::new(rule));

        let config = EngineConfig::default();
        let f1 = factory(&env, &config);
        let f2 = factory(&env, &config);
        assert_eq!(
            f1.default_key(&table, id).unwrap(),
            f2.default_key(&table, id).unwrap()
        );
    }

    #[test]
    fn key_seed_changes_every_key() {
        let env = env();
        let mut table = RuleTable::new();
        let id = table.add(Arc::new(TestRule::new("//:lib")));

        let base = EngineConfig::default();
        let reseeded = EngineConfig {
            key_seed: 7,
            ..EngineConfig::default()
        };
        assert_ne!(
            factory(&env, &base).default_key(&table, id).unwrap(),
            factory(&env, &reseeded).default_key(&table, id).unwrap()
        );
    }

    #[test]
    fn non_input_field_only_affects_default_key() {
        let env = env();
        write(&env, "a.txt", "hello");

        let mut table = RuleTable::new();
        let mut rule = TestRule::new("//:lib");
        rule.sources.push("a.txt".into());
        rule.comment = "one".into();
        let id = table.add(Arc::new(rule));

        let mut table2 = RuleTable::new();
        let mut rule2 = TestRule::new("//:lib");
        rule2.sources.push("a.txt".into());
        rule2.comment = "two".into();
        let id2 = table2.add(Arc::new(rule2));

        let config = EngineConfig::default();
        let f = factory(&env, &config);
        assert_ne!(
            f.default_key(&table, id).unwrap(),
            f.default_key(&table2, id2).unwrap()
        );
        assert_eq!(
            f.input_based_key(&table, id).unwrap(),
            f.input_based_key(&table2, id2).unwrap()
        );
    }

    #[test]
    fn dep_abi_key_decouples_dependents() {
        let env = env();
        let config = EngineConfig::default();
        let abi = RuleKey::from_bytes(b"stable-abi");

        // Two dep variants with the same ABI key but different comments
        // (different default keys).
        let build_table = |comment: &str| {
            let mut table = RuleTable::new();
            let mut dep = TestRule::new("//:dep");
            dep.comment = comment.into();
            dep.abi = Some(abi);
            let dep_id = table.add(Arc::new(dep));
            let mut parent = TestRule::new("//:parent");
            parent.deps = vec![dep_id];
            let parent_id = table.add(Arc::new(parent));
            (table, parent_id)
        };

        let (t1, p1) = build_table("one");
        let (t2, p2) = build_table("two");
        let f = factory(&env, &config);

        assert_ne!(
            f.default_key(&t1, p1).unwrap(),
            f.default_key(&t2, p2).unwrap()
        );
        assert_eq!(
            f.input_based_key(&t1, p1).unwrap(),
            f.input_based_key(&t2, p2).unwrap()
        );
    }

    #[test]
    fn input_based_key_respects_size_limit() {
        let env = env();
        write(&env, "big.txt", &"x".repeat(64));

        let mut table = RuleTable::new();
        let mut rule = TestRule::new("//:lib");
        rule.sources.push("big.txt".into());
        let id = table.add(Arc::new(rule));

        let config = EngineConfig {
            input_key_size_limit: Some(16),
            ..EngineConfig::default()
        };
        let f = factory(&env, &config);
        assert!(matches!(
            f.input_based_key(&table, id),
            Err(KeyError::SizeLimitExceeded { .. })
        ));
        // The default key is unaffected by the cap.
        assert!(f.default_key(&table, id).is_ok());
    }

    #[test]
    fn dep_file_key_tracks_observed_inputs_only() {
        let env = env();
        write(&env, "headers/a.h", "aaa");
        write(&env, "headers/b.h", "bbb");
        write(&env, "src/main.c", "main");

        let mut table = RuleTable::new();
        let mut rule = TestRule::new("//:lib");
        rule.sources = vec!["headers/a.h".into(), "headers/b.h".into(), "src/main.c".into()];
        rule.covered_prefix = Some("headers/".into());
        let id = table.add(Arc::new(rule));

        let config = EngineConfig::default();
        let f = factory(&env, &config);
        let observed = vec![InputDescriptor::new("headers/a.h")];

        let before = f
            .dep_file_key(&table, id, &observed, MissingInputBehavior::Error)
            .unwrap()
            .unwrap();

        // Editing an unobserved covered file must not move the key.
        write(&env, "headers/b.h", "changed");
        env.cache.invalidate(Utf8Path::new("headers/b.h"));
        let after = f
            .dep_file_key(&table, id, &observed, MissingInputBehavior::Error)
            .unwrap()
            .unwrap();
        assert_eq!(before, after);

        // Editing the observed file must.
        write(&env, "headers/a.h", "changed");
        env.cache.invalidate(Utf8Path::new("headers/a.h"));
        let moved = f
            .dep_file_key(&table, id, &observed, MissingInputBehavior::Error)
            .unwrap()
            .unwrap();
        assert_ne!(before, moved);
    }

    #[test]
    fn dep_file_key_missing_input_behavior() {
        let env = env();
        let mut table = RuleTable::new();
        let mut rule = TestRule::new("//:lib");
        rule.covered_prefix = Some("headers/".into());
        let id = table.add(Arc::new(rule));

        let config = EngineConfig::default();
        let f = factory(&env, &config);
        let observed = vec![InputDescriptor::new("headers/gone.h")];

        assert!(f
            .dep_file_key(&table, id, &observed, MissingInputBehavior::Tolerate)
            .unwrap()
            .is_none());
        assert!(matches!(
            f.dep_file_key(&table, id, &observed, MissingInputBehavior::Error),
            Err(KeyError::MissingInput { .. })
        ));
    }

    #[test]
    fn manifest_key_survives_covered_content_edits() {
        let env = env();
        write(&env, "headers/a.h", "aaa");
        write(&env, "src/main.c", "main");

        let mut table = RuleTable::new();
        let mut rule = TestRule::new("//:lib");
        rule.sources = vec!["headers/a.h".into(), "src/main.c".into()];
        rule.covered_prefix = Some("headers/".into());
        let id = table.add(Arc::new(rule));

        let config = EngineConfig::default();
        let f = factory(&env, &config);
        let before = f.manifest_key(&table, id).unwrap();
        assert_eq!(before.inputs, vec![Utf8PathBuf::from("headers/a.h")]);

        write(&env, "headers/a.h", "edited");
        env.cache.invalidate(Utf8Path::new("headers/a.h"));
        let after = f.manifest_key(&table, id).unwrap();
        assert_eq!(before.key, after.key);

        // An uncovered source edit does move the manifest key.
        write(&env, "src/main.c", "edited");
        env.cache.invalidate(Utf8Path::new("src/main.c"));
        let moved = f.manifest_key(&table, id).unwrap();
        assert_ne!(before.key, moved.key);
    }
}
