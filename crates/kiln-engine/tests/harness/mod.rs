//! Shared harness for engine integration tests.
//!
//! Provides isolated project and artifact-cache directories plus a scripted
//! rule whose single step writes configured outputs and counts how often it
//! ran — the counter is how tests prove "no step of R ran".

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use kiln_cache::DirArtifactCache;
use kiln_engine::{BuildEngine, BuildReport, EventSink, NullEventSink};
use kiln_hash::{ProjectFilesystem, RuleKey};
use kiln_metadata::BuildInfoStore;
use kiln_rule::{
    BuildRule, BuildTarget, EngineConfig, InputDescriptor, KeySink, Step, StepContext, StepError,
    StepOutcome, TargetId,
};

pub struct TestEnv {
    _project: TempDir,
    pub fs: ProjectFilesystem,
    pub cache_root: Utf8PathBuf,
    _cache: Option<TempDir>,
}

impl TestEnv {
    /// Fresh project with its own artifact cache directory.
    pub fn new() -> Self {
        // Opt-in engine logs for debugging: RUST_LOG=kiln_engine=debug.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let project = TempDir::new().expect("project temp dir");
        let cache = TempDir::new().expect("cache temp dir");
        let fs = ProjectFilesystem::new(
            Utf8PathBuf::from_path_buf(project.path().to_owned()).expect("utf8 temp dir"),
        );
        let cache_root =
            Utf8PathBuf::from_path_buf(cache.path().to_owned()).expect("utf8 temp dir");
        Self {
            _project: project,
            fs,
            cache_root,
            _cache: Some(cache),
        }
    }

    /// Fresh project sharing an existing artifact cache directory, for
    /// cross-workspace scenarios.
    pub fn with_shared_cache(cache_root: &Utf8Path) -> Self {
        let project = TempDir::new().expect("project temp dir");
        let fs = ProjectFilesystem::new(
            Utf8PathBuf::from_path_buf(project.path().to_owned()).expect("utf8 temp dir"),
        );
        Self {
            _project: project,
            fs,
            cache_root: cache_root.to_owned(),
            _cache: None,
        }
    }

    pub fn write_file(&self, rel: &str, contents: &str) {
        let abs = self.fs.resolve(Utf8Path::new(rel));
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(abs, contents).expect("write file");
    }

    pub fn delete_file(&self, rel: &str) {
        std::fs::remove_file(self.fs.resolve(Utf8Path::new(rel))).expect("delete file");
    }

    pub fn read_file(&self, rel: &str) -> String {
        std::fs::read_to_string(self.fs.resolve(Utf8Path::new(rel))).expect("read file")
    }

    pub fn file_exists(&self, rel: &str) -> bool {
        self.fs.exists(Utf8Path::new(rel))
    }

    /// The metadata store a fresh engine over this project would use.
    pub fn metadata_store(&self) -> BuildInfoStore {
        BuildInfoStore::new(self.fs.root().join(".kiln").join("meta"))
    }

    /// A fresh engine over this project. Each call builds a new engine, so
    /// result memoization never carries across "runs" in a test.
    pub fn engine(
        &self,
        rules: Vec<Arc<dyn BuildRule>>,
        config: EngineConfig,
        events: Arc<dyn EventSink>,
    ) -> BuildEngine {
        let mut table = kiln_rule::RuleTable::new();
        for rule in rules {
            table.add(rule);
        }
        BuildEngine::new(
            self.fs.clone(),
            table,
            config,
            Arc::new(DirArtifactCache::new(self.cache_root.clone())),
            events,
        )
    }

    /// Build the named targets with a fresh engine.
    pub async fn build(
        &self,
        rules: Vec<Arc<dyn BuildRule>>,
        targets: &[&str],
        config: EngineConfig,
    ) -> BuildReport {
        let engine = self.engine(rules, config, Arc::new(NullEventSink));
        let ids: Vec<TargetId> = targets
            .iter()
            .map(|t| engine.target_id(t).expect("unknown target"))
            .collect();
        engine.build(&ids).await
    }
}

/// A rule whose behavior is fully scripted by the test.
pub struct ScriptedRule {
    target: BuildTarget,
    deps: Vec<TargetId>,
    runtime_deps: Vec<TargetId>,
    sources: Vec<Utf8PathBuf>,
    outputs: Vec<Utf8PathBuf>,
    output_contents: HashMap<Utf8PathBuf, String>,
    comment: String,
    covered_prefix: Option<String>,
    reads: Vec<Utf8PathBuf>,
    cacheable: bool,
    input_based: bool,
    dep_files: bool,
    fail_step: bool,
    sleep_ms: u64,
    post_build: Option<(Utf8PathBuf, String)>,
    abi: Option<RuleKey>,
    runs: Arc<AtomicUsize>,
}

impl ScriptedRule {
    pub fn new(target: &str) -> Self {
        Self {
            target: BuildTarget::new(target).expect("valid target"),
            deps: Vec::new(),
            runtime_deps: Vec::new(),
            sources: Vec::new(),
            outputs: Vec::new(),
            output_contents: HashMap::new(),
            comment: String::new(),
            covered_prefix: None,
            reads: Vec::new(),
            cacheable: true,
            input_based: false,
            dep_files: false,
            fail_step: false,
            sleep_ms: 0,
            post_build: None,
            abi: None,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn source(mut self, path: &str) -> Self {
        self.sources.push(Utf8PathBuf::from(path));
        self
    }

    /// Declare an output the build step will write with `contents`.
    pub fn output(mut self, path: &str, contents: &str) -> Self {
        self.outputs.push(Utf8PathBuf::from(path));
        self.output_contents
            .insert(Utf8PathBuf::from(path), contents.to_string());
        self
    }

    pub fn dep(mut self, id: TargetId) -> Self {
        self.deps.push(id);
        self
    }

    pub fn runtime_dep(mut self, id: TargetId) -> Self {
        self.runtime_deps.push(id);
        self
    }

    /// A field that shapes only the default key.
    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = comment.to_string();
        self
    }

    pub fn covered_prefix(mut self, prefix: &str) -> Self {
        self.covered_prefix = Some(prefix.to_string());
        self.dep_files = true;
        self
    }

    /// Inputs the rule will claim it read during a local build.
    pub fn reads(mut self, paths: &[&str]) -> Self {
        self.reads = paths.iter().map(|p| Utf8PathBuf::from(*p)).collect();
        self
    }

    pub fn not_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn input_based(mut self) -> Self {
        self.input_based = true;
        self
    }

    pub fn failing_step(mut self) -> Self {
        self.fail_step = true;
        self
    }

    pub fn sleep_ms(mut self, ms: u64) -> Self {
        self.sleep_ms = ms;
        self
    }

    pub fn post_build_marker(mut self, path: &str, contents: &str) -> Self {
        self.post_build = Some((Utf8PathBuf::from(path), contents.to_string()));
        self
    }

    pub fn abi_key(mut self, key: RuleKey) -> Self {
        self.abi = Some(key);
        self
    }

    /// Counter incremented each time the build step actually executes.
    pub fn runs_counter(&self) -> Arc<AtomicUsize> {
        self.runs.clone()
    }

    pub fn arc(self) -> Arc<dyn BuildRule> {
        Arc::new(self)
    }
}

impl BuildRule for ScriptedRule {
    fn target(&self) -> &BuildTarget {
        &self.target
    }

    fn type_name(&self) -> &str {
        "scripted"
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
        let mut contents: Vec<String> = self
            .output_contents
            .iter()
            .map(|(path, contents)| format!("{path}={contents}"))
            .collect();
        contents.sort();
        sink.add_str_seq("outputs", &contents);
        for source in &self.sources {
            sink.add_source("src", source);
        }
    }

    fn steps(&self) -> Vec<Arc<dyn Step>> {
        vec![Arc::new(ScriptedStep {
            outputs: self.output_contents.clone(),
            fail: self.fail_step,
            sleep_ms: self.sleep_ms,
            runs: self.runs.clone(),
        })]
    }

    fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    fn supports_input_based_rule_key(&self) -> bool {
        self.input_based
    }

    fn uses_dep_file_rule_keys(&self) -> bool {
        self.dep_files
    }

    fn covered_by_dep_file(&self, path: &Utf8Path) -> bool {
        self.covered_prefix
            .as_deref()
            .is_some_and(|prefix| path.as_str().starts_with(prefix))
    }

    fn inputs_after_building_locally(
        &self,
        _fs: &ProjectFilesystem,
    ) -> std::io::Result<Vec<InputDescriptor>> {
        Ok(self
            .reads
            .iter()
            .map(|p| InputDescriptor::new(p.clone()))
            .collect())
    }

    fn has_post_build_steps(&self) -> bool {
        self.post_build.is_some()
    }

    fn post_build_steps(&self) -> Vec<Arc<dyn Step>> {
        match &self.post_build {
            Some((path, contents)) => {
                let mut outputs = HashMap::new();
                outputs.insert(path.clone(), contents.clone());
                vec![Arc::new(ScriptedStep {
                    outputs,
                    fail: false,
                    sleep_ms: 0,
                    runs: Arc::new(AtomicUsize::new(0)),
                })]
            }
            None => Vec::new(),
        }
    }

    fn has_runtime_deps(&self) -> bool {
        !self.runtime_deps.is_empty()
    }

    fn runtime_deps(&self) -> Vec<TargetId> {
        self.runtime_deps.clone()
    }

    fn abi_key(&self) -> Option<RuleKey> {
        self.abi
    }
}

struct ScriptedStep {
    outputs: HashMap<Utf8PathBuf, String>,
    fail: bool,
    sleep_ms: u64,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Step for ScriptedStep {
    fn short_name(&self) -> &str {
        "scripted_step"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        if self.sleep_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.sleep_ms)).await;
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Ok(StepOutcome { exit_code: 1 });
        }
        for (rel, contents) in &self.outputs {
            let abs = ctx.fs.resolve(rel);
            if let Some(parent) = abs.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(abs, contents)?;
        }
        Ok(StepOutcome::SUCCESS)
    }
}

pub fn runs(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}
