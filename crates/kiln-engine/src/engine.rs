//! The four-stage cache protocol and post-build finalization.
//!
//! Per rule, strictly in order:
//! 1. on-disk default-key match (nothing ran, nothing fetched)
//! 2. default-key cache fetch
//! 3. build deps (shuffled, recursive)
//! 4. partial-information keys: input-based match/fetch, dep-file match,
//!    manifest lookup and fetch
//! 5. local step execution
//!
//! Every stage boundary polls for cancellation. The most specific route that
//! succeeds wins; results are memoized per target for the engine's lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use camino::{Utf8Path, Utf8PathBuf};
use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use kiln_cache::{ArtifactCache, ArtifactInfo, CacheResult};
use kiln_hash::{hash_file, DefaultFileHashCache, FileHashCache, ProjectFilesystem, RuleKey};
use kiln_keys::{KeyError, ManifestKeyAndInputs, MissingInputBehavior, RuleKeyFactory};
use kiln_manifest::Manifest;
use kiln_metadata::{keys, BuildInfoStore, BuildInfoStores};
use kiln_rule::{
    BuildMode, BuildRule, BuildTarget, EngineConfig, InputDescriptor, ResourceAmounts, RuleTable,
    Step, StepContext, TargetId,
};

use crate::events::{EngineEvent, EventSink};
use crate::result::{BuildKind, BuildReport, BuildResult, BuildStatus, EngineError, FirstFailure};
use crate::scheduler::Scheduler;

const OUT_DIR: &str = ".kiln";
const META_DIR: &str = "meta";
const SCRATCH_DIR: &str = "tmp";

type RuleFuture = Shared<BoxFuture<'static, BuildResult>>;

/// Why a rule did not succeed, split so cancellation is never conflated with
/// failure.
enum RuleFailure {
    Canceled(String),
    Error(EngineError),
}

impl From<EngineError> for RuleFailure {
    fn from(e: EngineError) -> Self {
        RuleFailure::Error(e)
    }
}

impl From<KeyError> for RuleFailure {
    fn from(e: KeyError) -> Self {
        RuleFailure::Error(EngineError::Key(e))
    }
}

type RuleOutcome = Result<(BuildKind, CacheResult), RuleFailure>;

/// Carries stage-computed facts into finalization.
#[derive(Default)]
struct FinalizeCtx {
    input_key: Option<RuleKey>,
    /// Out-of-band metadata from a cache hit, plus the fetched blob size.
    fetched: Option<(HashMap<String, String>, u64)>,
    /// The manifest (and its key) that routed a manifest-based hit.
    manifest: Option<(ManifestKeyAndInputs, Manifest)>,
}

/// The caching build engine.
pub struct BuildEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    table: RuleTable,
    fs: ProjectFilesystem,
    config: EngineConfig,
    hash_cache: Arc<dyn FileHashCache>,
    key_factory: RuleKeyFactory,
    stores: BuildInfoStores,
    cache: Arc<dyn ArtifactCache>,
    scheduler: Arc<Scheduler>,
    events: Arc<dyn EventSink>,
    /// Memoized result futures. The lock is held only around first-insert,
    /// keeping the map single-writer per target.
    results: Mutex<HashMap<TargetId, RuleFuture>>,
    first_failure: OnceLock<FirstFailure>,
}

impl BuildEngine {
    pub fn new(
        fs: ProjectFilesystem,
        table: RuleTable,
        config: EngineConfig,
        cache: Arc<dyn ArtifactCache>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let hash_cache: Arc<dyn FileHashCache> = Arc::new(DefaultFileHashCache::new(fs.clone()));
        let key_factory = RuleKeyFactory::new(fs.clone(), hash_cache.clone(), &config);
        let scheduler = Arc::new(Scheduler::new(config.resource_caps, config.fair_scheduling));
        Self {
            inner: Arc::new(EngineInner {
                table,
                fs,
                config,
                hash_cache,
                key_factory,
                stores: BuildInfoStores::new(),
                cache,
                scheduler,
                events,
                results: Mutex::new(HashMap::new()),
                first_failure: OnceLock::new(),
            }),
        }
    }

    /// The build-info store for the engine's project filesystem.
    pub fn build_info_store(&self) -> Arc<BuildInfoStore> {
        self.inner.store()
    }

    pub fn hash_cache(&self) -> Arc<dyn FileHashCache> {
        self.inner.hash_cache.clone()
    }

    pub fn target_id(&self, target: &str) -> Option<TargetId> {
        self.inner.table.id_of(target)
    }

    /// Build the given targets, returning one result per target in demand
    /// order. Runtime deps of each target are demanded alongside it.
    pub async fn build(&self, targets: &[TargetId]) -> BuildReport {
        let futures: Vec<_> = targets
            .iter()
            .map(|id| result_with_runtime_deps(&self.inner, *id))
            .collect();
        let results = join_all(futures).await;
        BuildReport {
            results,
            first_failure: self.inner.first_failure.get().cloned(),
        }
    }
}

/// The memoized result future for one rule, created on first demand.
fn rule_future(engine: &Arc<EngineInner>, id: TargetId) -> RuleFuture {
    let mut results = engine.results.lock().unwrap();
    if let Some(future) = results.get(&id) {
        return future.clone();
    }

    let task_engine = engine.clone();
    let handle = tokio::spawn(async move { drive(task_engine, id).await });
    let target = engine.table.get(id).target().clone();
    let future = async move {
        match handle.await {
            Ok(result) => result,
            Err(e) => BuildResult {
                target,
                status: BuildStatus::Failure {
                    error: EngineError::Internal(format!("build task died: {e}")),
                },
            },
        }
    }
    .boxed()
    .shared();

    results.insert(id, future.clone());
    future
}

/// A rule's result, gated on every runtime dep (recursively) resolving
/// successfully. Runtime-dep failure or cancellation propagates into the
/// returned result.
fn result_with_runtime_deps(
    engine: &Arc<EngineInner>,
    id: TargetId,
) -> BoxFuture<'static, BuildResult> {
    let engine = engine.clone();
    async move {
        let own = rule_future(&engine, id).await;
        if !own.is_success() {
            return own;
        }

        let rule = engine.table.get(id);
        if !rule.has_runtime_deps() {
            return own;
        }

        let dep_futures: Vec<_> = rule
            .runtime_deps()
            .into_iter()
            .map(|dep| result_with_runtime_deps(&engine, dep))
            .collect();
        for dep_result in join_all(dep_futures).await {
            match dep_result.status {
                BuildStatus::Success { .. } => {}
                BuildStatus::Failure { .. } => {
                    return BuildResult {
                        target: own.target.clone(),
                        status: BuildStatus::Failure {
                            error: EngineError::DepFailed {
                                target: own.target.clone(),
                                dep: dep_result.target,
                            },
                        },
                    };
                }
                BuildStatus::Canceled { reason } => {
                    return BuildResult {
                        target: own.target.clone(),
                        status: BuildStatus::Canceled { reason },
                    };
                }
            }
        }
        own
    }
    .boxed()
}

async fn drive(engine: Arc<EngineInner>, id: TargetId) -> BuildResult {
    let rule = engine.table.get(id).clone();
    let target = rule.target().clone();
    engine.events.post(EngineEvent::RuleStarted {
        target: target.clone(),
    });

    let outcome = match engine.check_cancel() {
        Err(failure) => Err(failure),
        Ok(()) => build_rule(&engine, &rule, id).await,
    };

    let mut status = match outcome {
        Ok((kind, cache)) => {
            info!(rule = %target, ?kind, "rule finished");
            BuildStatus::Success { kind, cache }
        }
        Err(RuleFailure::Canceled(reason)) => {
            debug!(rule = %target, reason = %reason, "rule canceled");
            BuildStatus::Canceled { reason }
        }
        Err(RuleFailure::Error(error)) => {
            warn!(rule = %target, error = %error, "rule failed");
            let _ = engine.first_failure.set(FirstFailure {
                target: target.clone(),
                message: error.to_string(),
            });
            BuildStatus::Failure { error }
        }
    };

    // Deep mode materializes the whole subtree even behind cache hits. The
    // dep's own result stays in the report; a failure additionally surfaces
    // here so a fetched parent cannot mask it.
    if engine.config.build_mode == BuildMode::Deep
        && matches!(status, BuildStatus::Success { .. })
    {
        let dep_futures: Vec<_> = rule
            .deps()
            .iter()
            .map(|dep| result_with_runtime_deps(&engine, *dep))
            .collect();
        for dep_result in join_all(dep_futures).await {
            match dep_result.status {
                BuildStatus::Success { .. } => {}
                BuildStatus::Failure { .. } => {
                    status = BuildStatus::Failure {
                        error: EngineError::DepFailed {
                            target: target.clone(),
                            dep: dep_result.target,
                        },
                    };
                    break;
                }
                BuildStatus::Canceled { reason } => {
                    status = BuildStatus::Canceled { reason };
                    break;
                }
            }
        }
    }

    engine.events.post(EngineEvent::RuleFinished {
        target: target.clone(),
        kind: match &status {
            BuildStatus::Success { kind, .. } => Some(*kind),
            _ => None,
        },
    });

    BuildResult { target, status }
}

async fn build_rule(
    engine: &Arc<EngineInner>,
    rule: &Arc<dyn BuildRule>,
    id: TargetId,
) -> RuleOutcome {
    let target = rule.target().clone();
    let store = engine.store();

    // Stage 1: does the on-disk default key already match?
    let default_key = engine.key_factory.default_key(&engine.table, id)?;
    let on_disk_key = store
        .read(&target, keys::RULE_KEY)
        .map_err(|e| EngineError::io("reading rule key metadata", e))?;
    if on_disk_key.as_deref() == Some(default_key.to_hex().as_str()) {
        debug!(rule = %target, "default key matches on disk");
        return engine
            .finalize(
                rule,
                id,
                default_key,
                BuildKind::MatchingRuleKey,
                FinalizeCtx::default(),
            )
            .await;
    }

    // Stage 2: default-key cache fetch.
    if let Some(fetched) = engine.try_fetch(rule, &target, default_key).await? {
        return engine
            .finalize(
                rule,
                id,
                default_key,
                BuildKind::FetchedFromCache,
                FinalizeCtx {
                    fetched: Some(fetched),
                    ..FinalizeCtx::default()
                },
            )
            .await;
    }
    engine.check_cancel()?;

    // Stage 3: build deps, shuffled to spread contention across targets that
    // share subsystems.
    let mut dep_ids = rule.deps().to_vec();
    dep_ids.shuffle(&mut rand::thread_rng());
    let dep_futures: Vec<_> = dep_ids
        .iter()
        .map(|dep| result_with_runtime_deps(engine, *dep))
        .collect();
    for dep_result in join_all(dep_futures).await {
        match dep_result.status {
            BuildStatus::Success { .. } => {}
            BuildStatus::Failure { .. } => {
                if engine.config.keep_going {
                    return Err(RuleFailure::Error(EngineError::DepFailed {
                        target: target.clone(),
                        dep: dep_result.target,
                    }));
                }
                return Err(RuleFailure::Canceled(engine.cancel_reason()));
            }
            BuildStatus::Canceled { reason } => {
                return Err(RuleFailure::Canceled(reason));
            }
        }
    }
    engine.check_cancel()?;

    // Stage 4a: input-based key.
    let mut input_key = None;
    if rule.supports_input_based_rule_key() {
        match engine.key_factory.input_based_key(&engine.table, id) {
            Ok(key) => {
                input_key = Some(key);
                let on_disk = store
                    .read(&target, keys::INPUT_BASED_RULE_KEY)
                    .map_err(|e| EngineError::io("reading input-based key metadata", e))?;
                if on_disk.as_deref() == Some(key.to_hex().as_str()) {
                    debug!(rule = %target, "input-based key matches on disk");
                    return engine
                        .finalize(
                            rule,
                            id,
                            default_key,
                            BuildKind::MatchingInputBasedRuleKey,
                            FinalizeCtx {
                                input_key,
                                ..FinalizeCtx::default()
                            },
                        )
                        .await;
                }
                if let Some(fetched) = engine.try_fetch(rule, &target, key).await? {
                    return engine
                        .finalize(
                            rule,
                            id,
                            default_key,
                            BuildKind::FetchedFromCacheInputBased,
                            FinalizeCtx {
                                input_key,
                                fetched: Some(fetched),
                                ..FinalizeCtx::default()
                            },
                        )
                        .await;
                }
            }
            Err(KeyError::SizeLimitExceeded { limit, actual, .. }) => {
                debug!(
                    rule = %target,
                    limit, actual, "input set too large; skipping input-based caching"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Stage 4b: dep-file key over the previously observed inputs.
    if engine.config.dep_files.keys_enabled() && rule.uses_dep_file_rule_keys() {
        if let Some(entries) = engine.read_dep_file(&store, &target)? {
            let key = engine.key_factory.dep_file_key(
                &engine.table,
                id,
                &entries,
                MissingInputBehavior::Tolerate,
            )?;
            if let Some(key) = key {
                let on_disk = store
                    .read(&target, keys::DEP_FILE_RULE_KEY)
                    .map_err(|e| EngineError::io("reading dep-file key metadata", e))?;
                if on_disk.as_deref() == Some(key.to_hex().as_str()) {
                    debug!(rule = %target, "dep-file key matches on disk");
                    return engine
                        .finalize(
                            rule,
                            id,
                            default_key,
                            BuildKind::MatchingDepFileRuleKey,
                            FinalizeCtx {
                                input_key,
                                ..FinalizeCtx::default()
                            },
                        )
                        .await;
                }
            }
        }
    }

    // Stage 4c: manifest lookup, routing to a dep-file-key artifact.
    if engine.config.dep_files.manifest_caching()
        && rule.uses_dep_file_rule_keys()
        && rule.is_cacheable()
    {
        engine.check_cancel()?;
        let mki = engine.key_factory.manifest_key(&engine.table, id)?;
        let manifest = engine.load_manifest(&store, &target, &mki).await;
        if let Some(dep_file_key) = manifest.lookup(engine.hash_cache.as_ref()) {
            debug!(
                rule = %target,
                key = %dep_file_key.short_hex(),
                "manifest entry matches current inputs"
            );
            if let Some(fetched) = engine.try_fetch(rule, &target, dep_file_key).await? {
                return engine
                    .finalize(
                        rule,
                        id,
                        default_key,
                        BuildKind::FetchedFromCacheManifestBased,
                        FinalizeCtx {
                            input_key,
                            fetched: Some(fetched),
                            manifest: Some((mki, manifest)),
                        },
                    )
                    .await;
            }
        }
    }
    engine.check_cancel()?;

    // Stage 5: local build.
    if engine.config.build_mode == BuildMode::PopulateFromRemoteCache {
        return Err(RuleFailure::Error(EngineError::LocalBuildsDisabled {
            target,
        }));
    }

    let permit = engine.scheduler.acquire(rule.resource_amounts()).await;
    engine.check_cancel()?;

    info!(rule = %target, "building locally");
    let outcome = async {
        engine.run_steps(&target, rule.steps()).await?;
        drop(permit);
        engine
            .finalize(
                rule,
                id,
                default_key,
                BuildKind::BuiltLocally,
                FinalizeCtx {
                    input_key,
                    ..FinalizeCtx::default()
                },
            )
            .await
    }
    .await;

    if let Err(RuleFailure::Error(_)) = &outcome {
        // Never leave half-written metadata behind a failed build.
        if let Err(e) = store.delete(&target) {
            warn!(rule = %target, error = %e, "metadata cleanup failed");
        }
    }
    outcome
}

impl EngineInner {
    fn store(&self) -> Arc<BuildInfoStore> {
        self.stores
            .get(&self.fs.root().join(OUT_DIR).join(META_DIR))
    }

    fn scratch_dir(&self) -> Utf8PathBuf {
        self.fs.root().join(OUT_DIR).join(SCRATCH_DIR)
    }

    async fn run_steps(
        &self,
        target: &BuildTarget,
        steps: Vec<Arc<dyn Step>>,
    ) -> Result<(), RuleFailure> {
        let ctx = StepContext {
            fs: self.fs.clone(),
            target: target.clone(),
        };
        for step in steps {
            let name = step.short_name().to_string();
            self.events.post(EngineEvent::StepStarted {
                target: target.clone(),
                step: name.clone(),
            });
            let outcome = step
                .execute(&ctx)
                .await
                .map_err(|e| EngineError::StepError {
                    target: target.clone(),
                    step: name.clone(),
                    description: e.to_string(),
                })?;
            self.events.post(EngineEvent::StepFinished {
                target: target.clone(),
                step: name.clone(),
                exit_code: outcome.exit_code,
            });
            if !outcome.is_success() {
                return Err(RuleFailure::Error(EngineError::StepFailed {
                    target: target.clone(),
                    step: name,
                    exit_code: outcome.exit_code,
                }));
            }
        }
        Ok(())
    }

    /// Fetch `key` and unpack it over the rule's outputs. `Ok(None)` covers
    /// miss, transport error (logged), and corrupt blob — the protocol just
    /// moves on to the next stage.
    async fn try_fetch(
        &self,
        rule: &Arc<dyn BuildRule>,
        target: &BuildTarget,
        key: RuleKey,
    ) -> Result<Option<(HashMap<String, String>, u64)>, RuleFailure> {
        if !rule.is_cacheable() {
            return Ok(None);
        }
        self.check_cancel()?;

        let scratch = self.scratch_dir();
        std::fs::create_dir_all(&scratch)
            .map_err(|e| EngineError::io("creating scratch dir", e))?;
        let dest = scratch.join(format!("fetch-{}.zip", key.to_hex()));

        self.events.post(EngineEvent::CacheFetchStarted {
            target: target.clone(),
            key,
        });
        let permit = self.scheduler.acquire(ResourceAmounts::one_fetch()).await;
        let result = self.cache.fetch(key, &dest).await;
        drop(permit);

        let hit = matches!(result, CacheResult::Hit { .. });
        self.events.post(EngineEvent::CacheFetchFinished {
            target: target.clone(),
            key,
            hit,
        });

        match result {
            CacheResult::Hit {
                metadata,
                artifact_size,
            } => {
                // Clear prior metadata before touching outputs so a
                // half-unpacked state can never be mistaken for a build.
                self.store()
                    .delete(target)
                    .map_err(|e| EngineError::io("clearing metadata before unpack", e))?;

                let unpacked = kiln_archive::unpack(
                    dest.clone(),
                    self.fs.clone(),
                    rule.declared_outputs().to_vec(),
                    kiln_archive::ExistingFileMode::OverwriteAndCleanDirectories,
                )
                .await;
                let _ = kiln_io::remove_path_if_exists(&dest);

                match unpacked {
                    Ok(()) => Ok(Some((metadata, artifact_size))),
                    Err(e) => {
                        warn!(
                            rule = %target,
                            key = %key.short_hex(),
                            error = %e,
                            "fetched artifact failed to unpack; treating as miss"
                        );
                        Ok(None)
                    }
                }
            }
            CacheResult::Miss | CacheResult::Ignored | CacheResult::LocalKeyUnchangedHit => {
                Ok(None)
            }
            CacheResult::Error { description } => {
                warn!(rule = %target, %description, "cache fetch error; treating as miss");
                Ok(None)
            }
        }
    }

    fn read_dep_file(
        &self,
        store: &BuildInfoStore,
        target: &BuildTarget,
    ) -> Result<Option<Vec<InputDescriptor>>, RuleFailure> {
        let Some(json) = store
            .read(target, keys::DEP_FILE)
            .map_err(|e| EngineError::io("reading dep file", e))?
        else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(entries) => Ok(Some(entries)),
            Err(e) => {
                warn!(rule = %target, error = %e, "corrupt dep file; ignoring");
                Ok(None)
            }
        }
    }

    /// The manifest for `mki`: the local file when its recorded key still
    /// matches, else a cache fetch, else empty. Corruption degrades to empty.
    async fn load_manifest(
        &self,
        store: &BuildInfoStore,
        target: &BuildTarget,
        mki: &ManifestKeyAndInputs,
    ) -> Manifest {
        let recorded = store.read(target, keys::MANIFEST_KEY).ok().flatten();
        if recorded.as_deref() == Some(mki.key.to_hex().as_str()) {
            match Manifest::load(&store.manifest_path(target)) {
                Ok(Some(manifest)) => return manifest,
                Ok(None) => {}
                Err(e) => {
                    warn!(rule = %target, error = %e, "corrupt local manifest; refetching");
                }
            }
        }

        let scratch = self.scratch_dir();
        if std::fs::create_dir_all(&scratch).is_err() {
            return Manifest::new();
        }
        let dest = scratch.join(format!("manifest-{}.gz", mki.key.to_hex()));
        let result = self.cache.fetch(mki.key, &dest).await;
        let manifest = match result {
            CacheResult::Hit { .. } => match std::fs::read(&dest)
                .map_err(kiln_manifest::ManifestError::from)
                .and_then(|gz| {
                    let bytes = kiln_archive::gunzip_bytes(&gz)?;
                    Manifest::from_bytes(&bytes)
                }) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(rule = %target, error = %e, "corrupt fetched manifest; starting fresh");
                    Manifest::new()
                }
            },
            _ => Manifest::new(),
        };
        let _ = kiln_io::remove_path_if_exists(&dest);
        manifest
    }

    /// Post-build finalization: reconcile recorded paths, run post-build
    /// steps, persist dep files and manifests, hash outputs, commit metadata
    /// atomically, and upload.
    async fn finalize(
        &self,
        rule: &Arc<dyn BuildRule>,
        id: TargetId,
        default_key: RuleKey,
        kind: BuildKind,
        ctx: FinalizeCtx,
    ) -> RuleOutcome {
        let target = rule.target().clone();
        let store = self.store();

        // Seed the metadata set from wherever this outcome's truth lives.
        let mut metadata = match kind {
            BuildKind::BuiltLocally => HashMap::new(),
            _ if kind.fetched_from_cache() => ctx
                .fetched
                .as_ref()
                .map(|(m, _)| m.clone())
                .unwrap_or_default(),
            _ => store
                .read_all(&target)
                .map_err(|e| EngineError::io("reloading metadata", e))?,
        };

        // Recorded paths: reloaded and reconciled for non-local outcomes.
        let recorded_paths: Vec<Utf8PathBuf> = match metadata.get(keys::RECORDED_PATHS) {
            Some(json) if !kind.built_locally() => {
                serde_json::from_str(json).unwrap_or_else(|_| rule.declared_outputs().to_vec())
            }
            _ => rule.declared_outputs().to_vec(),
        };

        metadata.insert(keys::TARGET.to_string(), target.full_name().to_string());
        metadata.insert(keys::RULE_KEY.to_string(), default_key.to_hex());

        let mut input_key = ctx.input_key;
        if kind.built_locally() && input_key.is_none() && rule.supports_input_based_rule_key() {
            match self.key_factory.input_based_key(&self.table, id) {
                Ok(key) => input_key = Some(key),
                Err(KeyError::SizeLimitExceeded { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(key) = input_key {
            metadata.insert(keys::INPUT_BASED_RULE_KEY.to_string(), key.to_hex());
        }

        // Outputs changed: run post-build steps, then drop any stale hashes.
        if kind.outputs_changed() {
            if rule.has_post_build_steps() {
                self.run_steps(&target, rule.post_build_steps()).await?;
            }
            for path in &recorded_paths {
                self.hash_cache.invalidate(path);
            }
        }

        // Dep files and manifests are produced only by a local build.
        let mut dep_file_key = None;
        if kind.built_locally()
            && self.config.dep_files.keys_enabled()
            && rule.uses_dep_file_rule_keys()
        {
            let observed = rule
                .inputs_after_building_locally(&self.fs)
                .map_err(|e| EngineError::io("collecting observed inputs", e))?;
            let key = self
                .key_factory
                .dep_file_key(&self.table, id, &observed, MissingInputBehavior::Error)?
                .ok_or_else(|| {
                    EngineError::Internal("dep-file key unavailable post-build".to_string())
                })?;
            metadata.insert(
                keys::DEP_FILE.to_string(),
                serde_json::to_string(&observed)
                    .map_err(|e| EngineError::Internal(format!("serializing dep file: {e}")))?,
            );
            metadata.insert(keys::DEP_FILE_RULE_KEY.to_string(), key.to_hex());
            dep_file_key = Some(key);

            if self.config.dep_files.manifest_caching() && rule.is_cacheable() {
                let mki = self.key_factory.manifest_key(&self.table, id)?;
                metadata.insert(keys::MANIFEST_KEY.to_string(), mki.key.to_hex());
                let observed_paths: Vec<Utf8PathBuf> =
                    observed.iter().map(|d| d.path.clone()).collect();
                self.update_and_store_manifest(&store, &target, &mki, key, &observed_paths)
                    .await?;
            }
        }

        // A manifest-routed fetch keeps the manifest it used.
        if let Some((mki, manifest)) = &ctx.manifest {
            metadata.insert(keys::MANIFEST_KEY.to_string(), mki.key.to_hex());
            kiln_io::atomic_write(&store.manifest_path(&target), &manifest.to_bytes())
                .map_err(|e| EngineError::io("persisting fetched manifest", e))?;
        }

        // Output size gates both hashing and upload.
        let output_files = self.collect_output_files(&target, &recorded_paths, kind)?;
        let output_bytes: u64 = output_files.iter().map(|(_, size)| size).sum();
        let within_limit = self
            .config
            .artifact_cache_size_limit
            .is_none_or(|cap| output_bytes <= cap);

        if kind.built_locally() && rule.is_cacheable() && within_limit {
            let mut hashes = HashMap::new();
            for (path, _) in &output_files {
                let hash = hash_file(&self.fs.resolve(path))
                    .map_err(|e| EngineError::io(format!("hashing output {path}"), e))?;
                hashes.insert(path.to_string(), hash.to_hex());
            }
            metadata.insert(
                keys::RECORDED_PATH_HASHES.to_string(),
                serde_json::to_string(&hashes)
                    .map_err(|e| EngineError::Internal(format!("serializing output hashes: {e}")))?,
            );
        }

        // Fetched outputs with verifiable hashes seed the hash cache.
        if kind.fetched_from_cache() && kind.outputs_changed() {
            if let Some(json) = metadata.get(keys::RECORDED_PATH_HASHES) {
                self.seed_hash_cache(&target, json);
            }
        }

        metadata.insert(
            keys::RECORDED_PATHS.to_string(),
            serde_json::to_string(&recorded_paths)
                .map_err(|e| EngineError::Internal(format!("serializing recorded paths: {e}")))?,
        );

        store
            .update(&target, &metadata)
            .map_err(|e| EngineError::io("committing metadata", e))?;

        // Upload, multi-indexed in deterministic order: default, then
        // input-based, then dep-file.
        if kind.built_locally() && rule.is_cacheable() {
            if within_limit {
                let mut upload_keys = vec![default_key];
                upload_keys.extend(input_key);
                if self.config.dep_files.manifest_caching() {
                    upload_keys.extend(dep_file_key);
                }
                self.upload(&target, &recorded_paths, upload_keys, &metadata)
                    .await?;
            } else {
                debug!(
                    rule = %target,
                    output_bytes, "outputs exceed cache size limit; skipping upload"
                );
            }
        }

        let cache_result = match kind {
            BuildKind::BuiltLocally => {
                if rule.is_cacheable() {
                    CacheResult::Miss
                } else {
                    CacheResult::Ignored
                }
            }
            _ if kind.fetched_from_cache() => {
                let (fetched_metadata, artifact_size) = ctx.fetched.unwrap_or_default();
                CacheResult::Hit {
                    metadata: fetched_metadata,
                    artifact_size,
                }
            }
            _ => CacheResult::LocalKeyUnchangedHit,
        };

        Ok((kind, cache_result))
    }

    /// Every output file under the recorded paths, with sizes. A declared
    /// output missing after a local build is a hard error; for key-matching
    /// outcomes the on-disk state was already proven current.
    fn collect_output_files(
        &self,
        target: &BuildTarget,
        recorded_paths: &[Utf8PathBuf],
        kind: BuildKind,
    ) -> Result<Vec<(Utf8PathBuf, u64)>, RuleFailure> {
        let mut files = Vec::new();
        for rel in recorded_paths {
            let abs = self.fs.resolve(rel);
            if !abs.exists() {
                if kind.built_locally() {
                    return Err(RuleFailure::Error(EngineError::MissingOutput {
                        target: target.clone(),
                        path: rel.clone(),
                    }));
                }
                continue;
            }
            collect_files_under(&abs, rel, &mut files)
                .map_err(|e| EngineError::io(format!("walking output {rel}"), e))?;
        }
        Ok(files)
    }

    fn seed_hash_cache(&self, target: &BuildTarget, hashes_json: &str) {
        let Ok(hashes) = serde_json::from_str::<HashMap<String, String>>(hashes_json) else {
            warn!(rule = %target, "corrupt recorded path hashes; not seeding");
            return;
        };
        // Verify everything against disk before seeding anything.
        let mut verified = Vec::with_capacity(hashes.len());
        for (path, hex) in &hashes {
            let rel = Utf8PathBuf::from(path);
            let Some(expected) = RuleKey::from_hex(hex) else {
                return;
            };
            match hash_file(&self.fs.resolve(&rel)) {
                Ok(actual) if actual == expected => verified.push((rel, actual)),
                _ => {
                    warn!(rule = %target, path = %rel, "fetched output hash mismatch");
                    return;
                }
            }
        }
        for (path, hash) in verified {
            self.hash_cache.set(path, hash);
        }
    }

    async fn update_and_store_manifest(
        &self,
        store: &BuildInfoStore,
        target: &BuildTarget,
        mki: &ManifestKeyAndInputs,
        dep_file_key: RuleKey,
        observed: &[Utf8PathBuf],
    ) -> Result<(), RuleFailure> {
        let mut manifest = self.load_manifest(store, target, mki).await;
        manifest
            .add_entry(
                self.hash_cache.as_ref(),
                dep_file_key,
                observed,
                self.config.max_dep_file_cache_entries,
            )
            .map_err(|e| EngineError::io("hashing observed inputs for manifest", e))?;

        let bytes = manifest.to_bytes();
        kiln_io::atomic_write(&store.manifest_path(target), &bytes)
            .map_err(|e| EngineError::io("persisting manifest", e))?;

        // Ship the gzip wire form to the artifact cache under the manifest
        // key; compression stats are surfaced off the critical path.
        let gz = kiln_archive::gzip_bytes(&bytes)
            .map_err(|e| EngineError::io("compressing manifest", e))?;
        self.events.post(EngineEvent::ArtifactCompressed {
            target: target.clone(),
            uncompressed_bytes: bytes.len() as u64,
            compressed_bytes: gz.len() as u64,
        });

        let scratch = self.scratch_dir();
        std::fs::create_dir_all(&scratch)
            .map_err(|e| EngineError::io("creating scratch dir", e))?;
        let blob = scratch.join(format!("manifest-{}.gz", mki.key.to_hex()));
        kiln_io::atomic_write(&blob, &gz)
            .map_err(|e| EngineError::io("staging manifest blob", e))?;

        let mut meta = HashMap::new();
        meta.insert(keys::TARGET.to_string(), target.full_name().to_string());
        self.cache
            .store(
                ArtifactInfo {
                    keys: vec![mki.key],
                    metadata: meta,
                },
                blob.clone(),
            )
            .await;
        let _ = kiln_io::remove_path_if_exists(&blob);

        self.events.post(EngineEvent::ManifestStored {
            target: target.clone(),
            entries: manifest.size(),
        });
        Ok(())
    }

    async fn upload(
        &self,
        target: &BuildTarget,
        recorded_paths: &[Utf8PathBuf],
        upload_keys: Vec<RuleKey>,
        metadata: &HashMap<String, String>,
    ) -> Result<(), RuleFailure> {
        let scratch = self.scratch_dir();
        std::fs::create_dir_all(&scratch)
            .map_err(|e| EngineError::io("creating scratch dir", e))?;
        let zip_path = scratch.join(format!("upload-{}.zip", upload_keys[0].to_hex()));

        let stats =
            kiln_archive::pack(self.fs.clone(), recorded_paths.to_vec(), zip_path.clone())
                .await
                .map_err(EngineError::from)?;
        self.events.post(EngineEvent::ArtifactCompressed {
            target: target.clone(),
            uncompressed_bytes: stats.uncompressed_bytes,
            compressed_bytes: stats.compressed_bytes,
        });

        self.cache
            .store(
                ArtifactInfo {
                    keys: upload_keys,
                    metadata: metadata.clone(),
                },
                zip_path.clone(),
            )
            .await;
        let _ = kiln_io::remove_path_if_exists(&zip_path);
        Ok(())
    }

    fn cancel_reason(&self) -> String {
        self.first_failure
            .get()
            .map(|f| format!("canceled after failure of {}: {}", f.target, f.message))
            .unwrap_or_else(|| "canceled".to_string())
    }

    fn check_cancel(&self) -> Result<(), RuleFailure> {
        if !self.config.keep_going && self.first_failure.get().is_some() {
            return Err(RuleFailure::Canceled(self.cancel_reason()));
        }
        Ok(())
    }
}

fn collect_files_under(
    abs: &Utf8Path,
    rel: &Utf8Path,
    out: &mut Vec<(Utf8PathBuf, u64)>,
) -> std::io::Result<()> {
    let meta = std::fs::metadata(abs)?;
    if meta.is_file() {
        out.push((rel.to_owned(), meta.len()));
        return Ok(());
    }
    let mut children: Vec<_> = std::fs::read_dir(abs)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|e| e.file_name());
    for child in children {
        let Ok(name) = child.file_name().into_string() else {
            continue;
        };
        let child_abs = Utf8PathBuf::from_path_buf(child.path())
            .map_err(|p| std::io::Error::other(format!("non-UTF8 path {}", p.display())))?;
        collect_files_under(&child_abs, &rel.join(&name), out)?;
    }
    Ok(())
}
