//! Engine configuration.

/// How much of the graph gets materialized, and whether local builds run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    /// Materialize only what top-level targets transitively need.
    #[default]
    Shallow,
    /// Materialize every transitive dep, even behind cache hits.
    Deep,
    /// Cache fetches only; a rule that would build locally fails instead.
    PopulateFromRemoteCache,
}

/// Dep-file key handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepFileMode {
    /// No dep-file keys at all.
    #[default]
    Disabled,
    /// Compute and match dep-file keys against on-disk state.
    Enabled,
    /// Dep-file keys plus the manifest store for cross-machine reuse.
    Cache,
}

impl DepFileMode {
    pub fn keys_enabled(self) -> bool {
        !matches!(self, DepFileMode::Disabled)
    }

    pub fn manifest_caching(self) -> bool {
        matches!(self, DepFileMode::Cache)
    }
}

/// Resource vector a task occupies while admitted by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceAmounts {
    pub cpu: u32,
    pub memory: u32,
    pub disk_io: u32,
    pub network_io: u32,
}

impl ResourceAmounts {
    pub const ZERO: ResourceAmounts = ResourceAmounts {
        cpu: 0,
        memory: 0,
        disk_io: 0,
        network_io: 0,
    };

    /// Weight of one local build step slot.
    pub fn one_cpu() -> Self {
        Self {
            cpu: 1,
            memory: 1,
            ..Self::ZERO
        }
    }

    /// Weight of a cache fetch (network plus disk).
    pub fn one_fetch() -> Self {
        Self {
            network_io: 1,
            disk_io: 1,
            ..Self::ZERO
        }
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        Some(Self {
            cpu: self.cpu.checked_add(other.cpu)?,
            memory: self.memory.checked_add(other.memory)?,
            disk_io: self.disk_io.checked_add(other.disk_io)?,
            network_io: self.network_io.checked_add(other.network_io)?,
        })
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
            disk_io: self.disk_io.saturating_sub(other.disk_io),
            network_io: self.network_io.saturating_sub(other.network_io),
        }
    }

    /// Component-wise `self <= cap`.
    pub fn fits_within(self, cap: Self) -> bool {
        self.cpu <= cap.cpu
            && self.memory <= cap.memory
            && self.disk_io <= cap.disk_io
            && self.network_io <= cap.network_io
    }
}

/// Everything the engine recognizes at construction time.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub build_mode: BuildMode,
    pub dep_files: DepFileMode,
    /// Manifest overflow bound: at this size the manifest resets before the
    /// next entry is added.
    pub max_dep_file_cache_entries: usize,
    /// Byte cap for artifact uploads; `None` means unlimited.
    pub artifact_cache_size_limit: Option<u64>,
    /// Byte cap on the summed source sizes an input-based key may hash.
    pub input_key_size_limit: Option<u64>,
    pub keep_going: bool,
    /// Memoize default rule keys per target for the engine's lifetime.
    pub rule_key_caching: bool,
    /// Folded into every rule key; bump fleet-wide to invalidate all keys.
    pub key_seed: u64,
    /// Scheduler admission caps.
    pub resource_caps: ResourceAmounts,
    /// FIFO admission when true; first-fit otherwise.
    pub fair_scheduling: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            build_mode: BuildMode::Shallow,
            dep_files: DepFileMode::Disabled,
            max_dep_file_cache_entries: 256,
            artifact_cache_size_limit: None,
            input_key_size_limit: None,
            keep_going: false,
            rule_key_caching: true,
            key_seed: 0,
            resource_caps: ResourceAmounts {
                cpu: 8,
                memory: 8,
                disk_io: 4,
                network_io: 4,
            },
            fair_scheduling: true,
        }
    }
}
