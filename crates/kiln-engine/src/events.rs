//! Side-band engine events.
//!
//! Posting is a plain method call into a non-blocking sink; nothing on the
//! cache critical path ever waits on an event consumer.

use std::sync::Mutex;

use kiln_hash::RuleKey;
use kiln_rule::BuildTarget;

use crate::BuildKind;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    RuleStarted {
        target: BuildTarget,
    },
    RuleFinished {
        target: BuildTarget,
        kind: Option<BuildKind>,
    },
    CacheFetchStarted {
        target: BuildTarget,
        key: RuleKey,
    },
    CacheFetchFinished {
        target: BuildTarget,
        key: RuleKey,
        hit: bool,
    },
    StepStarted {
        target: BuildTarget,
        step: String,
    },
    StepFinished {
        target: BuildTarget,
        step: String,
        exit_code: i32,
    },
    ArtifactCompressed {
        target: BuildTarget,
        uncompressed_bytes: u64,
        compressed_bytes: u64,
    },
    ManifestStored {
        target: BuildTarget,
        entries: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn post(&self, event: EngineEvent);
}

/// Discards everything.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn post(&self, _event: EngineEvent) {}
}

/// Buffers events in memory; for tests and debugging.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl EventSink for MemoryEventSink {
    fn post(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}
