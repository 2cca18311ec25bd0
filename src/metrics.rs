use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

/// Process-local counters for bootstrap runs. There is no exporter surface;
/// snapshots are logged at the end of a run and asserted on in tests.
pub struct MetricsCollector {
    stages: Mutex<BTreeMap<String, StageCounters>>,
    probe_attempts: AtomicU64,
}

#[derive(Default)]
struct StageCounters {
    attempts: u64,
    successes: u64,
    failures: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageCountersSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageCountersSnapshot>,
    pub probe_attempts: u64,
}

impl MetricsCollector {
    fn new() -> Self {
        Self {
            stages: Mutex::new(BTreeMap::new()),
            probe_attempts: AtomicU64::new(0),
        }
    }

    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
        INSTANCE.get_or_init(Self::new)
    }

    pub fn record_stage_attempt(&self, stage: &str) {
        if let Ok(mut guard) = self.stages.lock() {
            guard.entry(stage.to_string()).or_default().attempts += 1;
        }
    }

    pub fn record_stage_success(&self, stage: &str) {
        if let Ok(mut guard) = self.stages.lock() {
            guard.entry(stage.to_string()).or_default().successes += 1;
        }
    }

    pub fn record_stage_failure(&self, stage: &str) {
        if let Ok(mut guard) = self.stages.lock() {
            guard.entry(stage.to_string()).or_default().failures += 1;
        }
    }

    pub fn record_probe_attempts(&self, attempts: u32) {
        self.probe_attempts
            .fetch_add(u64::from(attempts), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stages = self
            .stages
            .lock()
            .map(|guard| {
                guard
                    .iter()
                    .map(|(name, counters)| {
                        (
                            name.clone(),
                            StageCountersSnapshot {
                                attempts: counters.attempts,
                                successes: counters.successes,
                                failures: counters.failures,
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        MetricsSnapshot {
            stages,
            probe_attempts: self.probe_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Returns the shared `MetricsCollector` instance.
pub fn metrics() -> &'static MetricsCollector {
    MetricsCollector::global()
}
