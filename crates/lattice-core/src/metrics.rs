use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadErrorRecord {
    pub plugin_id: String,
    pub error: String,
    pub at_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub active: usize,
    pub total_loaded: u64,
    pub total_unloaded: u64,
    pub total_failed: u64,
    pub total_agent_generated: u64,
    pub hook_calls: u64,
    pub tick_calls: u64,
    pub macro_calls: u64,
    pub recent_errors: Vec<LoadErrorRecord>,
}

/// Process-lifetime counters. Shared with macro wrappers, so every field is
/// updated through `&self`.
#[derive(Debug)]
pub struct PluginMetrics {
    total_loaded: AtomicU64,
    total_unloaded: AtomicU64,
    total_failed: AtomicU64,
    total_agent_generated: AtomicU64,
    hook_calls: AtomicU64,
    tick_calls: AtomicU64,
    macro_calls: AtomicU64,
    errors: Mutex<VecDeque<LoadErrorRecord>>,
    error_capacity: usize,
}

impl PluginMetrics {
    pub fn new(error_capacity: usize) -> Self {
        Self {
            total_loaded: AtomicU64::new(0),
            total_unloaded: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_agent_generated: AtomicU64::new(0),
            hook_calls: AtomicU64::new(0),
            tick_calls: AtomicU64::new(0),
            macro_calls: AtomicU64::new(0),
            errors: Mutex::new(VecDeque::new()),
            error_capacity: error_capacity.max(1),
        }
    }

    pub fn record_loaded(&self, agent_generated: bool) {
        self.total_loaded.fetch_add(1, Ordering::Relaxed);
        if agent_generated {
            self.total_agent_generated.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_unloaded(&self) {
        self.total_unloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self, plugin_id: &str, error: &str, at_ms: u64) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        let mut errors = self
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        errors.push_back(LoadErrorRecord {
            plugin_id: plugin_id.to_string(),
            error: error.to_string(),
            at_ms,
        });
        while errors.len() > self.error_capacity {
            errors.pop_front();
        }
    }

    pub fn record_hook_calls(&self, count: usize) {
        self.hook_calls.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_tick_call(&self) {
        self.tick_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_macro_call(&self) {
        self.macro_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active: usize, surface_errors: usize) -> MetricsSnapshot {
        let errors = self
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let skip = errors.len().saturating_sub(surface_errors);
        MetricsSnapshot {
            active,
            total_loaded: self.total_loaded.load(Ordering::Relaxed),
            total_unloaded: self.total_unloaded.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_agent_generated: self.total_agent_generated.load(Ordering::Relaxed),
            hook_calls: self.hook_calls.load(Ordering::Relaxed),
            tick_calls: self.tick_calls.load(Ordering::Relaxed),
            macro_calls: self.macro_calls.load(Ordering::Relaxed),
            recent_errors: errors.iter().skip(skip).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_ring_keeps_capacity_and_surfaces_the_tail() {
        let metrics = PluginMetrics::new(20);
        for i in 0..25 {
            metrics.record_failed(&format!("p{i}"), "init_threw", i);
        }

        let snapshot = metrics.snapshot(0, 10);
        assert_eq!(snapshot.total_failed, 25);
        assert_eq!(snapshot.recent_errors.len(), 10);
        assert_eq!(snapshot.recent_errors[0].plugin_id, "p15");
        assert_eq!(snapshot.recent_errors[9].plugin_id, "p24");

        let everything = metrics.snapshot(0, 100);
        assert_eq!(everything.recent_errors.len(), 20);
        assert_eq!(everything.recent_errors[0].plugin_id, "p5");
    }

    #[test]
    fn counters_accumulate() {
        let metrics = PluginMetrics::new(5);
        metrics.record_loaded(true);
        metrics.record_loaded(false);
        metrics.record_unloaded();
        metrics.record_hook_calls(3);
        metrics.record_tick_call();
        metrics.record_macro_call();
        metrics.record_macro_call();

        let snapshot = metrics.snapshot(1, 10);
        assert_eq!(snapshot.active, 1);
        assert_eq!(snapshot.total_loaded, 2);
        assert_eq!(snapshot.total_agent_generated, 1);
        assert_eq!(snapshot.total_unloaded, 1);
        assert_eq!(snapshot.hook_calls, 3);
        assert_eq!(snapshot.tick_calls, 1);
        assert_eq!(snapshot.macro_calls, 2);
        assert!(snapshot.recent_errors.is_empty());
    }
}
