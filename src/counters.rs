//! Live-call counters service
//!
//! Lock-free gauges read by admission control. Shards adjust them on worker
//! spawn and termination; readers only need a monotonically-consistent view.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::types::AppId;

/// Global and per-application live-call gauges
#[derive(Clone, Default)]
pub struct CallCounters {
    live: Arc<AtomicUsize>,
    per_app: Arc<DashMap<AppId, Arc<AtomicUsize>>>,
}

impl CallCounters {
    /// Create a zeroed counters service
    pub fn new() -> Self {
        Self::default()
    }

    /// Live calls across all applications
    pub fn live_calls(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Live calls for one application
    pub fn app_calls(&self, app: &AppId) -> usize {
        self.per_app
            .get(app)
            .map(|gauge| gauge.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a worker spawn
    pub fn incr(&self, app: &AppId) {
        self.live.fetch_add(1, Ordering::Relaxed);
        self.app_gauge(app).fetch_add(1, Ordering::Relaxed);
    }

    /// Record a worker termination
    pub fn decr(&self, app: &AppId) {
        let _ = self
            .live
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        let _ = self
            .app_gauge(app)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    fn app_gauge(&self, app: &AppId) -> Arc<AtomicUsize> {
        self.per_app
            .entry(app.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .value()
            .clone()
    }
}
