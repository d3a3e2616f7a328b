//! Application directory
//!
//! The external application-config source consulted by shards on a cache
//! miss. Applications register their effective options at startup; lookup
//! is lock-free. The directory counts lookups so shard-side memoization is
//! observable in tests.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{RouterError, RouterResult};
use crate::types::AppId;

/// Effective options of a registered application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppOpts {
    /// Human-readable application name
    pub name: String,
    /// Per-application live-call cap; `None` means only the global cap applies
    pub max_calls: Option<usize>,
    /// Application-specific options passed through to workers
    pub extra: serde_json::Value,
}

impl AppOpts {
    /// Options with the given name and no per-app cap
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            max_calls: None,
            extra: serde_json::Value::Null,
        }
    }

    /// Set the per-application live-call cap
    pub fn with_max_calls(mut self, max_calls: usize) -> Self {
        self.max_calls = Some(max_calls);
        self
    }
}

/// Lock-free directory of registered applications
#[derive(Clone, Default)]
pub struct AppDirectory {
    apps: Arc<DashMap<AppId, Arc<AppOpts>>>,
    lookups: Arc<AtomicUsize>,
}

impl AppDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an application, replacing any previous options
    pub fn register(&self, app: AppId, opts: AppOpts) {
        self.apps.insert(app, Arc::new(opts));
    }

    /// Remove an application
    pub fn unregister(&self, app: &AppId) -> bool {
        self.apps.remove(app).is_some()
    }

    /// Resolve an application's options
    pub fn get_app_opts(&self, app: &AppId) -> RouterResult<Arc<AppOpts>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.apps
            .get(app)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RouterError::UnknownSipApp(app.to_string()))
    }

    /// Number of registered applications
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    /// Whether the directory is empty
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Total lookups served, cached or not
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        // Arrange
        let dir = AppDirectory::new();
        dir.register(AppId::new("app1"), AppOpts::new("App One"));

        // Act
        let opts = dir.get_app_opts(&AppId::new("app1")).unwrap();

        // Assert
        assert_eq!(opts.name, "App One");
        assert_eq!(dir.lookup_count(), 1);
    }

    #[test]
    fn test_unknown_app_rejected() {
        let dir = AppDirectory::new();
        let err = dir.get_app_opts(&AppId::new("ghost")).unwrap_err();
        assert!(matches!(err, RouterError::UnknownSipApp(_)));
    }

    #[test]
    fn test_reregistration_replaces_options() {
        let dir = AppDirectory::new();
        let app = AppId::new("app1");
        dir.register(app.clone(), AppOpts::new("v1"));
        dir.register(app.clone(), AppOpts::new("v2").with_max_calls(7));

        let opts = dir.get_app_opts(&app).unwrap();
        assert_eq!(opts.name, "v2");
        assert_eq!(opts.max_calls, Some(7));
    }
}
