//! The work execution contract and registry.
//!
//! Both recurring task bodies and batch jobs resolve their behavior through
//! a named [`Work`] implementation. The core never interprets what a body
//! does; it only observes success or failure.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::WorkError;

/// A unit of executable work.
#[async_trait]
pub trait Work: Send + Sync {
    /// Stable name, used for task addressing and job lookup.
    fn name(&self) -> &str;

    /// Run the body once.
    async fn execute(&self) -> Result<(), WorkError>;
}

/// Boxed future returned by [`FnWork`] closures.
pub type WorkFuture = Pin<Box<dyn Future<Output = Result<(), WorkError>> + Send>>;

/// A [`Work`] built from a closure.
///
/// Keeps demo bodies and test recorders out of trait-impl boilerplate.
pub struct FnWork {
    name: String,
    body: Box<dyn Fn() -> WorkFuture + Send + Sync>,
}

impl FnWork {
    pub fn new(
        name: impl Into<String>,
        body: impl Fn() -> WorkFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }
}

#[async_trait]
impl Work for FnWork {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self) -> Result<(), WorkError> {
        (self.body)().await
    }
}

/// Registry of available work, keyed by name.
pub struct WorkRegistry {
    works: RwLock<HashMap<String, Arc<dyn Work>>>,
}

impl WorkRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            works: RwLock::new(HashMap::new()),
        }
    }

    /// Register a work implementation under its own name.
    pub async fn register(&self, work: Arc<dyn Work>) {
        let name = work.name().to_string();
        self.works.write().await.insert(name.clone(), work);
        tracing::debug!("Registered work: {}", name);
    }

    /// Unregister by name.
    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn Work>> {
        self.works.write().await.remove(name)
    }

    /// Look up a work implementation by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Work>> {
        self.works.read().await.get(name).cloned()
    }

    /// Check if a name is registered.
    pub async fn has(&self, name: &str) -> bool {
        self.works.read().await.contains_key(name)
    }

    /// List all registered names.
    pub async fn list(&self) -> Vec<String> {
        self.works.read().await.keys().cloned().collect()
    }

    /// Number of registered works.
    pub fn count(&self) -> usize {
        self.works.try_read().map(|w| w.len()).unwrap_or(0)
    }
}

impl Default for WorkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_work(name: &str) -> Arc<dyn Work> {
        Arc::new(FnWork::new(name, || Box::pin(async { Ok(()) })))
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = WorkRegistry::new();
        registry.register(ok_work("refresh")).await;

        assert!(registry.has("refresh").await);
        assert!(!registry.has("missing").await);

        let work = registry.get("refresh").await.unwrap();
        assert_eq!(work.name(), "refresh");
        work.execute().await.unwrap();
    }

    #[tokio::test]
    async fn list_and_count() {
        let registry = WorkRegistry::new();
        registry.register(ok_work("a")).await;
        registry.register(ok_work("b")).await;

        assert_eq!(registry.count(), 2);
        let names = registry.list().await;
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn unregister() {
        let registry = WorkRegistry::new();
        registry.register(ok_work("temp")).await;
        assert!(registry.has("temp").await);

        registry.unregister("temp").await;
        assert!(!registry.has("temp").await);
    }

    #[tokio::test]
    async fn fn_work_propagates_failure() {
        let work = FnWork::new("broken", || {
            Box::pin(async {
                Err(WorkError::ExecutionFailed {
                    name: "broken".to_string(),
                    reason: "no upstream".to_string(),
                })
            })
        });

        let err = work.execute().await.unwrap_err();
        assert!(matches!(err, WorkError::ExecutionFailed { .. }));
    }
}
