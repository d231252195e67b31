//! Handler registry: `(job type, supplier name)` → synchronization handler.
//!
//! Each supplier integration registers its handlers explicitly at startup.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::context::JobContext;
use crate::types::*;

/// A supplier/job-type specific synchronization.
///
/// Returning `Err` means the handler raised; an `Outcome::Error` is an
/// expected failure the handler already understood.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn run(
        &self,
        ctx: &JobContext,
        owner: &Owner,
        args: &ContinuationArgs,
    ) -> Result<Outcome>;
}

/// Adapts an async closure into a [`SyncHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> SyncHandler for FnHandler<F>
where
    F: Fn(JobContext, Owner, ContinuationArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome>> + Send + 'static,
{
    async fn run(
        &self,
        ctx: &JobContext,
        owner: &Owner,
        args: &ContinuationArgs,
    ) -> Result<Outcome> {
        (self.f)(ctx.clone(), owner.clone(), args.clone()).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler already registered for {0}")]
    Duplicate(DispatchKey),
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<DispatchKey, Arc<dyn SyncHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        job_type: JobType,
        supplier: SupplierName,
        handler: Arc<dyn SyncHandler>,
    ) -> Result<(), RegistryError> {
        let key = DispatchKey::new(job_type, supplier);
        if self.handlers.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        tracing::debug!(%key, "registered sync handler");
        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        job_type: JobType,
        supplier: SupplierName,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(JobContext, Owner, ContinuationArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        self.register(job_type, supplier, Arc::new(FnHandler::new(f)))
    }

    pub fn lookup(&self, key: &DispatchKey) -> Option<Arc<dyn SyncHandler>> {
        self.handlers.get(key).cloned()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<DispatchKey> {
        let mut keys: Vec<_> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn supplier_owner(name: &str) -> Owner {
        Owner::Supplier(Supplier {
            id: Uuid::now_v7(),
            name: SupplierName::new(name),
        })
    }

    #[tokio::test]
    async fn registered_closure_is_found_and_runs() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(
                JobType::new("metadata"),
                SupplierName::new("Kigo"),
                |_ctx, owner, _args| async move {
                    Ok::<_, anyhow::Error>(Outcome::success(serde_json::json!({
                        "supplier": owner.supplier().name.as_str()
                    })))
                },
            )
            .unwrap();

        let key = DispatchKey::new(JobType::new("metadata"), SupplierName::new("Kigo"));
        let handler = registry.lookup(&key).unwrap();
        let ctx = JobContext::new(Uuid::now_v7());
        let outcome = handler
            .run(&ctx, &supplier_owner("Kigo"), &ContinuationArgs::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::success(serde_json::json!({"supplier": "Kigo"}))
        );
    }

    #[test]
    fn lookup_miss_and_duplicate_registration() {
        let mut registry = HandlerRegistry::new();
        let noop = |_ctx: JobContext, _owner: Owner, _args: ContinuationArgs| async {
            Ok::<_, anyhow::Error>(Outcome::done())
        };
        registry
            .register_fn(JobType::new("availabilities"), SupplierName::new("Kigo"), noop)
            .unwrap();

        let miss = DispatchKey::new(JobType::new("metadata"), SupplierName::new("Kigo"));
        assert!(registry.lookup(&miss).is_none());

        let err = registry
            .register_fn(JobType::new("availabilities"), SupplierName::new("Kigo"), noop)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));
        assert_eq!(registry.len(), 1);
    }
}
