//! Named, remotely invocable operations exposed by a node.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::envelope::ErrorCode;
use crate::value::Value;

/// One invocation of a resource.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Name of the node that issued the call.
    pub source: String,
    pub args: Vec<Value>,
}

impl Invocation {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }
}

/// A callable exposed to remote nodes.
///
/// Returning `Err(code)` sends a failed `RETURN` carrying `code` back to the caller.
#[async_trait::async_trait]
pub trait Resource: Send + Sync + 'static {
    async fn invoke(&self, invocation: Invocation) -> Result<Value, ErrorCode>;
}

struct FnResource<F>(F);

#[async_trait::async_trait]
impl<F> Resource for FnResource<F>
where
    F: Fn(Invocation) -> BoxFuture<'static, Result<Value, ErrorCode>> + Send + Sync + 'static,
{
    async fn invoke(&self, invocation: Invocation) -> Result<Value, ErrorCode> {
        (self.0)(invocation).await
    }
}

/// Lookup table from resource name to callable.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    resources: Arc<RwLock<HashMap<String, Arc<dyn Resource>>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `resource` under `name`, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, resource: impl Resource) {
        let name = name.into();
        tracing::debug!(resource=%name, "Registered resource");
        self.resources.write().insert(name, Arc::new(resource));
    }

    /// Register an async closure as a resource.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorCode>> + Send + 'static,
    {
        self.register(
            name,
            FnResource(move |invocation| -> BoxFuture<'static, Result<Value, ErrorCode>> {
                Box::pin(f(invocation))
            }),
        );
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.resources.write().remove(name).is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Resource>> {
        self.resources.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_invoke_closure() {
        let registry = ResourceRegistry::new();
        registry.register_fn("echo", |inv: Invocation| async move {
            Ok(inv.arg(0).cloned().unwrap_or_default())
        });

        let echo = registry.lookup("echo").expect("registered");
        let result = echo
            .invoke(Invocation {
                source: "A".into(),
                args: vec!["hi".into()],
            })
            .await;
        assert_eq!(result, Ok(Value::from("hi")));
    }

    #[test]
    fn test_unregister() {
        let registry = ResourceRegistry::new();
        registry.register_fn("noop", |_| async { Ok(Value::Null) });
        assert!(registry.unregister("noop"));
        assert!(registry.lookup("noop").is_none());
        assert!(!registry.unregister("noop"));
    }
}
