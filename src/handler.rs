//! User-supplied reconciliation logic.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::resource::{ObjectKey, ResourceObject};
use crate::BoxError;

/// Reconciles observed resources.
///
/// [`add`](Self::add) receives every observed state of an object (creation,
/// update and resync alike): it is a reconcile call, not a creation hook.
/// [`delete`](Self::delete) receives the key of an object that disappeared.
///
/// Both calls get the cancellation context derived from
/// [`Controller::run`](crate::Controller::run) and are expected to honor
/// it; the runtime never interrupts an in-flight call forcibly. Errors are
/// retried with backoff up to the controller's retry budget.
#[async_trait]
pub trait Handler<K: ResourceObject>: Send + Sync {
    /// Reconcile the current state of `obj`.
    async fn add(&self, ctx: &CancellationToken, obj: Arc<K>) -> Result<(), BoxError>;

    /// Reconcile the disappearance of the object identified by `key`.
    async fn delete(&self, ctx: &CancellationToken, key: &ObjectKey) -> Result<(), BoxError>;
}

/// [`Handler`] assembled from two closures.
///
/// ```
/// use controller_runtime::handler::HandlerFns;
/// use controller_runtime::testing::TestObject;
/// use controller_runtime::ResourceObject;
///
/// let handler = HandlerFns::<TestObject, _, _, _, _>::new(
///     |_ctx, obj| async move {
///         println!("reconcile {}", obj.object_key());
///         Ok(())
///     },
///     |_ctx, key| async move {
///         println!("gone: {key}");
///         Ok(())
///     },
/// );
/// # drop(handler);
/// ```
pub struct HandlerFns<K, A, FA, D, FD>
where
    K: ResourceObject,
    A: Fn(CancellationToken, Arc<K>) -> FA + Send + Sync,
    FA: Future<Output = Result<(), BoxError>> + Send,
    D: Fn(CancellationToken, ObjectKey) -> FD + Send + Sync,
    FD: Future<Output = Result<(), BoxError>> + Send,
{
    add: A,
    delete: D,
    // Ties the otherwise-unreferenced K/FA/FD parameters to the type.
    _marker: std::marker::PhantomData<fn() -> (K, FA, FD)>,
}

impl<K, A, FA, D, FD> HandlerFns<K, A, FA, D, FD>
where
    K: ResourceObject,
    A: Fn(CancellationToken, Arc<K>) -> FA + Send + Sync,
    FA: Future<Output = Result<(), BoxError>> + Send,
    D: Fn(CancellationToken, ObjectKey) -> FD + Send + Sync,
    FD: Future<Output = Result<(), BoxError>> + Send,
{
    /// Build a handler from an add and a delete closure.
    pub fn new(add: A, delete: D) -> Self {
        Self {
            add,
            delete,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<K, A, FA, D, FD> Handler<K> for HandlerFns<K, A, FA, D, FD>
where
    K: ResourceObject,
    A: Fn(CancellationToken, Arc<K>) -> FA + Send + Sync,
    FA: Future<Output = Result<(), BoxError>> + Send,
    D: Fn(CancellationToken, ObjectKey) -> FD + Send + Sync,
    FD: Future<Output = Result<(), BoxError>> + Send,
{
    async fn add(&self, ctx: &CancellationToken, obj: Arc<K>) -> Result<(), BoxError> {
        (self.add)(ctx.clone(), obj).await
    }

    async fn delete(&self, ctx: &CancellationToken, key: &ObjectKey) -> Result<(), BoxError> {
        (self.delete)(ctx.clone(), key.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestObject;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn handler_fns_dispatch_to_the_right_closure() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let adds = Arc::clone(&calls);
            let deletes = Arc::clone(&calls);
            HandlerFns::<TestObject, _, _, _, _>::new(
                move |_ctx, obj: Arc<TestObject>| {
                    let adds = Arc::clone(&adds);
                    async move {
                        adds.lock().push(format!("add:{}", obj.object_key()));
                        Ok(())
                    }
                },
                move |_ctx, key: ObjectKey| {
                    let deletes = Arc::clone(&deletes);
                    async move {
                        deletes.lock().push(format!("delete:{key}"));
                        Ok(())
                    }
                },
            )
        };

        let ctx = CancellationToken::new();
        let obj = Arc::new(TestObject::cluster_scoped("Thing", "a"));
        handler.add(&ctx, obj).await.unwrap();
        handler
            .delete(&ctx, &ObjectKey::cluster_scoped("b"))
            .await
            .unwrap();

        assert_eq!(*calls.lock(), ["add:a", "delete:b"]);
    }
}
