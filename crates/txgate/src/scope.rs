//! Resource-scoped execution: acquire, use, always release.

use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{error, trace, warn};

use crate::error::TxError;
use crate::transaction::TxContext;

/// Hands out unit-of-work resources (connections, sessions, handles).
///
/// Resources are cheap clonable handles; the scope keeps one clone to release
/// after the work is done.
#[async_trait]
pub trait ResourceProvider: Send + Sync + 'static {
    type Resource: Clone + Send + Sync + 'static;

    async fn acquire(&self) -> anyhow::Result<Self::Resource>;

    async fn release(&self, resource: Self::Resource) -> anyhow::Result<()>;
}

/// An acquired resource that goes back to its provider exactly once.
///
/// [`release`](Self::release) returns it in place. A lease dropped without
/// being released, for example because the future holding it was cancelled,
/// hands the release to a background task on the current runtime.
pub struct Lease<P: ResourceProvider> {
    provider: Arc<P>,
    resource: P::Resource,
    released: bool,
}

impl<P: ResourceProvider> Lease<P> {
    pub fn resource(&self) -> &P::Resource {
        &self.resource
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Return the resource now. Later calls are no-ops.
    pub async fn release(&mut self) -> anyhow::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.provider.release(self.resource.clone()).await
    }

    /// Take over the release duty, leaving the lease inert.
    pub(crate) fn detach(&mut self) -> Option<(Arc<P>, P::Resource)> {
        if self.released {
            return None;
        }
        self.released = true;
        Some((Arc::clone(&self.provider), self.resource.clone()))
    }
}

impl<P: ResourceProvider> Drop for Lease<P> {
    fn drop(&mut self) {
        let Some((provider, resource)) = self.detach() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                warn!("lease dropped before release, releasing in the background");
                handle.spawn(async move {
                    if let Err(e) = provider.release(resource).await {
                        error!(error = %e, "background resource release failed");
                    }
                });
            }
            Err(_) => error!("lease dropped outside a runtime, resource not released"),
        }
    }
}

/// Runs work against exactly one acquired resource and releases it on every
/// exit path: success, error, panic, or cancellation.
pub struct ResourceScope<P> {
    provider: Arc<P>,
}

impl<P: ResourceProvider> ResourceScope<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Acquire one resource under a [`Lease`].
    pub async fn lease(&self) -> Result<Lease<P>, TxError> {
        let resource = self
            .provider
            .acquire()
            .await
            .map_err(TxError::ResourceAcquisition)?;
        trace!("resource acquired");
        Ok(Lease {
            provider: Arc::clone(&self.provider),
            resource,
            released: false,
        })
    }

    /// Acquire a resource, run `work` with it, release it.
    ///
    /// A release failure is logged and never replaces the outcome of `work`.
    /// A panic in `work` is resumed after the resource has been released.
    pub async fn run<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(P::Resource) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TxError>,
    {
        let mut lease = self.lease().await.map_err(E::from)?;

        let outcome = AssertUnwindSafe(work(lease.resource().clone()))
            .catch_unwind()
            .await;

        if let Err(e) = lease.release().await {
            match &outcome {
                Ok(Ok(_)) => error!(error = %e, "resource release failed after successful work"),
                Ok(Err(_)) => error!(error = %e, "resource release failed; reporting the work failure"),
                Err(_) => error!(error = %e, "resource release failed while unwinding"),
            }
        } else {
            trace!("resource released");
        }

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Like [`run`](Self::run), but reuses the resource of the transaction
    /// bound to `ctx` when there is one.
    pub async fn run_in<Ev, T, E, F, Fut>(
        &self,
        ctx: &TxContext<P::Resource, Ev>,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(P::Resource) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TxError>,
    {
        match ctx.resource() {
            Some(resource) => work(resource.clone()).await,
            None => self.run(work).await,
        }
    }
}

impl<P> Clone for ResourceScope<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
        }
    }
}
