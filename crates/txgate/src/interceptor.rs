//! The transaction interceptor: begin, call, commit or roll back.

use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::core::{Event, Invocation, TransactionId};
use crate::dispatch::EventDispatcher;
use crate::error::TxError;
use crate::scope::{Lease, ResourceProvider, ResourceScope};
use crate::transaction::{
    IsolationLevel, Transaction, TransactionDefinition, TransactionManager, TransactionState,
    TxContext,
};

/// Decides which errors from a wrapped call roll the transaction back.
///
/// The default rolls back on every error. Errors matched by
/// [`no_rollback_for`](Self::no_rollback_for) commit the work done so far and
/// are still returned to the caller unchanged.
pub struct RollbackRules<E> {
    exemptions: Vec<Box<dyn Fn(&E) -> bool + Send + Sync>>,
}

impl<E> RollbackRules<E> {
    pub fn rollback_on_any() -> Self {
        Self {
            exemptions: Vec::new(),
        }
    }

    pub fn no_rollback_for(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.exemptions.push(Box::new(predicate));
        self
    }

    pub fn rolls_back(&self, error: &E) -> bool {
        !self.exemptions.iter().any(|exempt| exempt(error))
    }
}

impl<E> Default for RollbackRules<E> {
    fn default() -> Self {
        Self::rollback_on_any()
    }
}

/// Wraps calls in a transaction obtained from a [`TransactionManager`].
///
/// Only the interceptor invocation that begins a transaction commits or rolls
/// it back. An invocation that finds an active transaction in its context
/// joins it and leaves the outcome to the outermost one.
pub struct TransactionInterceptor<M: TransactionManager, Ev> {
    scope: ResourceScope<M>,
    dispatcher: Arc<EventDispatcher<Ev>>,
    isolation: IsolationLevel,
}

impl<M, Ev> TransactionInterceptor<M, Ev>
where
    M: TransactionManager,
    Ev: Event,
{
    pub fn new(manager: Arc<M>, dispatcher: Arc<EventDispatcher<Ev>>) -> Self {
        Self {
            scope: ResourceScope::new(manager),
            dispatcher,
            isolation: IsolationLevel::Default,
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn manager(&self) -> &Arc<M> {
        self.scope.provider()
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher<Ev>> {
        &self.dispatcher
    }

    /// Run `next` inside a transaction, rolling back on any error.
    pub async fn invoke<T, E, F, Fut>(
        &self,
        ctx: &TxContext<M::Resource, Ev>,
        invocation: &Invocation,
        read_only: bool,
        next: F,
    ) -> Result<T, E>
    where
        F: FnOnce(TxContext<M::Resource, Ev>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TxError> + fmt::Display,
    {
        self.invoke_with_rules(ctx, invocation, read_only, &RollbackRules::default(), next)
            .await
    }

    /// Run `next` inside a transaction, consulting `rules` on error.
    pub async fn invoke_with_rules<T, E, F, Fut>(
        &self,
        ctx: &TxContext<M::Resource, Ev>,
        invocation: &Invocation,
        read_only: bool,
        rules: &RollbackRules<E>,
        next: F,
    ) -> Result<T, E>
    where
        F: FnOnce(TxContext<M::Resource, Ev>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TxError> + fmt::Display,
    {
        if let Some(current) = ctx.transaction() {
            debug!(
                tx_id = %current.id(),
                method = invocation.method(),
                "joining active transaction"
            );
            return next(ctx.clone()).await;
        }

        let definition = TransactionDefinition::new(invocation.qualified_name())
            .isolation(self.isolation)
            .read_only(read_only);

        let mut lease = self.scope.lease().await.map_err(E::from)?;
        let resource = lease.resource().clone();
        let transaction = Arc::new(Transaction::new(definition));
        let tx_id = transaction.id();

        if let Err(source) = self.manager().begin(&resource, transaction.definition()).await {
            warn!(%tx_id, error = %source, "failed to begin transaction");
            release(&mut lease, tx_id).await;
            return Err(E::from(TxError::Begin { tx_id, source }));
        }
        transaction.activate();
        debug!(
            %tx_id,
            name = %transaction.definition().name,
            read_only,
            "transaction started"
        );

        let mut in_flight = InFlight {
            lease,
            transaction: Arc::clone(&transaction),
            dispatcher: Arc::clone(&self.dispatcher),
            phase: Phase::Active,
        };
        let bound = TxContext::bound(
            Arc::clone(&transaction),
            resource.clone(),
            Arc::clone(&self.dispatcher),
        );
        let outcome = AssertUnwindSafe(next(bound)).catch_unwind().await;

        let result = match outcome {
            Ok(Ok(value)) => match self.commit(&transaction, &resource).await {
                Ok(()) => Ok(value),
                Err(e) => Err(E::from(e)),
            },
            Ok(Err(err)) if !rules.rolls_back(&err) => {
                info!(%tx_id, error = %err, "error exempt from rollback, committing");
                if let Err(commit_err) = self.commit(&transaction, &resource).await {
                    error!(%tx_id, error = %commit_err, "commit after exempt error failed");
                }
                Err(err)
            }
            Ok(Err(err)) => {
                warn!(%tx_id, error = %err, "transactional call failed, rolling back");
                self.rollback(&transaction, &resource).await;
                Err(err)
            }
            Err(payload) => {
                error!(%tx_id, "transactional call panicked, rolling back");
                self.rollback(&transaction, &resource).await;
                in_flight.settle().await;
                panic::resume_unwind(payload)
            }
        };

        // The connection goes back before committed events wait for queue space.
        let committed = in_flight.settle().await;
        if committed {
            let submitted = self.dispatcher.on_commit(tx_id).await;
            info!(%tx_id, events = submitted, "transaction committed");
        }
        result
    }

    /// Run a closure in its own transaction without going through a pointcut.
    pub async fn execute<T, E, F, Fut>(
        &self,
        ctx: &TxContext<M::Resource, Ev>,
        name: &str,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(TxContext<M::Resource, Ev>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TxError> + fmt::Display,
    {
        let invocation = Invocation::new("programmatic", name).returning::<T>();
        self.invoke(ctx, &invocation, false, work).await
    }

    async fn commit(&self, transaction: &Transaction, resource: &M::Resource) -> Result<(), TxError> {
        let tx_id = transaction.id();
        match self.manager().commit(resource).await {
            Ok(()) => {
                transaction.mark_committed();
                Ok(())
            }
            Err(source) => {
                transaction.mark_rolled_back();
                if let Err(e) = self.manager().rollback(resource).await {
                    error!(%tx_id, error = %e, "rollback after failed commit also failed");
                }
                self.dispatcher.on_rollback(tx_id);
                warn!(%tx_id, error = %source, "commit failed, transaction rolled back");
                Err(TxError::Commit { tx_id, source })
            }
        }
    }

    async fn rollback(&self, transaction: &Transaction, resource: &M::Resource) {
        let tx_id = transaction.id();
        if let Err(e) = self.manager().rollback(resource).await {
            error!(%tx_id, error = %e, "rollback failed");
        }
        transaction.mark_rolled_back();
        let discarded = self.dispatcher.on_rollback(tx_id);
        info!(%tx_id, discarded, "transaction rolled back");
    }
}

async fn release<P: ResourceProvider>(lease: &mut Lease<P>, tx_id: TransactionId) {
    if let Err(e) = lease.release().await {
        error!(%tx_id, error = %e, "resource release failed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Settled,
}

/// A begun transaction whose outcome is not settled yet.
///
/// Dropped while still active (the caller's future was cancelled), it rolls
/// the transaction back: the state becomes RolledBack, buffered events are
/// discarded, and rollback then release run on a background task, in that
/// order.
struct InFlight<M: TransactionManager, Ev: Event> {
    lease: Lease<M>,
    transaction: Arc<Transaction>,
    dispatcher: Arc<EventDispatcher<Ev>>,
    phase: Phase,
}

impl<M: TransactionManager, Ev: Event> InFlight<M, Ev> {
    /// Release the resource. Returns whether the transaction committed.
    async fn settle(&mut self) -> bool {
        self.phase = Phase::Settled;
        release(&mut self.lease, self.transaction.id()).await;
        self.transaction.state() == TransactionState::Committed
    }
}

impl<M: TransactionManager, Ev: Event> Drop for InFlight<M, Ev> {
    fn drop(&mut self) {
        let tx_id = self.transaction.id();
        match self.phase {
            Phase::Settled => {
                // Cancelled while releasing after a commit: events still go out.
                if self.transaction.state() == TransactionState::Committed
                    && self.dispatcher.pending_for(tx_id) > 0
                {
                    if let Ok(handle) = Handle::try_current() {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        handle.spawn(async move {
                            dispatcher.on_commit(tx_id).await;
                        });
                    }
                }
                return;
            }
            Phase::Active => {}
        }

        if !self.transaction.state().is_terminal() {
            self.transaction.mark_rolled_back();
        }
        let discarded = self.dispatcher.on_rollback(tx_id);
        warn!(%tx_id, discarded, "transactional call dropped before completion, rolling back");

        let Some((manager, resource)) = self.lease.detach() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = manager.rollback(&resource).await {
                        error!(%tx_id, error = %e, "rollback of dropped transaction failed");
                    }
                    if let Err(e) = manager.release(resource).await {
                        error!(%tx_id, error = %e, "resource release failed");
                    }
                });
            }
            Err(_) => error!(%tx_id, "no runtime left to roll back dropped transaction"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchSettings, EventSink};
    use crate::scope::ResourceProvider;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedManager {
        begins: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        releases: AtomicUsize,
        fail_begin: AtomicBool,
        fail_commit: AtomicBool,
        definitions: Mutex<Vec<TransactionDefinition>>,
    }

    #[async_trait]
    impl ResourceProvider for ScriptedManager {
        type Resource = ();

        async fn acquire(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn release(&self, _resource: ()) -> anyhow::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl TransactionManager for ScriptedManager {
        async fn begin(&self, _resource: &(), definition: &TransactionDefinition) -> anyhow::Result<()> {
            if self.fail_begin.load(Ordering::SeqCst) {
                return Err(anyhow!("database is read-only"));
            }
            self.begins.fetch_add(1, Ordering::SeqCst);
            self.definitions.lock().unwrap().push(definition.clone());
            Ok(())
        }

        async fn commit(&self, _resource: &()) -> anyhow::Result<()> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(anyhow!("serialization failure"));
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&self, _resource: &()) -> anyhow::Result<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingSink {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl EventSink<String> for CountingSink {
        async fn deliver(&self, _event: String) -> anyhow::Result<()> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    type Ctx = TxContext<(), String>;

    fn settings(workers: usize, capacity: usize) -> DispatchSettings {
        DispatchSettings {
            worker_pool_size: workers,
            queue_capacity: capacity,
            drain_timeout: Duration::from_secs(1),
        }
    }

    fn interceptor() -> (
        Arc<ScriptedManager>,
        Arc<CountingSink>,
        TransactionInterceptor<ScriptedManager, String>,
    ) {
        let manager = Arc::new(ScriptedManager::default());
        let sink = Arc::new(CountingSink::default());
        let dispatcher = EventDispatcher::<String>::start(sink.clone(), settings(1, 8));
        let interceptor = TransactionInterceptor::new(manager.clone(), dispatcher)
            .with_isolation(IsolationLevel::ReadCommitted);
        (manager, sink, interceptor)
    }

    fn invocation(method: &str) -> Invocation {
        Invocation::new("OrderService", method)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_success_commits_once_and_flushes_events() {
        let (manager, sink, interceptor) = interceptor();

        let result: anyhow::Result<u32> = interceptor
            .invoke(&Ctx::root(), &invocation("save_order"), false, |ctx| async move {
                assert!(ctx.is_active());
                ctx.publish("order saved".to_string());
                Ok(7)
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(manager.begins.load(Ordering::SeqCst), 1);
        assert_eq!(manager.commits.load(Ordering::SeqCst), 1);
        assert_eq!(manager.rollbacks.load(Ordering::SeqCst), 0);
        assert_eq!(manager.releases.load(Ordering::SeqCst), 1);

        interceptor.dispatcher().shutdown().await;
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_rolls_back_and_returns_original_error() {
        let (manager, sink, interceptor) = interceptor();

        let result: anyhow::Result<()> = interceptor
            .invoke(&Ctx::root(), &invocation("save_order"), false, |ctx| async move {
                ctx.publish("never delivered".to_string());
                Err(anyhow!("duplicate key"))
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "duplicate key");
        assert_eq!(manager.commits.load(Ordering::SeqCst), 0);
        assert_eq!(manager.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(manager.releases.load(Ordering::SeqCst), 1);

        interceptor.dispatcher().shutdown().await;
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);
        assert_eq!(interceptor.dispatcher().stats().discarded, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nested_invocation_joins_outer_transaction() {
        let (manager, _sink, interceptor) = interceptor();

        let result: anyhow::Result<()> = interceptor
            .invoke(&Ctx::root(), &invocation("save_order"), false, |outer| {
                let interceptor = &interceptor;
                async move {
                    let outer_id = outer.transaction().map(|tx| tx.id());
                    interceptor
                        .invoke(&outer, &invocation("update_stock"), false, |inner| async move {
                            assert_eq!(inner.transaction().map(|tx| tx.id()), outer_id);
                            Ok::<(), anyhow::Error>(())
                        })
                        .await
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(manager.begins.load(Ordering::SeqCst), 1);
        assert_eq!(manager.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_commit_failure_is_reported_as_rollback() {
        let (manager, _sink, interceptor) = interceptor();
        manager.fail_commit.store(true, Ordering::SeqCst);

        let result: anyhow::Result<()> = interceptor
            .invoke(&Ctx::root(), &invocation("save_order"), false, |ctx| async move {
                ctx.publish("lost".to_string());
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TxError>(),
            Some(TxError::Commit { .. })
        ));
        assert_eq!(manager.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(interceptor.dispatcher().stats().discarded, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_begin_failure_opens_no_transaction() {
        let (manager, _sink, interceptor) = interceptor();
        manager.fail_begin.store(true, Ordering::SeqCst);
        let called = AtomicBool::new(false);

        let result: anyhow::Result<()> = interceptor
            .invoke(&Ctx::root(), &invocation("save_order"), false, |_| async {
                called.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(
            result.unwrap_err().downcast_ref::<TxError>(),
            Some(TxError::Begin { .. })
        ));
        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(manager.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_definition_carries_isolation_and_read_only() {
        let (manager, _sink, interceptor) = interceptor();

        let _: anyhow::Result<()> = interceptor
            .invoke(&Ctx::root(), &invocation("get_order"), true, |_| async { Ok(()) })
            .await;

        let definitions = manager.definitions.lock().unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name, "OrderService.get_order");
        assert_eq!(definitions[0].isolation, IsolationLevel::ReadCommitted);
        assert!(definitions[0].read_only);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exempt_error_commits_and_is_returned() {
        let (manager, _sink, interceptor) = interceptor();
        let rules = RollbackRules::<anyhow::Error>::rollback_on_any()
            .no_rollback_for(|e| e.to_string().starts_with("warning"));

        let result: anyhow::Result<()> = interceptor
            .invoke_with_rules(&Ctx::root(), &invocation("save_order"), false, &rules, |_| async {
                Err(anyhow!("warning: partial import"))
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "warning: partial import");
        assert_eq!(manager.commits.load(Ordering::SeqCst), 1);
        assert_eq!(manager.rollbacks.load(Ordering::SeqCst), 0);
    }

    async fn explode(_ctx: Ctx) -> anyhow::Result<()> {
        panic!("handler bug")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_rolls_back_and_resumes() {
        let (manager, _sink, interceptor) = interceptor();
        let interceptor = Arc::new(interceptor);

        let task = {
            let interceptor = Arc::clone(&interceptor);
            tokio::spawn(async move {
                let _ = interceptor
                    .invoke(&Ctx::root(), &invocation("save_order"), false, explode)
                    .await;
            })
        };

        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(manager.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(manager.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_runs_programmatic_block() {
        let (manager, _sink, interceptor) = interceptor();

        let value: anyhow::Result<&str> = interceptor
            .execute(&Ctx::root(), "nightly_batch", |ctx| async move {
                assert!(ctx.is_active());
                Ok("done")
            })
            .await;

        assert_eq!(value.unwrap(), "done");
        assert_eq!(manager.commits.load(Ordering::SeqCst), 1);
        let definitions = manager.definitions.lock().unwrap();
        assert_eq!(definitions[0].name, "programmatic.nightly_batch");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_call_rolls_back_and_releases() {
        let (manager, sink, interceptor) = interceptor();
        let seen: Arc<Mutex<Option<Ctx>>> = Arc::default();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            interceptor.invoke(&Ctx::root(), &invocation("save_order"), false, |ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    ctx.publish("never delivered".to_string());
                    *seen.lock().unwrap() = Some(ctx.clone());
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), anyhow::Error>(())
                }
            }),
        )
        .await;
        assert!(cancelled.is_err());

        let ctx = seen.lock().unwrap().take().unwrap();
        assert_eq!(
            ctx.transaction().map(|tx| tx.state()),
            Some(TransactionState::RolledBack)
        );
        assert_eq!(interceptor.dispatcher().pending_transactions(), 0);

        for _ in 0..50 {
            if manager.releases.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.commits.load(Ordering::SeqCst), 0);
        assert_eq!(manager.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(manager.releases.load(Ordering::SeqCst), 1);

        interceptor.dispatcher().shutdown().await;
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);
        assert_eq!(interceptor.dispatcher().stats().discarded, 1);
    }

    #[derive(Default)]
    struct GatedSink {
        gate: Notify,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl EventSink<String> for GatedSink {
        async fn deliver(&self, _event: String) -> anyhow::Result<()> {
            self.gate.notified().await;
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resource_released_before_waiting_for_queue_space() {
        let manager = Arc::new(ScriptedManager::default());
        let sink = Arc::new(GatedSink::default());
        let dispatcher = EventDispatcher::<String>::start(sink.clone(), settings(1, 1));
        let interceptor = Arc::new(TransactionInterceptor::new(manager.clone(), dispatcher));

        let call = {
            let interceptor = Arc::clone(&interceptor);
            tokio::spawn(async move {
                interceptor
                    .invoke(&Ctx::root(), &invocation("save_order"), false, |ctx| async move {
                        for i in 0..4 {
                            ctx.publish(format!("event-{i}"));
                        }
                        Ok::<(), anyhow::Error>(())
                    })
                    .await
            })
        };

        // One event in the worker, one queued, the caller waits on the third.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!call.is_finished());
        assert_eq!(manager.commits.load(Ordering::SeqCst), 1);
        assert_eq!(manager.releases.load(Ordering::SeqCst), 1);

        for _ in 0..4 {
            sink.gate.notify_one();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        call.await.unwrap().unwrap();
        assert!(interceptor.dispatcher().shutdown().await);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 4);
    }
}
