//! Wiring: config + transaction manager + sink → ready-to-use proxy factory.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::config::TxConfig;
use crate::core::Event;
use crate::dispatch::{DispatchStats, EventDispatcher, EventSink};
use crate::error::{TxError, TxResult};
use crate::interceptor::TransactionInterceptor;
use crate::pointcut::MethodMatcher;
use crate::proxy::{Proxied, ProxyFactory, ServiceDescriptor};
use crate::transaction::TransactionManager;

/// Sink that accepts and drops every event.
pub struct NoOpSink<Ev>(PhantomData<fn(Ev)>);

impl<Ev> Default for NoOpSink<Ev> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<Ev: Event> EventSink<Ev> for NoOpSink<Ev> {
    async fn deliver(&self, event: Ev) -> anyhow::Result<()> {
        debug!(?event, "no sink configured, event dropped");
        Ok(())
    }
}

/// Builder for a [`TxGate`].
///
/// ```ignore
/// let gate = TxGateBuilder::new(Arc::new(data_source))
///     .with_config(TxConfig::load(Some("txgate.json"))?)
///     .with_sink(Arc::new(MailSink::new(mailer)))
///     .build()?;
///
/// let users = gate.wrap(UserServiceImpl::new(dao));
/// ```
pub struct TxGateBuilder<M, Ev> {
    manager: Arc<M>,
    config: TxConfig,
    matcher: Option<Arc<dyn MethodMatcher>>,
    sink: Option<Arc<dyn EventSink<Ev>>>,
}

impl<M, Ev> TxGateBuilder<M, Ev>
where
    M: TransactionManager,
    Ev: Event,
{
    pub fn new(manager: Arc<M>) -> Self {
        Self {
            manager,
            config: TxConfig::default(),
            matcher: None,
            sink: None,
        }
    }

    pub fn with_config(mut self, config: TxConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the configured pointcut rules with a custom strategy.
    pub fn with_matcher(mut self, matcher: Arc<dyn MethodMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink<Ev>>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration and start the dispatch workers.
    ///
    /// Fails with [`TxError::Config`] outside a tokio runtime.
    pub fn build(self) -> TxResult<TxGate<M, Ev>> {
        if Handle::try_current().is_err() {
            return Err(TxError::config(
                "the transaction gate must be built inside a tokio runtime",
            ));
        }
        self.config.validate()?;
        let matcher = match self.matcher {
            Some(matcher) => matcher,
            None => Arc::new(self.config.pointcut()?),
        };
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(NoOpSink::<Ev>::default()));

        let dispatcher = EventDispatcher::start(sink, self.config.dispatch_settings());
        let interceptor = Arc::new(
            TransactionInterceptor::new(self.manager, Arc::clone(&dispatcher))
                .with_isolation(self.config.isolation_level),
        );
        let factory = ProxyFactory::new(matcher, Arc::clone(&interceptor));

        info!(
            isolation = ?self.config.isolation_level,
            rules = self.config.pointcut_rules.len(),
            "transaction gate ready"
        );

        Ok(TxGate {
            factory,
            interceptor,
            dispatcher,
            config: self.config,
        })
    }
}

/// A running transaction gate.
pub struct TxGate<M: TransactionManager, Ev> {
    factory: ProxyFactory<M, Ev>,
    interceptor: Arc<TransactionInterceptor<M, Ev>>,
    dispatcher: Arc<EventDispatcher<Ev>>,
    config: TxConfig,
}

impl<M, Ev> TxGate<M, Ev>
where
    M: TransactionManager,
    Ev: Event,
{
    pub fn wrap<T: ServiceDescriptor>(&self, target: T) -> Proxied<T, M, Ev> {
        self.factory.wrap(target)
    }

    pub fn factory(&self) -> &ProxyFactory<M, Ev> {
        &self.factory
    }

    pub fn interceptor(&self) -> &Arc<TransactionInterceptor<M, Ev>> {
        &self.interceptor
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher<Ev>> {
        &self.dispatcher
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Drain queued events (bounded by the configured timeout) and stop the
    /// workers.
    pub async fn shutdown(&self) -> bool {
        self.dispatcher.shutdown().await
    }
}
