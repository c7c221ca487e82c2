//! Transaction state, definitions and the explicit call-chain context.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

use crate::core::{Event, TransactionId};
use crate::dispatch::EventDispatcher;
use crate::pointcut::infer_read_only;
use crate::scope::ResourceProvider;

/// Isolation level requested from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Whatever the store uses when nothing is requested.
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, or `None` for the store default.
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::ReadUncommitted => Some("READ UNCOMMITTED"),
            Self::ReadCommitted => Some("READ COMMITTED"),
            Self::RepeatableRead => Some("REPEATABLE READ"),
            Self::Serializable => Some("SERIALIZABLE"),
        }
    }
}

/// Propagation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    /// Join the transaction already bound to the call chain, or start one.
    #[default]
    Required,
}

/// How a transaction should be started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDefinition {
    pub name: String,
    pub isolation: IsolationLevel,
    pub propagation: Propagation,
    pub read_only: bool,
}

impl TransactionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            isolation: IsolationLevel::Default,
            propagation: Propagation::Required,
            read_only: false,
        }
    }

    /// Definition for a method, inferring read-only from its name unless
    /// `explicit_read_only` is given.
    pub fn for_method(method: &str, explicit_read_only: Option<bool>) -> Self {
        Self::new(method).read_only(explicit_read_only.unwrap_or_else(|| infer_read_only(method)))
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransactionState {
    Pending,
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(label)
    }
}

/// A single transaction owned by the interceptor invocation that created it.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    definition: TransactionDefinition,
    started_at: DateTime<Utc>,
    state: Mutex<TransactionState>,
}

impl Transaction {
    pub(crate) fn new(definition: TransactionDefinition) -> Self {
        Self {
            id: TransactionId::new(),
            definition,
            started_at: Utc::now(),
            state: Mutex::new(TransactionState::Pending),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn definition(&self) -> &TransactionDefinition {
        &self.definition
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    pub(crate) fn activate(&self) {
        self.transition(TransactionState::Pending, TransactionState::Active);
    }

    pub(crate) fn mark_committed(&self) {
        self.transition(TransactionState::Active, TransactionState::Committed);
    }

    pub(crate) fn mark_rolled_back(&self) {
        self.transition(TransactionState::Active, TransactionState::RolledBack);
    }

    // Terminal states are sticky; a transition from the wrong state is ignored.
    fn transition(&self, from: TransactionState, to: TransactionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
        } else {
            let current = *state;
            warn!(tx_id = %self.id, %current, requested = %to, "ignored transaction state change");
        }
    }
}

/// The store behind the interceptor.
///
/// Resources come from the [`ResourceProvider`] half; `begin`, `commit` and
/// `rollback` operate on one acquired resource.
#[async_trait]
pub trait TransactionManager: ResourceProvider {
    /// Start a transaction on `resource`, applying isolation and read-only.
    async fn begin(
        &self,
        resource: &Self::Resource,
        definition: &TransactionDefinition,
    ) -> anyhow::Result<()>;

    async fn commit(&self, resource: &Self::Resource) -> anyhow::Result<()>;

    async fn rollback(&self, resource: &Self::Resource) -> anyhow::Result<()>;
}

/// The call chain's view of the current transaction.
///
/// Passed explicitly to every service and data accessor call. A root context
/// carries nothing; the interceptor hands a bound context to the call it
/// wraps, and nested interceptors join whatever that context carries.
pub struct TxContext<R, Ev> {
    current: Option<Arc<Bound<R, Ev>>>,
}

struct Bound<R, Ev> {
    transaction: Arc<Transaction>,
    resource: R,
    dispatcher: Arc<EventDispatcher<Ev>>,
}

impl<R, Ev> TxContext<R, Ev> {
    /// A context with no transaction.
    pub fn root() -> Self {
        Self { current: None }
    }

    pub(crate) fn bound(
        transaction: Arc<Transaction>,
        resource: R,
        dispatcher: Arc<EventDispatcher<Ev>>,
    ) -> Self {
        Self {
            current: Some(Arc::new(Bound {
                transaction,
                resource,
                dispatcher,
            })),
        }
    }

    /// The active transaction, if any.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.current
            .as_deref()
            .map(|bound| bound.transaction.as_ref())
            .filter(|tx| tx.is_active())
    }

    pub fn is_active(&self) -> bool {
        self.transaction().is_some()
    }

    /// The resource the active transaction runs on.
    pub fn resource(&self) -> Option<&R> {
        self.current
            .as_deref()
            .filter(|bound| bound.transaction.is_active())
            .map(|bound| &bound.resource)
    }
}

impl<R, Ev: Event> TxContext<R, Ev> {
    /// Raise an event for delivery after the current transaction commits.
    ///
    /// Returns `false` when no transaction is active; the event is dropped.
    pub fn publish(&self, event: Ev) -> bool {
        match self.current.as_deref() {
            Some(bound) if bound.transaction.is_active() => {
                bound.dispatcher.record(bound.transaction.id(), event);
                true
            }
            _ => {
                warn!(?event, "event published outside an active transaction, dropped");
                false
            }
        }
    }
}

impl<R, Ev> Clone for TxContext<R, Ev> {
    fn clone(&self) -> Self {
        Self {
            current: self.current.clone(),
        }
    }
}

impl<R, Ev> Default for TxContext<R, Ev> {
    fn default() -> Self {
        Self::root()
    }
}

impl<R, Ev> fmt::Debug for TxContext<R, Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxContext")
            .field("transaction", &self.current.as_ref().map(|b| b.transaction.id()))
            .finish()
    }
}
