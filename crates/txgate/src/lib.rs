//! # Txgate
//!
//! Declarative transactions for service calls, with side-effect events held
//! back until the transaction that raised them commits.
//!
//! ## Core Concepts
//!
//! - A [`Pointcut`] decides which `(service type, method)` pairs are
//!   transactional.
//! - A [`Proxied`] wrapper routes each call either straight to its target or
//!   through the [`TransactionInterceptor`].
//! - The interceptor acquires a resource from the [`TransactionManager`],
//!   begins, runs the call with a bound [`TxContext`], and commits or rolls
//!   back.
//! - Events published on the context wait in the [`EventDispatcher`] until
//!   commit and are then delivered by a fixed pool of workers.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!   │  Proxied::call(ctx, "upgrade_levels", ..)
//!   ▼
//! Pointcut::matches? ── no ──► target method (ctx unchanged)
//!   │ yes
//!   ▼
//! TransactionInterceptor
//!   │  ctx already bound? ── yes ──► target method (joins)
//!   │
//!   ├─ ResourceScope::lease ─ acquire ─ begin ┐
//!   │                                        ▼
//!   │                          target method (bound ctx)
//!   │                                 │ ctx.publish(ev)
//!   │                                 ▼
//!   │                      EventDispatcher pending[tx]
//!   │                                        │
//!   ├─ Ok  ─► commit ─► release ─► on_commit ─► queue ─► workers ─► EventSink
//!   └─ Err ─► rollback ─► on_rollback (discard) ─► release
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One transaction per outermost call** - nested transactional calls join
//! 2. **Every acquired resource is released** - on success, error, panic and cancellation
//! 3. **Errors are never swallowed** - the caller sees the original error
//! 4. **No event escapes a rollback** - delivery happens only after commit
//! 5. **Wrapping is idempotent** - a proxy of a proxy still opens one transaction
//!
//! ## Guarantees
//!
//! - **After-commit delivery**: events are handed to the sink after the store
//!   reported a successful commit
//! - **Best effort**: sink failures are logged, not retried
//! - **Bounded**: the worker pool and queue are fixed size; a full queue
//!   makes committing callers wait
//!
//! ## Example
//!
//! ```ignore
//! use txgate_core::{TxConfig, TxContext, TxGateBuilder};
//!
//! let gate = TxGateBuilder::new(data_source)
//!     .with_config(TxConfig::load(None)?)
//!     .with_sink(mail_sink)
//!     .build()?;
//!
//! let users = gate.wrap(UserServiceImpl::new(dao));
//! users.upgrade_levels(&TxContext::root()).await?;
//!
//! gate.shutdown().await;
//! ```

mod config;
mod core;
mod dispatch;
mod error;
mod gate;
mod interceptor;
mod pointcut;
mod proxy;
mod scope;
mod transaction;

// Re-export core types
pub use crate::core::{simple_type_name, Event, Invocation, TransactionId};

// Re-export configuration
pub use config::{TxConfig, ENV_PREFIX};

// Re-export error types
pub use crate::error::{TxError, TxResult};

// Re-export pointcut types
pub use pointcut::{
    infer_read_only, MethodMatcher, Pointcut, PointcutRule, PointcutRuleConfig,
    READ_ONLY_PREFIXES,
};

// Re-export transaction types
pub use transaction::{
    IsolationLevel, Propagation, Transaction, TransactionDefinition, TransactionManager,
    TransactionState, TxContext,
};

// Re-export scope types
pub use scope::{Lease, ResourceProvider, ResourceScope};

// Re-export dispatcher types
pub use dispatch::{DispatchSettings, DispatchStats, DispatchTask, EventDispatcher, EventSink};

// Re-export interceptor types
pub use interceptor::{RollbackRules, TransactionInterceptor};

// Re-export proxy types
pub use proxy::{Proxied, ProxyFactory, ServiceDescriptor};

// Re-export gate types (primary entry point)
pub use gate::{NoOpSink, TxGate, TxGateBuilder};

// Re-export commonly used external types
pub use async_trait::async_trait;
