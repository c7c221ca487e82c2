//! Testing utilities for txgate.
//!
//! - [`MemoryDataSource`]: an in-memory transactional store with counters and
//!   failure injection.
//! - The user level fixture domain ([`User`], [`MemoryUserDao`],
//!   [`DefaultUserService`]) and its transactional decorator.
//! - [`RecordingSink`] and [`FailingSink`] for event assertions.
//! - [`eventually`] for waiting on asynchronous delivery.
//!
//! ```ignore
//! let fixture = UserFixture::new()?;
//! fixture.seed(&users).await?;
//!
//! fixture.service.upgrade_levels(&UserCtx::root()).await?;
//!
//! assert!(eventually(Duration::from_secs(1), || fixture.sink.len() == 3).await);
//! ```

mod memory;
mod sinks;
mod users;

use std::sync::Arc;
use std::time::Duration;
use txgate_core::{Proxied, TxConfig, TxGate, TxGateBuilder, TxResult};

pub use memory::{DataSourceStats, MemoryConnection, MemoryDataSource};
pub use sinks::{FailingSink, RecordingSink};
pub use users::{
    DefaultUserService, MemoryUserDao, User, UserCtx, UserDao, UserEvent, UserLevel, UserService,
    MIN_LOGIN_FOR_SILVER, MIN_RECOMMEND_FOR_GOLD,
};

/// Poll `condition` every 10ms until it holds or `timeout` passes.
///
/// Returns whether the condition was observed.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub type ProxiedUserService =
    Proxied<DefaultUserService<MemoryUserDao>, MemoryDataSource, UserEvent>;

/// The user domain wired through a gate over an in-memory store.
pub struct UserFixture {
    pub source: Arc<MemoryDataSource>,
    pub dao: Arc<MemoryUserDao>,
    pub sink: Arc<RecordingSink<UserEvent>>,
    pub gate: TxGate<MemoryDataSource, UserEvent>,
    pub service: ProxiedUserService,
}

impl UserFixture {
    /// Default configuration. Must be called inside a tokio runtime.
    pub fn new() -> TxResult<Self> {
        Self::with_config(TxConfig::default())
    }

    pub fn with_config(config: TxConfig) -> TxResult<Self> {
        let source = Arc::new(MemoryDataSource::new());
        let dao = Arc::new(MemoryUserDao::new(Arc::clone(&source)));
        let sink = Arc::new(RecordingSink::<UserEvent>::new());
        let gate = TxGateBuilder::<_, UserEvent>::new(Arc::clone(&source))
            .with_config(config)
            .with_sink(sink.clone())
            .build()?;
        let service = gate.wrap(DefaultUserService::new(Arc::clone(&dao)));

        Ok(Self {
            source,
            dao,
            sink,
            gate,
            service,
        })
    }

    /// Insert users directly, outside any transaction.
    pub async fn seed(&self, users: &[User]) -> anyhow::Result<()> {
        let ctx = UserCtx::root();
        for user in users {
            self.dao.add(&ctx, user).await?;
        }
        Ok(())
    }

    /// Read a user's committed state.
    pub async fn stored(&self, id: &str) -> anyhow::Result<Option<User>> {
        self.dao.get(&UserCtx::root(), id).await
    }
}
