//! User level fixture domain.
//!
//! Users climb BASIC → SILVER → GOLD. A BASIC user with at least
//! [`MIN_LOGIN_FOR_SILVER`] logins moves to SILVER; a SILVER user with at
//! least [`MIN_RECOMMEND_FOR_GOLD`] recommendations moves to GOLD. Every
//! upgrade raises [`UserEvent::LevelUpgraded`].

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};
use txgate_core::{Proxied, ResourceScope, ServiceDescriptor, TxContext};

use crate::memory::{MemoryConnection, MemoryDataSource};

pub const MIN_LOGIN_FOR_SILVER: u32 = 50;
pub const MIN_RECOMMEND_FOR_GOLD: u32 = 30;

const USERS: &str = "users";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserLevel {
    Basic,
    Silver,
    Gold,
}

impl UserLevel {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Basic => Some(Self::Silver),
            Self::Silver => Some(Self::Gold),
            Self::Gold => None,
        }
    }
}

impl fmt::Display for UserLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Basic => "BASIC",
            Self::Silver => "SILVER",
            Self::Gold => "GOLD",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub level: UserLevel,
    pub login: u32,
    pub recommend: u32,
}

impl User {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        level: UserLevel,
        login: u32,
        recommend: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            level,
            login,
            recommend,
        }
    }

    pub fn can_upgrade(&self) -> bool {
        match self.level {
            UserLevel::Basic => self.login >= MIN_LOGIN_FOR_SILVER,
            UserLevel::Silver => self.recommend >= MIN_RECOMMEND_FOR_GOLD,
            UserLevel::Gold => false,
        }
    }

    pub fn upgrade_level(&mut self) -> Result<()> {
        match self.level.next() {
            Some(next) => {
                self.level = next;
                Ok(())
            }
            None => bail!("user {} is already at {}", self.id, self.level),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    LevelUpgraded { user: User },
}

/// Context type for everything in this fixture.
pub type UserCtx = TxContext<MemoryConnection, UserEvent>;

/// Data accessor for users. Every call takes the caller's context and runs on
/// the transaction's connection when one is bound.
#[async_trait]
pub trait UserDao: Send + Sync {
    async fn add(&self, ctx: &UserCtx, user: &User) -> Result<()>;
    async fn update(&self, ctx: &UserCtx, user: &User) -> Result<()>;
    async fn get(&self, ctx: &UserCtx, id: &str) -> Result<Option<User>>;
    async fn get_all(&self, ctx: &UserCtx) -> Result<Vec<User>>;
    async fn delete_all(&self, ctx: &UserCtx) -> Result<usize>;
}

/// [`UserDao`] over a [`MemoryDataSource`].
pub struct MemoryUserDao {
    scope: ResourceScope<MemoryDataSource>,
    updates: AtomicUsize,
    update_calls: AtomicUsize,
    fail_on_update: Mutex<Option<usize>>,
}

impl MemoryUserDao {
    pub fn new(source: Arc<MemoryDataSource>) -> Self {
        Self {
            scope: ResourceScope::new(source),
            updates: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            fail_on_update: Mutex::new(None),
        }
    }

    /// Make the `nth` call to `update` (1-based, counted from now) fail
    /// before writing.
    pub fn fail_on_update(&self, nth: usize) {
        self.update_calls.store(0, Ordering::SeqCst);
        *self
            .fail_on_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(nth);
    }

    /// Updates that reached the store.
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        let call = self.update_calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self
            .fail_on_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Some(call)
    }
}

fn decode(row: serde_json::Value) -> Result<User> {
    serde_json::from_value(row).map_err(|e| anyhow!("corrupt user row: {e}"))
}

#[async_trait]
impl UserDao for MemoryUserDao {
    async fn add(&self, ctx: &UserCtx, user: &User) -> Result<()> {
        let row = serde_json::to_value(user)?;
        self.scope
            .run_in(ctx, |conn| async move { conn.insert(USERS, &user.id, row) })
            .await
    }

    async fn update(&self, ctx: &UserCtx, user: &User) -> Result<()> {
        if self.should_fail() {
            bail!("injected failure updating user {}", user.id);
        }
        let row = serde_json::to_value(user)?;
        self.scope
            .run_in(ctx, |conn| async move {
                if conn.get(USERS, &user.id).is_none() {
                    bail!("no user with id {}", user.id);
                }
                conn.put(USERS, &user.id, row)
            })
            .await?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, ctx: &UserCtx, id: &str) -> Result<Option<User>> {
        self.scope
            .run_in(ctx, |conn| async move { conn.get(USERS, id).map(decode).transpose() })
            .await
    }

    async fn get_all(&self, ctx: &UserCtx) -> Result<Vec<User>> {
        self.scope
            .run_in(ctx, |conn| async move {
                conn.all(USERS).into_iter().map(decode).collect::<Result<Vec<_>>>()
            })
            .await
    }

    async fn delete_all(&self, ctx: &UserCtx) -> Result<usize> {
        self.scope
            .run_in(ctx, |conn| async move { conn.clear(USERS) })
            .await
    }
}

/// User operations. Implemented by [`DefaultUserService`] and, as a
/// decorator, by its [`Proxied`] wrapper.
#[async_trait]
pub trait UserService: Send + Sync {
    async fn add(&self, ctx: &UserCtx, user: User) -> Result<()>;
    async fn save_users(&self, ctx: &UserCtx, users: Vec<User>) -> Result<()>;
    /// Upgrade every eligible user. Returns how many were upgraded.
    async fn upgrade_levels(&self, ctx: &UserCtx) -> Result<usize>;
    async fn get_user(&self, ctx: &UserCtx, id: String) -> Result<Option<User>>;
    async fn get_all(&self, ctx: &UserCtx) -> Result<Vec<User>>;
    async fn delete_all(&self, ctx: &UserCtx) -> Result<usize>;
}

pub struct DefaultUserService<D> {
    dao: Arc<D>,
}

impl<D: UserDao> DefaultUserService<D> {
    pub fn new(dao: Arc<D>) -> Self {
        Self { dao }
    }

    pub fn dao(&self) -> &Arc<D> {
        &self.dao
    }
}

impl<D> ServiceDescriptor for DefaultUserService<D> {
    fn type_name(&self) -> &str {
        "DefaultUserService"
    }

    fn method_names(&self) -> &[&'static str] {
        &[
            "add",
            "save_users",
            "upgrade_levels",
            "get_user",
            "get_all",
            "delete_all",
        ]
    }
}

#[async_trait]
impl<D: UserDao> UserService for DefaultUserService<D> {
    async fn add(&self, ctx: &UserCtx, user: User) -> Result<()> {
        self.dao.add(ctx, &user).await
    }

    async fn save_users(&self, ctx: &UserCtx, users: Vec<User>) -> Result<()> {
        for user in &users {
            self.dao.add(ctx, user).await?;
        }
        debug!(count = users.len(), "users saved");
        Ok(())
    }

    async fn upgrade_levels(&self, ctx: &UserCtx) -> Result<usize> {
        let mut upgraded = 0;
        for mut user in self.dao.get_all(ctx).await? {
            if !user.can_upgrade() {
                continue;
            }
            user.upgrade_level()?;
            self.dao.update(ctx, &user).await?;
            info!(user = %user.id, level = %user.level, "user level upgraded");
            ctx.publish(UserEvent::LevelUpgraded { user });
            upgraded += 1;
        }
        Ok(upgraded)
    }

    async fn get_user(&self, ctx: &UserCtx, id: String) -> Result<Option<User>> {
        self.dao.get(ctx, &id).await
    }

    async fn get_all(&self, ctx: &UserCtx) -> Result<Vec<User>> {
        self.dao.get_all(ctx).await
    }

    async fn delete_all(&self, ctx: &UserCtx) -> Result<usize> {
        self.dao.delete_all(ctx).await
    }
}

/// Transactional decorator: each operation goes through [`Proxied::call`],
/// which consults the pointcut. `get_user` is always read-only.
#[async_trait]
impl<S> UserService for Proxied<S, MemoryDataSource, UserEvent>
where
    S: UserService + ServiceDescriptor,
{
    async fn add(&self, ctx: &UserCtx, user: User) -> Result<()> {
        let args = vec![json!(user.id)];
        self.call(ctx, "add", args, None, |svc, ctx| async move {
            svc.add(&ctx, user).await
        })
        .await
    }

    async fn save_users(&self, ctx: &UserCtx, users: Vec<User>) -> Result<()> {
        let args = users.iter().map(|user| json!(user.id)).collect();
        self.call(ctx, "save_users", args, None, |svc, ctx| async move {
            svc.save_users(&ctx, users).await
        })
        .await
    }

    async fn upgrade_levels(&self, ctx: &UserCtx) -> Result<usize> {
        self.call(ctx, "upgrade_levels", vec![], None, |svc, ctx| async move {
            svc.upgrade_levels(&ctx).await
        })
        .await
    }

    async fn get_user(&self, ctx: &UserCtx, id: String) -> Result<Option<User>> {
        let args = vec![json!(id)];
        self.call(ctx, "get_user", args, Some(true), |svc, ctx| async move {
            svc.get_user(&ctx, id).await
        })
        .await
    }

    async fn get_all(&self, ctx: &UserCtx) -> Result<Vec<User>> {
        self.call(ctx, "get_all", vec![], None, |svc, ctx| async move {
            svc.get_all(&ctx).await
        })
        .await
    }

    async fn delete_all(&self, ctx: &UserCtx) -> Result<usize> {
        self.call(ctx, "delete_all", vec![], None, |svc, ctx| async move {
            svc.delete_all(&ctx).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, level: UserLevel, login: u32, recommend: u32) -> User {
        User::new(id, id, format!("{id}@example.com"), level, login, recommend)
    }

    #[test]
    fn test_upgrade_thresholds() {
        assert!(!user("a", UserLevel::Basic, 49, 0).can_upgrade());
        assert!(user("b", UserLevel::Basic, 50, 0).can_upgrade());
        assert!(!user("c", UserLevel::Silver, 60, 29).can_upgrade());
        assert!(user("d", UserLevel::Silver, 60, 30).can_upgrade());
        assert!(!user("e", UserLevel::Gold, 100, 100).can_upgrade());
    }

    #[test]
    fn test_gold_cannot_be_upgraded() {
        let mut silver = user("a", UserLevel::Silver, 60, 30);
        silver.upgrade_level().unwrap();
        assert_eq!(silver.level, UserLevel::Gold);
        assert!(silver.upgrade_level().is_err());
    }

    #[test]
    fn test_level_serializes_uppercase() {
        let row = serde_json::to_value(user("a", UserLevel::Silver, 0, 0)).unwrap();
        assert_eq!(row["level"], "SILVER");
    }

    #[tokio::test]
    async fn test_dao_without_transaction_autocommits() {
        let source = Arc::new(MemoryDataSource::new());
        let dao = MemoryUserDao::new(source.clone());
        let ctx = UserCtx::root();

        dao.add(&ctx, &user("a", UserLevel::Basic, 1, 0)).await.unwrap();
        let mut stored = dao.get(&ctx, "a").await.unwrap().unwrap();
        stored.login = 2;
        dao.update(&ctx, &stored).await.unwrap();

        assert_eq!(dao.get_all(&ctx).await.unwrap(), vec![stored]);
        assert_eq!(dao.updates(), 1);
        assert_eq!(source.stats().outstanding(), 0);
        assert_eq!(source.stats().begun, 0);
    }

    #[tokio::test]
    async fn test_injected_update_failure_counts_from_arming() {
        let source = Arc::new(MemoryDataSource::new());
        let dao = MemoryUserDao::new(source);
        let ctx = UserCtx::root();
        let a = user("a", UserLevel::Basic, 1, 0);
        dao.add(&ctx, &a).await.unwrap();

        dao.fail_on_update(2);
        dao.update(&ctx, &a).await.unwrap();
        assert!(dao.update(&ctx, &a).await.is_err());
        dao.update(&ctx, &a).await.unwrap();
        assert_eq!(dao.updates(), 2);
    }
}
