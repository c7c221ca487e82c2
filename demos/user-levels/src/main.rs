//! # User Levels Demo
//!
//! Upgrades user levels inside a declarative transaction and mails each
//! upgraded user after the transaction commits. The first run injects a
//! failure halfway through: every update is rolled back and no mail goes out.
//!
//! ```text
//! TXGATE_LOG=debug cargo run -p user-levels-demo -- [config.json]
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use txgate_core::{EventSink, TxConfig, TxGateBuilder};
use txgate_testing::{
    DefaultUserService, MemoryDataSource, MemoryUserDao, User, UserCtx, UserDao, UserEvent,
    UserLevel, UserService,
};

// ============================================================================
// Mail sink
// ============================================================================

const MAIL_FROM: &str = "admin@example.com";

/// Stands in for an SMTP client: logs the message it would send.
struct UpgradeMailer;

#[async_trait]
impl EventSink<UserEvent> for UpgradeMailer {
    async fn deliver(&self, event: UserEvent) -> Result<()> {
        let UserEvent::LevelUpgraded { user } = event;
        info!(
            from = MAIL_FROM,
            to = %user.email,
            level = %user.level,
            "mail sent: level upgrade notice"
        );
        Ok(())
    }
}

// ============================================================================
// Setup
// ============================================================================

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("TXGATE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config() -> Result<TxConfig> {
    let path = std::env::args().nth(1);
    let source = path.as_deref().unwrap_or("environment");
    TxConfig::load(path.as_deref()).with_context(|| format!("loading configuration from {source}"))
}

fn users() -> Vec<User> {
    vec![
        User::new("bumjin", "Park Bumjin", "bumjin@example.com", UserLevel::Basic, 49, 0),
        User::new("joytouch", "Kang Myungsung", "joytouch@example.com", UserLevel::Basic, 50, 0),
        User::new("erwins", "Shin Seungan", "erwins@example.com", UserLevel::Silver, 60, 29),
        User::new("madnite1", "Lee Sangho", "madnite1@example.com", UserLevel::Silver, 60, 30),
        User::new("green", "Oh Minkyu", "green@example.com", UserLevel::Gold, 100, 100),
    ]
}

async fn print_levels(dao: &MemoryUserDao) -> Result<()> {
    for user in dao.get_all(&UserCtx::root()).await? {
        println!("  {:<10} {}", user.id, user.level);
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = load_config()?;

    let source = Arc::new(MemoryDataSource::new());
    let dao = Arc::new(MemoryUserDao::new(source.clone()));
    let gate = TxGateBuilder::<_, UserEvent>::new(source.clone())
        .with_config(config)
        .with_sink(Arc::new(UpgradeMailer))
        .build()?;
    let service = gate.wrap(DefaultUserService::new(dao.clone()));

    let root = UserCtx::root();
    service.save_users(&root, users()).await?;

    println!("Upgrading levels with a failure on the second update...");
    dao.fail_on_update(2);
    match service.upgrade_levels(&root).await {
        Ok(count) => println!("{count} users upgraded"),
        Err(e) => warn!(error = %e, "upgrade failed, nothing was changed"),
    }
    print_levels(&dao).await?;

    println!("Upgrading levels...");
    let upgraded = service.upgrade_levels(&root).await?;
    println!("{upgraded} users upgraded:");
    print_levels(&dao).await?;

    let drained = gate.shutdown().await;
    let stats = gate.stats();
    println!(
        "Mail delivered: {}, discarded: {}, drained: {drained}",
        stats.delivered, stats.discarded
    );

    let store = source.stats();
    println!(
        "Transactions committed: {}, rolled back: {}",
        store.committed, store.rolled_back
    );

    Ok(())
}
