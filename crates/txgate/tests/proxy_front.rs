//! Which calls the proxy front routes through a transaction.

use std::sync::Arc;
use txgate_core::{
    MethodMatcher, Pointcut, PointcutRule, ServiceDescriptor, TxConfig, TxContext, TxGateBuilder,
};
use txgate_testing::{MemoryConnection, MemoryDataSource, RecordingSink, UserEvent};

type Ctx = TxContext<MemoryConnection, UserEvent>;

struct ReportService;

impl ServiceDescriptor for ReportService {
    fn type_name(&self) -> &str {
        "reporting::ReportService"
    }

    fn method_names(&self) -> &[&'static str] {
        &["getData", "saveReport"]
    }
}

impl ReportService {
    async fn get_data(&self, ctx: Ctx) -> anyhow::Result<String> {
        Ok(format!("in transaction: {}", ctx.is_active()))
    }
}

struct AuditLog;

impl ServiceDescriptor for AuditLog {
    fn type_name(&self) -> &str {
        "AuditLog"
    }

    fn markers(&self) -> &[&'static str] {
        &["transactional"]
    }

    fn method_names(&self) -> &[&'static str] {
        &["append", "getEntries"]
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_data_is_not_wrapped() {
    let source = Arc::new(MemoryDataSource::new());
    let gate = TxGateBuilder::<_, UserEvent>::new(source.clone())
        .with_sink(Arc::new(RecordingSink::<UserEvent>::new()))
        .build()
        .unwrap();
    let reports = gate.wrap(ReportService);

    let data = reports
        .call(&Ctx::root(), "getData", vec![], None, |svc, ctx| svc.get_data(ctx))
        .await
        .unwrap();

    assert_eq!(data, "in transaction: false");
    assert!(reports.is_advised());
    assert!(!reports.is_transactional("getData"));
    assert!(reports.is_transactional("saveReport"));
    assert_eq!(source.stats().acquired, 0);
    assert_eq!(source.stats().begun, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_marker_rule_from_configuration() {
    let config = TxConfig::from_json(
        r#"{ "pointcut_rules": [ { "kind": "marker", "marker": "transactional" } ] }"#,
    )
    .unwrap();
    let source = Arc::new(MemoryDataSource::new());
    let gate = TxGateBuilder::<_, UserEvent>::new(source.clone())
        .with_config(config)
        .build()
        .unwrap();

    let audit = gate.wrap(AuditLog);
    let reports = gate.wrap(ReportService);

    let active = audit
        .call(&Ctx::root(), "getEntries", vec![], None, |_, ctx| async move {
            Ok::<_, anyhow::Error>(ctx.is_active())
        })
        .await
        .unwrap();

    assert!(active);
    assert!(!reports.is_advised());
    let definitions = source.definitions();
    assert_eq!(definitions[0].name, "AuditLog.getEntries");
    assert!(definitions[0].read_only);
}

struct OnlyAppend;

impl MethodMatcher for OnlyAppend {
    fn matches_type(&self, type_name: &str, _markers: &[&str]) -> bool {
        type_name == "AuditLog"
    }

    fn matches(&self, type_name: &str, method: &str, markers: &[&str]) -> bool {
        self.matches_type(type_name, markers) && method == "append"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_custom_matcher_replaces_configured_rules() {
    let source = Arc::new(MemoryDataSource::new());
    let gate = TxGateBuilder::<_, UserEvent>::new(source.clone())
        .with_matcher(Arc::new(OnlyAppend))
        .build()
        .unwrap();

    let audit = gate.wrap(AuditLog);

    assert!(audit.is_transactional("append"));
    assert!(!audit.is_transactional("getEntries"));
    assert!(!gate.wrap(ReportService).is_advised());
}

#[test]
fn test_default_rules_match_service_naming() {
    let pointcut = Pointcut::service_naming();

    assert!(pointcut.matches("UserService", "upgradeLevels", &[]));
    assert!(pointcut.matches("app::users::UserService", "deleteAll", &[]));
    assert!(!pointcut.matches("UserService", "getData", &[]));
    assert!(!pointcut.matches("UserRepository", "save", &[]));

    let regex = Pointcut::new(vec![PointcutRule::regex("UserService", "upgrade.*|save").unwrap()]);
    assert!(regex.matches("UserService", "save", &[]));
    assert!(!regex.matches("UserService", "saveAll", &[]));
}

#[tokio::test]
async fn test_build_rejects_invalid_configuration() {
    let config = TxConfig {
        worker_pool_size: 0,
        ..TxConfig::default()
    };

    let result = TxGateBuilder::<_, UserEvent>::new(Arc::new(MemoryDataSource::new()))
        .with_config(config)
        .build();

    assert!(matches!(result, Err(txgate_core::TxError::Config(_))));
}

#[test]
fn test_build_outside_a_runtime_is_a_config_error() {
    let result = TxGateBuilder::<_, UserEvent>::new(Arc::new(MemoryDataSource::new())).build();

    assert!(matches!(result, Err(txgate_core::TxError::Config(_))));
}
