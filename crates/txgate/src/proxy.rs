//! The proxy front: route each call through the interceptor or straight to
//! the target.
//!
//! Rust has no runtime method interception, so each service trait gets a
//! small typed decorator: `impl MyService for Proxied<MyServiceImpl, ...>`
//! whose methods forward through [`Proxied::call`]. The decorator decides
//! nothing itself; the pointcut does.
//!
//! ```ignore
//! #[async_trait]
//! impl<S> UserService for Proxied<S, Db, UserEvent>
//! where
//!     S: UserService + ServiceDescriptor,
//! {
//!     async fn upgrade_levels(&self, ctx: &Ctx) -> anyhow::Result<usize> {
//!         self.call(ctx, "upgrade_levels", vec![], None, |svc, ctx| async move {
//!             svc.upgrade_levels(&ctx).await
//!         })
//!         .await
//!     }
//! }
//! ```

use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::core::{Event, Invocation};
use crate::error::TxError;
use crate::interceptor::TransactionInterceptor;
use crate::pointcut::MethodMatcher;
use crate::transaction::{TransactionManager, TxContext};

/// Static self-description of a service, used for pointcut matching.
pub trait ServiceDescriptor {
    /// Type name, optionally path-qualified (`app::users::UserService`).
    fn type_name(&self) -> &str;

    /// Markers declared on the type (`"service"`, `"transactional"`, ...).
    fn markers(&self) -> &[&'static str] {
        &[]
    }

    /// Every operation the service exposes.
    fn method_names(&self) -> &[&'static str];
}

/// Builds [`Proxied`] wrappers sharing one matcher and one interceptor.
pub struct ProxyFactory<M: TransactionManager, Ev> {
    matcher: Arc<dyn MethodMatcher>,
    interceptor: Arc<TransactionInterceptor<M, Ev>>,
}

impl<M, Ev> ProxyFactory<M, Ev>
where
    M: TransactionManager,
    Ev: Event,
{
    pub fn new(
        matcher: Arc<dyn MethodMatcher>,
        interceptor: Arc<TransactionInterceptor<M, Ev>>,
    ) -> Self {
        Self {
            matcher,
            interceptor,
        }
    }

    pub fn interceptor(&self) -> &Arc<TransactionInterceptor<M, Ev>> {
        &self.interceptor
    }

    /// Wrap a target. Types with no transactional method come back inert:
    /// every call goes straight through.
    pub fn wrap<T: ServiceDescriptor>(&self, target: T) -> Proxied<T, M, Ev> {
        let type_name = target.type_name();
        let markers = target.markers();
        let advised = self.matcher.matches_type(type_name, markers)
            && target
                .method_names()
                .iter()
                .any(|method| self.matcher.matches(type_name, method, markers));

        if advised {
            debug!(service = type_name, "wrapping target in transaction proxy");
        } else {
            debug!(service = type_name, "no transactional methods, target left unadvised");
        }

        Proxied {
            target,
            advice: advised.then(|| Advice {
                matcher: Arc::clone(&self.matcher),
                interceptor: Arc::clone(&self.interceptor),
            }),
        }
    }
}

impl<M: TransactionManager, Ev> Clone for ProxyFactory<M, Ev> {
    fn clone(&self) -> Self {
        Self {
            matcher: Arc::clone(&self.matcher),
            interceptor: Arc::clone(&self.interceptor),
        }
    }
}

struct Advice<M: TransactionManager, Ev> {
    matcher: Arc<dyn MethodMatcher>,
    interceptor: Arc<TransactionInterceptor<M, Ev>>,
}

/// A target plus, when its type is advised, the transaction advice.
pub struct Proxied<T, M: TransactionManager, Ev> {
    target: T,
    advice: Option<Advice<M, Ev>>,
}

impl<T, M, Ev> Proxied<T, M, Ev>
where
    T: ServiceDescriptor,
    M: TransactionManager,
    Ev: Event,
{
    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn into_inner(self) -> T {
        self.target
    }

    /// Whether any call on this wrapper can run in a transaction.
    pub fn is_advised(&self) -> bool {
        self.advice.is_some()
    }

    /// Whether calls to `method` run in a transaction.
    pub fn is_transactional(&self, method: &str) -> bool {
        self.advice.as_ref().is_some_and(|advice| {
            advice
                .matcher
                .matches(self.target.type_name(), method, self.target.markers())
        })
    }

    /// Forward one operation to the target.
    ///
    /// `read_only` overrides the name-based inference for this call.
    pub async fn call<'a, R, E, F, Fut>(
        &'a self,
        ctx: &TxContext<M::Resource, Ev>,
        method: &'static str,
        args: Vec<Value>,
        read_only: Option<bool>,
        f: F,
    ) -> Result<R, E>
    where
        F: FnOnce(&'a T, TxContext<M::Resource, Ev>) -> Fut,
        Fut: Future<Output = Result<R, E>> + 'a,
        E: From<TxError> + fmt::Display,
    {
        let target = &self.target;
        let advice = self.advice.as_ref().filter(|advice| {
            advice
                .matcher
                .matches(target.type_name(), method, target.markers())
        });

        let Some(advice) = advice else {
            trace!(service = target.type_name(), method, "direct call");
            return f(target, ctx.clone()).await;
        };

        let invocation = Invocation::new(target.type_name(), method)
            .with_args(args)
            .returning::<R>();
        let read_only = advice.matcher.read_only(method, read_only);

        advice
            .interceptor
            .invoke(ctx, &invocation, read_only, move |ctx| f(target, ctx))
            .await
    }
}

impl<T, M, Ev> ServiceDescriptor for Proxied<T, M, Ev>
where
    T: ServiceDescriptor,
    M: TransactionManager,
{
    fn type_name(&self) -> &str {
        self.target.type_name()
    }

    fn markers(&self) -> &[&'static str] {
        self.target.markers()
    }

    fn method_names(&self) -> &[&'static str] {
        self.target.method_names()
    }
}
