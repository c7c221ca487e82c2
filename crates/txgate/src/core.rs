//! Core value types shared by every component.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Marker trait for events raised during a transactional call.
///
/// Auto-implemented for every `Clone + Debug + Send + Sync + 'static` type, so
/// plain enums and structs work without ceremony.
pub trait Event: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Event for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// Identifier of a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One intercepted call: who, what, with which arguments.
///
/// Built once by the proxy front and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invocation {
    target_type: String,
    method: String,
    args: Vec<Value>,
    result_type: &'static str,
}

impl Invocation {
    pub fn new(target_type: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            method: method.into(),
            args: Vec::new(),
            result_type: "()",
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Record the declared result type of the call.
    pub fn returning<T: ?Sized>(mut self) -> Self {
        self.result_type = std::any::type_name::<T>();
        self
    }

    pub fn target_type(&self) -> &str {
        &self.target_type
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn result_type(&self) -> &'static str {
        self.result_type
    }

    /// `Type.method`, used as the transaction name.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", simple_type_name(&self.target_type), self.method)
    }
}

/// Last path segment of a type name (`a::b::UserService` -> `UserService`).
pub fn simple_type_name(type_name: &str) -> &str {
    let after_path = type_name.rsplit("::").next().unwrap_or(type_name);
    after_path.rsplit('.').next().unwrap_or(after_path)
}
