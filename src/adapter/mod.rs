//! Provider adapters: the thin, provider-specific layer the generic engine
//! is parameterized by.
//!
//! The engine never sees provider SDK types. It dispatches actions by name
//! through [`Client`], enumerates scope through [`ProviderAdapter`], and
//! lets the adapter decide how native resource ids are formatted.

pub mod fixture;
pub mod registry;

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::Result;
use crate::rules::CallTarget;
use crate::scope::ScanUnit;

pub use fixture::FixtureAdapter;
pub use registry::RegistryClient;

/// Parameters passed to an action, after template resolution.
pub type Params = Map<String, Value>;

/// Failure reported by a client for one action invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// No handler is registered under this action name.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("{action} failed{}: {message}", code_suffix(.code))]
    Api {
        action: String,
        code: Option<String>,
        message: String,
    },
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default()
}

impl CallError {
    pub fn api(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            action: action.into(),
            code: None,
            message: message.into(),
        }
    }

    /// Unregistered action names can never succeed on retry; everything else
    /// is retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnknownAction(_))
    }
}

/// Authenticated handle for one (account, region) scope.
///
/// Created once per scope and shared read-only by every scan unit in it.
pub trait Client: Send + Sync {
    fn call(&self, target: &CallTarget, action: &str, params: &Params) -> std::result::Result<Value, CallError>;
}

/// Everything provider-specific the engine needs.
pub trait ProviderAdapter: Send + Sync {
    /// Provider name (e.g., "aws").
    fn provider(&self) -> &str;

    /// Build a client for an account and region (`None` for global services).
    fn client(&self, account: &str, region: Option<&str>) -> Result<Arc<dyn Client>>;

    /// Accounts visible to the authenticated identity. May be empty.
    fn accounts(&self) -> Result<Vec<String>>;

    /// Regions enabled for an account. May be empty.
    fn regions(&self, account: &str) -> Result<Vec<String>>;

    /// The account the credentials belong to.
    fn current_account(&self) -> Result<String>;

    /// The default region of the credentials, if any.
    fn current_region(&self) -> Option<String>;

    /// Format a native resource id for reports. Pass-through by default.
    fn resource_id(&self, _unit: &ScanUnit, native_id: &str) -> String {
        native_id.to_string()
    }
}
