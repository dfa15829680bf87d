use std::collections::BTreeMap;

use serde_json::Value;

use super::{CallError, Client, Params};
use crate::rules::CallTarget;

type Handler = Box<dyn Fn(&Params) -> Result<Value, CallError> + Send + Sync>;

/// Client backed by a registration table of named action handlers.
///
/// Handlers are looked up as `client.action` first, then as bare `action`,
/// so a provider can register either form.
#[derive(Default)]
pub struct RegistryClient {
    handlers: BTreeMap<String, Handler>,
}

impl RegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one under the same name.
    pub fn register<F>(&mut self, action: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Params) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        self.handlers.insert(action.into(), Box::new(handler));
        self
    }

    pub fn with<F>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Params) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        self.register(action, handler);
        self
    }

    /// Register a handler that always returns the same response.
    pub fn with_response(self, action: impl Into<String>, response: Value) -> Self {
        self.with(action, move |_| Ok(response.clone()))
    }

    fn handler(&self, target: &CallTarget, action: &str) -> Option<&Handler> {
        if !target.client.is_empty() {
            let qualified = format!("{}.{}", target.client, action);
            if let Some(handler) = self.handlers.get(&qualified) {
                return Some(handler);
            }
        }
        self.handlers.get(action)
    }
}

impl Client for RegistryClient {
    fn call(&self, target: &CallTarget, action: &str, params: &Params) -> Result<Value, CallError> {
        match self.handler(target, action) {
            Some(handler) => handler(params),
            None => Err(CallError::UnknownAction(if target.client.is_empty() {
                action.to_string()
            } else {
                format!("{}.{}", target.client, action)
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(client: &str) -> CallTarget {
        CallTarget {
            client: client.into(),
            ..Default::default()
        }
    }

    #[test]
    fn qualified_name_wins_over_bare_name() {
        let client = RegistryClient::new()
            .with_response("list", json!("bare"))
            .with_response("s3.list", json!("qualified"));
        let params = Params::new();
        assert_eq!(client.call(&target("s3"), "list", &params).unwrap(), json!("qualified"));
        assert_eq!(client.call(&target("ec2"), "list", &params).unwrap(), json!("bare"));
    }

    #[test]
    fn handlers_receive_params() {
        let client = RegistryClient::new().with("kms.describe_key", |params| {
            Ok(json!({"KeyId": params.get("KeyId").cloned().unwrap_or_default()}))
        });
        let mut params = Params::new();
        params.insert("KeyId".into(), json!("k-1"));
        let response = client.call(&target("kms"), "describe_key", &params).unwrap();
        assert_eq!(response, json!({"KeyId": "k-1"}));
    }

    #[test]
    fn unregistered_action_is_not_retryable() {
        let client = RegistryClient::new();
        let err = client.call(&target("s3"), "nope", &Params::new()).unwrap_err();
        assert_eq!(err, CallError::UnknownAction("s3.nope".into()));
        assert!(!err.is_retryable());
    }
}
