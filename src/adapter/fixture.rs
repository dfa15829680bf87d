use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{CallError, Client, Params, ProviderAdapter, RegistryClient};
use crate::error::{Result, ScanError};
use crate::scope::{ScanUnit, GLOBAL_REGION};
use crate::template;

/// Offline provider replaying recorded responses from a JSON document.
///
/// ```json
/// {
///   "provider": "aws",
///   "identity": { "account": "111111111111", "region": "us-east-1" },
///   "resource_id_format": "arn:aws:{{ service }}:{{ region }}:{{ account }}:{{ id }}",
///   "accounts": {
///     "111111111111": {
///       "regions": ["us-east-1"],
///       "responses": {
///         "global": { "s3.list_buckets": { "Buckets": [] } },
///         "*": { "sts.get_caller_identity": { "Account": "111111111111" } }
///       }
///     }
///   }
/// }
/// ```
///
/// A response may be a plain value, `{"$error": "message"}`, or
/// `{"$cases": [{"when": {..params..}, "response": ..}, {"when": .., "error": ".."}]}`
/// where the first case whose `when` params all match is used.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureAdapter {
    #[serde(default = "default_provider")]
    provider: String,
    #[serde(default)]
    identity: FixtureIdentity,
    #[serde(default)]
    resource_id_format: Option<String>,
    #[serde(default)]
    accounts: BTreeMap<String, FixtureAccount>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FixtureIdentity {
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FixtureAccount {
    #[serde(default)]
    regions: Vec<String>,
    /// Region key (`global`, a region name, or `*` for any) → action → response.
    #[serde(default)]
    responses: BTreeMap<String, BTreeMap<String, Value>>,
}

fn default_provider() -> String {
    "fixture".into()
}

impl FixtureAdapter {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

impl ProviderAdapter for FixtureAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn client(&self, account: &str, region: Option<&str>) -> Result<Arc<dyn Client>> {
        let fixture = self.accounts.get(account).ok_or_else(|| ScanError::Client {
            account: account.into(),
            message: "no fixture recorded for account".into(),
        })?;

        let region_key = region.unwrap_or(GLOBAL_REGION);
        let mut merged: BTreeMap<&str, &Value> = BTreeMap::new();
        for key in ["*", region_key] {
            if let Some(actions) = fixture.responses.get(key) {
                merged.extend(actions.iter().map(|(k, v)| (k.as_str(), v)));
            }
        }

        let mut client = RegistryClient::new();
        for (action, recorded) in merged {
            let response = FixtureResponse::from_value(action, recorded.clone());
            let name = action.to_string();
            client.register(action, move |params| response.answer(&name, params));
        }
        Ok(Arc::new(client))
    }

    fn accounts(&self) -> Result<Vec<String>> {
        Ok(self.accounts.keys().cloned().collect())
    }

    fn regions(&self, account: &str) -> Result<Vec<String>> {
        Ok(self
            .accounts
            .get(account)
            .map(|a| a.regions.clone())
            .unwrap_or_default())
    }

    fn current_account(&self) -> Result<String> {
        self.identity
            .account
            .clone()
            .ok_or_else(|| ScanError::ScopeResolution("fixture has no identity.account".into()))
    }

    fn current_region(&self) -> Option<String> {
        self.identity.region.clone()
    }

    fn resource_id(&self, unit: &ScanUnit, native_id: &str) -> String {
        let Some(format) = &self.resource_id_format else {
            return native_id.to_string();
        };
        let mut ctx = Map::new();
        ctx.insert("provider".into(), Value::String(self.provider.clone()));
        ctx.insert("account".into(), Value::String(unit.account.clone()));
        ctx.insert(
            "region".into(),
            Value::String(unit.region.clone().unwrap_or_default()),
        );
        ctx.insert("service".into(), Value::String(unit.service.clone()));
        ctx.insert("id".into(), Value::String(native_id.to_string()));
        template::to_plain_string(&template::resolve(format, &Value::Object(ctx)))
    }
}

#[derive(Debug, Clone)]
enum FixtureResponse {
    Static(Value),
    Error(String),
    Cases(Vec<FixtureCase>),
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureCase {
    #[serde(default)]
    when: Params,
    #[serde(default)]
    response: Value,
    #[serde(default)]
    error: Option<String>,
}

impl FixtureResponse {
    fn from_value(action: &str, value: Value) -> Self {
        if let Some(message) = value.get("$error").and_then(Value::as_str) {
            return Self::Error(message.to_string());
        }
        if let Some(cases) = value.get("$cases") {
            match serde_json::from_value::<Vec<FixtureCase>>(cases.clone()) {
                Ok(cases) => return Self::Cases(cases),
                Err(e) => {
                    tracing::warn!(action = %action, error = %e, "malformed fixture cases");
                    return Self::Error(format!("malformed fixture cases: {e}"));
                }
            }
        }
        Self::Static(value)
    }

    fn answer(&self, action: &str, params: &Params) -> std::result::Result<Value, CallError> {
        match self {
            Self::Static(value) => Ok(value.clone()),
            Self::Error(message) => Err(CallError::api(action, message.clone())),
            Self::Cases(cases) => {
                let case = cases
                    .iter()
                    .find(|case| case.when.iter().all(|(k, v)| params.get(k) == Some(v)))
                    .ok_or_else(|| CallError::api(action, "no fixture case matches params"))?;
                match &case.error {
                    Some(message) => Err(CallError::api(action, message.clone())),
                    None => Ok(case.response.clone()),
                }
            }
        }
    }
}
