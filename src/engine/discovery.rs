use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::context::SavedContext;
use crate::adapter::{CallError, Client, Params};
use crate::error::{Result, ScanError};
use crate::retry::Retrier;
use crate::rules::{CallDef, DiscoveryStep, EmitSpec, OnError, RuleSet};
use crate::template;

/// Discovery id → emitted items.
pub type Inventory = BTreeMap<String, Vec<Value>>;

/// Runs a rule set's discovery steps against one client.
pub struct DiscoveryExecutor<'a> {
    client: &'a dyn Client,
    retrier: &'a Retrier,
}

impl<'a> DiscoveryExecutor<'a> {
    pub fn new(client: &'a dyn Client, retrier: &'a Retrier) -> Self {
        Self { client, retrier }
    }

    /// Execute every step in order and collect the inventory.
    ///
    /// A failing call with `on_error: fail` aborts the whole run.
    pub fn run(&self, rule_set: &RuleSet) -> Result<Inventory> {
        let mut saved = SavedContext::new();
        let mut inventory = Inventory::new();

        for step in &rule_set.discovery {
            for call in &step.calls {
                if let Err(e) = self.execute_call(step, call, &mut saved) {
                    if call.on_error == OnError::Continue {
                        tracing::warn!(
                            service = %rule_set.service,
                            step = %step.id,
                            error = %e,
                            "call failed, continuing"
                        );
                        continue;
                    }
                    tracing::debug!(
                        service = %rule_set.service,
                        step = %step.id,
                        saved = ?saved.keys(),
                        "discovery aborted"
                    );
                    return Err(e);
                }
            }

            let items = match &step.emit {
                Some(emit) => emit_items(emit, &saved),
                None => Vec::new(),
            };
            tracing::debug!(service = %rule_set.service, step = %step.id, items = items.len(), "discovery step complete");
            inventory.insert(step.id.clone(), items);
        }

        Ok(inventory)
    }

    fn execute_call(&self, step: &DiscoveryStep, call: &CallDef, saved: &mut SavedContext) -> Result<()> {
        let Some(expr) = &call.for_each else {
            let ctx = saved.as_value().clone();
            let response = self.invoke(step, call, &ctx)?;
            if let Some(key) = call.save_as.as_deref().and_then(|k| save_key(k, &ctx)) {
                saved.store(key, response);
            }
            return Ok(());
        };

        let elements = template::resolve_list(expr, saved.as_value());
        // A fixed key inside a loop collects every response in order.
        let collect_into = call
            .save_as
            .as_deref()
            .filter(|key| !template::is_template(key));
        if let Some(key) = collect_into {
            saved.store(key, Value::Array(Vec::new()));
        }

        for element in elements {
            let ctx = saved.bind(&call.loop_var, element);
            match self.invoke(step, call, ctx.as_value()) {
                Ok(response) => match (collect_into, call.save_as.as_deref()) {
                    (Some(key), _) => saved.append(key, response),
                    (None, Some(key)) => {
                        if let Some(key) = save_key(key, ctx.as_value()) {
                            saved.store(key, response);
                        }
                    }
                    (None, None) => {}
                },
                Err(e) if call.on_error == OnError::Continue => {
                    tracing::warn!(step = %step.id, error = %e, "call failed for loop element, continuing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn invoke(&self, step: &DiscoveryStep, call: &CallDef, ctx: &Value) -> Result<Value> {
        let params = resolve_fields(&call.params, ctx);
        let action = call.qualified_action();
        let mut attempts = 0;
        self.retrier
            .call_if(
                &action,
                || {
                    attempts += 1;
                    self.client.call(&call.target, &call.action, &params)
                },
                CallError::is_retryable,
            )
            .map_err(|source| ScanError::ExternalCall {
                step: step.id.clone(),
                action,
                attempts,
                source,
            })
    }
}

fn save_key(template_key: &str, ctx: &Value) -> Option<String> {
    let key = template::to_plain_string(&template::resolve(template_key, ctx));
    if key.is_empty() {
        tracing::warn!(save_as = %template_key, "save_as resolved to an empty key, response dropped");
        return None;
    }
    Some(key)
}

fn resolve_fields(fields: &Map<String, Value>, ctx: &Value) -> Params {
    fields
        .iter()
        .map(|(name, tmpl)| (name.clone(), template::resolve_value(tmpl, ctx)))
        .collect()
}

/// Turn saved responses into inventory items.
///
/// With `items_for`, one item per list element (the element itself when no
/// field map is given). Without it, the field map is evaluated once against
/// the whole saved context.
fn emit_items(emit: &EmitSpec, saved: &SavedContext) -> Vec<Value> {
    match &emit.items_for {
        Some(expr) => template::resolve_list(expr, saved.as_value())
            .into_iter()
            .map(|element| {
                if emit.item.is_empty() {
                    return element;
                }
                let ctx = saved.bind(&emit.item_var, element);
                Value::Object(resolve_fields(&emit.item, ctx.as_value()))
            })
            .collect(),
        None if emit.item.is_empty() => Vec::new(),
        None => vec![Value::Object(resolve_fields(&emit.item, saved.as_value()))],
    }
}
