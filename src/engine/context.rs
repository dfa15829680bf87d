use serde_json::{Map, Value};

/// Symbol table templates are resolved against.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationContext {
    root: Value,
}

impl Default for EvaluationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::from_map(Map::new())
    }

    pub fn from_map(vars: Map<String, Value>) -> Self {
        Self {
            root: Value::Object(vars),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        if let Value::Object(vars) = &mut self.root {
            vars.insert(name.into(), value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.root.get(name)
    }

    /// Copy of this context with `name` bound to `value`.
    pub fn with(&self, name: &str, value: Value) -> Self {
        let mut copy = self.clone();
        copy.insert(name, value);
        copy
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn keys(&self) -> Vec<String> {
        self.root
            .as_object()
            .map(|vars| vars.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Responses saved during one rule-set run, shared across its steps in
/// order. One fresh instance per run.
#[derive(Debug, Default)]
pub struct SavedContext {
    vars: EvaluationContext,
}

impl SavedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key, value);
    }

    /// Push onto the list stored under `key`, creating it when missing.
    pub fn append(&mut self, key: &str, value: Value) {
        match self.vars.root.get_mut(key) {
            Some(Value::Array(items)) => items.push(value),
            _ => self.vars.insert(key, Value::Array(vec![value])),
        }
    }

    /// Per-iteration context: the loop variable plus a copy of everything
    /// saved so far. A saved key with the same name shadows the loop
    /// variable. The saved map itself is untouched.
    pub fn bind(&self, var: &str, element: Value) -> EvaluationContext {
        if self.vars.get(var).is_some() {
            tracing::debug!(var = %var, "saved key shadows loop variable");
            return self.vars.clone();
        }
        self.vars.with(var, element)
    }

    pub fn as_value(&self) -> &Value {
        self.vars.as_value()
    }

    pub fn keys(&self) -> Vec<String> {
        self.vars.keys()
    }
}
