//! Placeholder substitution for rule documents.
//!
//! Rule parameters, `save_as` keys, emit fields and condition expectations
//! are all templates: strings that may contain `{{ path }}` placeholders
//! resolved against an evaluation context.

pub mod path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub use path::{extract, SELF_PATH};

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").unwrap());

static WHOLE_PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\{\{\s*([^{}]*?)\s*\}\}\s*$").unwrap());

/// Whether `text` contains at least one placeholder.
pub fn is_template(text: &str) -> bool {
    PLACEHOLDER_RE.is_match(text)
}

/// Resolve a template string against `ctx`.
///
/// A string that is exactly one placeholder resolves to the native value at
/// that path (`Null` when absent), so objects, numbers and booleans survive.
/// Anything else is string interpolation.
pub fn resolve(text: &str, ctx: &Value) -> Value {
    if let Some(caps) = WHOLE_PLACEHOLDER_RE.captures(text) {
        return extract(ctx, &caps[1]).unwrap_or(Value::Null);
    }
    if !is_template(text) {
        return Value::String(text.to_string());
    }

    let rendered = PLACEHOLDER_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        extract(ctx, &caps[1])
            .map(|v| to_plain_string(&v))
            .unwrap_or_default()
    });
    Value::String(rendered.into_owned())
}

/// Resolve every string inside a nested template value.
pub fn resolve_value(template: &Value, ctx: &Value) -> Value {
    match template {
        Value::String(text) => resolve(text, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a `for_each` / `items_for` expression to the list it names.
///
/// The expression may be a bare path (`buckets.Buckets[]`) or a template
/// (`{{ buckets.Buckets }}`). A scalar result becomes a one-element list and
/// an absent one an empty list.
pub fn resolve_list(expr: &str, ctx: &Value) -> Vec<Value> {
    let value = if is_template(expr) {
        resolve(expr, ctx)
    } else {
        extract(ctx, expr).unwrap_or(Value::Null)
    };
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// String form used when a placeholder is embedded in surrounding text.
pub fn to_plain_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn whole_placeholder_keeps_native_type() {
        let ctx = json!({"item": {"Enc": true, "Tags": {"env": "prod"}, "Size": 4}});
        assert_eq!(resolve("{{item.Enc}}", &ctx), json!(true));
        assert_eq!(resolve("{{ item.Tags }}", &ctx), json!({"env": "prod"}));
        assert_eq!(resolve("{{ item.Size }}", &ctx), json!(4));
    }

    #[test]
    fn interpolation_renders_strings() {
        let ctx = json!({"bucket": {"Name": "logs"}, "n": 3});
        assert_eq!(
            resolve("arn:aws:s3:::{{ bucket.Name }}/{{n}}", &ctx),
            json!("arn:aws:s3:::logs/3")
        );
    }

    #[test]
    fn absent_placeholder() {
        let ctx = json!({});
        assert_eq!(resolve("{{ missing.key }}", &ctx), Value::Null);
        assert_eq!(resolve("x-{{ missing }}-y", &ctx), json!("x--y"));
    }

    #[test]
    fn resolve_value_walks_nested_templates() {
        let ctx = json!({"item": {"Name": "db-1", "Port": 5432}});
        let template = json!({
            "Filters": [{"Name": "name", "Values": ["{{ item.Name }}"]}],
            "Port": "{{ item.Port }}",
            "Static": 1
        });
        assert_eq!(
            resolve_value(&template, &ctx),
            json!({
                "Filters": [{"Name": "name", "Values": ["db-1"]}],
                "Port": 5432,
                "Static": 1
            })
        );
    }

    #[test]
    fn resolve_list_accepts_paths_and_templates() {
        let ctx = json!({"resp": {"Items": [1, 2]}, "one": "x"});
        assert_eq!(resolve_list("resp.Items[]", &ctx), vec![json!(1), json!(2)]);
        assert_eq!(resolve_list("{{ resp.Items }}", &ctx), vec![json!(1), json!(2)]);
        assert_eq!(resolve_list("one", &ctx), vec![json!("x")]);
        assert!(resolve_list("nothing", &ctx).is_empty());
    }

    proptest! {
        #[test]
        fn text_without_placeholders_is_unchanged(text in "[^{}]*") {
            let ctx = json!({"a": 1});
            prop_assert_eq!(resolve(&text, &ctx), Value::String(text.clone()));
        }
    }
}
