use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EvaluationError;
use crate::template::{self, to_plain_string};

/// Boolean condition tree, parsed once when the rule set is loaded.
///
/// Accepted document shapes:
///
/// ```yaml
/// all: [ ... ]
/// any: [ ... ]
/// var: item.encryption.enabled   # alias: path
/// op: equals                     # alias: operator
/// value: true                    # alias: expected
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawCondition")]
pub enum Condition {
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Leaf {
        var: String,
        op: Operator,
        value: Option<Value>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCondition {
    All {
        all: Vec<Condition>,
    },
    Any {
        any: Vec<Condition>,
    },
    Leaf {
        #[serde(alias = "path")]
        var: String,
        #[serde(alias = "operator")]
        op: String,
        #[serde(default, alias = "expected")]
        value: Option<Value>,
    },
}

impl From<RawCondition> for Condition {
    fn from(raw: RawCondition) -> Self {
        match raw {
            RawCondition::All { all } => Self::All(all),
            RawCondition::Any { any } => Self::Any(any),
            RawCondition::Leaf { var, op, value } => Self::Leaf {
                var,
                op: Operator::parse(&op),
                value,
            },
        }
    }
}

impl Condition {
    /// Evaluate the tree against `ctx`.
    ///
    /// `All` of nothing is true and `Any` of nothing is false. A leaf resolves
    /// its expected value as a template first, so it may refer to the current
    /// item or check params.
    pub fn evaluate(&self, ctx: &Value) -> Result<bool, EvaluationError> {
        match self {
            Self::All(children) => {
                for child in children {
                    if !child.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any(children) => {
                for child in children {
                    if child.evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Leaf { var, op, value } => {
                let expected = value.as_ref().map(|v| template::resolve_value(v, ctx));
                let observed = template::extract(ctx, var);
                evaluate(observed.as_ref(), op, expected.as_ref())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Exists,
    NotExists,
    Equals,
    NotEquals,
    Gt,
    Gte,
    Lt,
    Lte,
    LengthGte,
    Contains,
    NotContains,
    IsTrue,
    IsFalse,
    IsEmpty,
    IsNotEmpty,
    In,
    NotIn,
    /// Kept so an unrecognised name evaluates to false instead of failing
    /// the whole rule set.
    Unknown(String),
}

impl Operator {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "exists" => Self::Exists,
            "not_exists" => Self::NotExists,
            "equals" | "eq" => Self::Equals,
            "not_equals" | "ne" => Self::NotEquals,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "length_gte" => Self::LengthGte,
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "is_true" => Self::IsTrue,
            "is_false" => Self::IsFalse,
            "is_empty" => Self::IsEmpty,
            "is_not_empty" => Self::IsNotEmpty,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            _ => Self::Unknown(s.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Exists => "exists",
            Self::NotExists => "not_exists",
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::LengthGte => "length_gte",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::IsTrue => "is_true",
            Self::IsFalse => "is_false",
            Self::IsEmpty => "is_empty",
            Self::IsNotEmpty => "is_not_empty",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Unknown(name) => name,
        }
    }
}

/// Apply one operator to an observed value.
///
/// `None` and JSON `null` both mean "absent".
pub fn evaluate(
    observed: Option<&Value>,
    op: &Operator,
    expected: Option<&Value>,
) -> Result<bool, EvaluationError> {
    let observed = observed.filter(|v| !v.is_null());

    let result = match op {
        Operator::Exists => !is_absent(observed),
        Operator::NotExists => is_absent(observed),
        Operator::IsEmpty => is_absent(observed),
        Operator::IsNotEmpty => !is_absent(observed),
        Operator::Equals => loose_eq(observed.unwrap_or(&Value::Null), expected.unwrap_or(&Value::Null)),
        Operator::NotEquals => !loose_eq(observed.unwrap_or(&Value::Null), expected.unwrap_or(&Value::Null)),
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let bound = expected_number(op, expected)?;
            match observed.and_then(as_number) {
                None => false,
                Some(x) => match op {
                    Operator::Gt => x > bound,
                    Operator::Gte => x >= bound,
                    Operator::Lt => x < bound,
                    _ => x <= bound,
                },
            }
        }
        Operator::LengthGte => {
            let bound = expected_number(op, expected)?;
            match observed.and_then(length_of) {
                None => false,
                Some(len) => len as f64 >= bound,
            }
        }
        Operator::Contains => contains(observed, required(op, expected)?),
        Operator::NotContains => !contains(observed, required(op, expected)?),
        Operator::IsTrue => matches!(observed.and_then(as_bool), Some(true)),
        Operator::IsFalse => matches!(observed.and_then(as_bool), Some(false)),
        Operator::In => {
            let list = expected_list(op, expected)?;
            match observed {
                None => false,
                Some(Value::Array(values)) => values.iter().all(|v| member(v, list)),
                Some(v) => member(v, list),
            }
        }
        Operator::NotIn => {
            let list = expected_list(op, expected)?;
            match observed {
                None => true,
                Some(Value::Array(values)) => !values.iter().any(|v| member(v, list)),
                Some(v) => !member(v, list),
            }
        }
        Operator::Unknown(name) => {
            tracing::warn!(operator = %name, "unknown condition operator, evaluating to false");
            false
        }
    };

    Ok(result)
}

fn is_absent(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        Value::Object(o) => Some(o.len()),
        _ => None,
    }
}

/// Equality that tolerates the usual cloud API shape drift: `"5"` vs `5`,
/// `"True"` vs `true`.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            matches!((as_number(a), as_number(b)), (Some(x), Some(y)) if x == y)
        }
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Bool(_), Value::String(_)) | (Value::String(_), Value::Bool(_)) => {
            as_bool(a).is_some() && as_bool(a) == as_bool(b)
        }
        _ => false,
    }
}

fn member(value: &Value, list: &[Value]) -> bool {
    list.iter().any(|candidate| loose_eq(value, candidate))
}

fn contains(observed: Option<&Value>, needle: &Value) -> bool {
    match observed {
        None => false,
        Some(Value::String(haystack)) => haystack.contains(&to_plain_string(needle)),
        Some(Value::Array(values)) => member(needle, values),
        Some(Value::Object(map)) => map.contains_key(&to_plain_string(needle)),
        Some(other) => loose_eq(other, needle),
    }
}

fn required<'a>(op: &Operator, expected: Option<&'a Value>) -> Result<&'a Value, EvaluationError> {
    expected.ok_or_else(|| EvaluationError::MissingExpected {
        op: op.name().to_string(),
    })
}

fn expected_number(op: &Operator, expected: Option<&Value>) -> Result<f64, EvaluationError> {
    let value = required(op, expected)?;
    as_number(value).ok_or_else(|| EvaluationError::ExpectedNumber {
        op: op.name().to_string(),
        found: value.to_string(),
    })
}

fn expected_list<'a>(op: &Operator, expected: Option<&'a Value>) -> Result<&'a [Value], EvaluationError> {
    match required(op, expected)? {
        Value::Array(values) => Ok(values),
        other => Err(EvaluationError::ExpectedList {
            op: op.name().to_string(),
            found: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(observed: Value, op: &str, expected: Value) -> bool {
        let observed = if observed.is_null() { None } else { Some(&observed) };
        evaluate(observed, &Operator::parse(op), Some(&expected)).unwrap()
    }

    #[test]
    fn empty_all_is_true_and_empty_any_is_false() {
        let ctx = json!({});
        assert!(Condition::All(vec![]).evaluate(&ctx).unwrap());
        assert!(!Condition::Any(vec![]).evaluate(&ctx).unwrap());
    }

    #[test]
    fn exists_treats_empty_as_absent() {
        assert!(!eval(json!(""), "exists", Value::Null));
        assert!(!eval(json!([]), "exists", Value::Null));
        assert!(eval(json!({}), "not_exists", Value::Null));
        assert!(eval(json!("x"), "exists", Value::Null));
        assert!(eval(Value::Null, "not_exists", Value::Null));
    }

    #[test]
    fn numeric_comparisons_coerce() {
        assert!(eval(json!("90"), "gte", json!(90)));
        assert!(eval(json!(3), "lt", json!("4")));
        assert!(!eval(Value::Null, "lt", json!(4)));
        assert!(!eval(Value::Null, "gt", json!(-1)));
    }

    #[test]
    fn non_numeric_expected_is_an_error() {
        let err = evaluate(Some(&json!(1)), &Operator::Gt, Some(&json!("many"))).unwrap_err();
        assert!(matches!(err, EvaluationError::ExpectedNumber { .. }));
    }

    #[test]
    fn in_requires_a_list() {
        assert!(eval(json!("TLSv1.2"), "in", json!(["TLSv1.2", "TLSv1.3"])));
        assert!(eval(json!("TLSv1"), "not_in", json!(["TLSv1.2", "TLSv1.3"])));
        let err = evaluate(Some(&json!("a")), &Operator::In, Some(&json!("a"))).unwrap_err();
        assert!(matches!(err, EvaluationError::ExpectedList { .. }));
    }

    #[test]
    fn contains_over_strings_lists_and_maps() {
        assert!(eval(json!("arn:aws:iam::*"), "contains", json!("*")));
        assert!(eval(json!(["s3:*", "ec2:Describe*"]), "contains", json!("s3:*")));
        assert!(eval(json!({"Owner": "x"}), "contains", json!("Owner")));
        assert!(eval(Value::Null, "not_contains", json!("x")));
    }

    #[test]
    fn booleans_and_lengths() {
        assert!(eval(json!(true), "is_true", Value::Null));
        assert!(eval(json!("False"), "is_false", Value::Null));
        assert!(!eval(Value::Null, "is_true", Value::Null));
        assert!(eval(json!([1, 2, 3]), "length_gte", json!(3)));
        assert!(!eval(json!("ab"), "length_gte", json!(3)));
    }

    #[test]
    fn equals_is_loose() {
        assert!(eval(json!("5"), "equals", json!(5)));
        assert!(eval(json!("true"), "equals", json!(true)));
        assert!(eval(json!("a"), "not_equals", json!("b")));
    }

    #[test]
    fn unknown_operator_is_false() {
        assert!(!eval(json!(1), "roughly_equals", json!(1)));
    }

    #[test]
    fn leaf_expected_is_resolved_against_item() {
        let cond: Condition = serde_yaml::from_str(
            "all:\n  - var: item.min_length\n    op: gte\n    value: '{{ params.required }}'\n",
        )
        .unwrap();
        let ctx = json!({"item": {"min_length": 14}, "params": {"required": 12}});
        assert!(cond.evaluate(&ctx).unwrap());
        let ctx = json!({"item": {"min_length": 8}, "params": {"required": 12}});
        assert!(!cond.evaluate(&ctx).unwrap());
    }

    #[test]
    fn parses_nested_tree_with_aliases() {
        let cond: Condition = serde_yaml::from_str(
            r#"
any:
  - path: item.public
    operator: is_false
  - all:
      - var: item.acl
        op: not_in
        expected: [public-read, public-read-write]
"#,
        )
        .unwrap();
        match &cond {
            Condition::Any(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(&children[1], Condition::All(inner) if inner.len() == 1));
            }
            other => panic!("expected Any, got {other:?}"),
        }
        let ctx = json!({"item": {"public": true, "acl": "private"}});
        assert!(cond.evaluate(&ctx).unwrap());
    }
}
