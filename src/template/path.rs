use serde_json::Value;

/// Path that returns the context node itself.
pub const SELF_PATH: &str = "__self__";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// `name`
    Field(String),
    /// `name[]` (or `[]` on the current node)
    Flatten(String),
    /// `name[3]` (or `[3]` on the current node)
    Index(String, usize),
}

fn parse(path: &str) -> Vec<Segment> {
    path.split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|raw| {
            if let Some(name) = raw.strip_suffix("[]") {
                return Segment::Flatten(name.to_string());
            }
            if let Some(open) = raw.rfind('[') {
                if let Some(idx) = raw[open + 1..]
                    .strip_suffix(']')
                    .and_then(|n| n.trim().parse::<usize>().ok())
                {
                    return Segment::Index(raw[..open].to_string(), idx);
                }
            }
            Segment::Field(raw.to_string())
        })
        .collect()
}

/// Extract the value at `path` from `root`.
///
/// Dotted segments walk object fields. Whenever the walk meets a list, the
/// rest of the path is applied to every element and the per-element results
/// are concatenated into one flat list. Missing keys yield `None`.
pub fn extract(root: &Value, path: &str) -> Option<Value> {
    let path = path.trim();
    if path.is_empty() || path == SELF_PATH {
        return Some(root.clone());
    }
    walk(root, &parse(path))
}

fn walk(node: &Value, segments: &[Segment]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(node.clone());
    };

    match head {
        Segment::Index(name, idx) if name.is_empty() => match node {
            Value::Array(elements) => walk(elements.get(*idx)?, rest),
            _ => None,
        },
        Segment::Flatten(name) if name.is_empty() => Some(splice(node, rest)),
        _ if node.is_array() => {
            let elements = node.as_array().map(Vec::as_slice).unwrap_or_default();
            Some(Value::Array(fan_out(elements, segments)))
        }
        Segment::Field(name) => walk(node.get(name)?, rest),
        Segment::Index(name, idx) => match node.get(name)? {
            Value::Array(elements) => walk(elements.get(*idx)?, rest),
            _ => None,
        },
        Segment::Flatten(name) => Some(splice(node.get(name)?, rest)),
    }
}

/// `field[]`: flatten the list one level, then apply the remainder to each
/// element.
fn splice(node: &Value, rest: &[Segment]) -> Value {
    let mut flat = Vec::new();
    match node {
        Value::Array(elements) => {
            for element in elements {
                match element {
                    Value::Array(inner) => flat.extend(inner.iter().cloned()),
                    other => flat.push(other.clone()),
                }
            }
        }
        other => flat.push(other.clone()),
    }
    if rest.is_empty() {
        Value::Array(flat)
    } else {
        Value::Array(fan_out(&flat, rest))
    }
}

fn fan_out(elements: &[Value], segments: &[Segment]) -> Vec<Value> {
    let mut out = Vec::new();
    for element in elements {
        match walk(element, segments) {
            Some(Value::Array(values)) => out.extend(values),
            Some(value) => out.push(value),
            None => {}
        }
    }
    out
}

/// Number of values a (possibly absent) extraction result contributes when
/// concatenated.
pub fn flat_len(value: Option<&Value>) -> usize {
    match value {
        None => 0,
        Some(Value::Array(values)) => values.len(),
        Some(_) => 1,
    }
}
