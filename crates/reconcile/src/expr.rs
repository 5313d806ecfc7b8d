//! `${...}` interpolation and references
//!
//! String attributes may embed references to variables (`var.region`),
//! other nodes (`aws_instance.web.public_ip`, `data.aws_ami.ubuntu.id`,
//! `module.vpc.subnet_id`) or, inside hooks, the owning node (`self.id`).

use crate::error::{Error, Result};
use crate::value::Value;
use std::fmt;

/// A parsed reference expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `var.NAME`
    Variable(String),
    /// A node address plus an optional attribute path
    Node { address: String, path: Vec<String> },
    /// `self.PATH`, only meaningful inside hooks
    SelfAttr(Vec<String>),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Variable(name) => write!(f, "var.{name}"),
            Self::Node { address, path } if path.is_empty() => write!(f, "{address}"),
            Self::Node { address, path } => write!(f, "{address}.{}", path.join(".")),
            Self::SelfAttr(path) => write!(f, "self.{}", path.join(".")),
        }
    }
}

/// Piece of a template string
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Interpolation(Reference),
}

fn valid_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse the inside of a `${...}` interpolation
pub fn parse_reference(expr: &str) -> Result<Reference> {
    let invalid = |reason: &str| Error::InvalidReference {
        expr: expr.to_string(),
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = expr.trim().split('.').collect();
    if let Some(bad) = parts.iter().find(|p| !valid_ident(p)) {
        return Err(invalid(&format!("`{bad}` is not a valid name")));
    }
    let owned = |ps: &[&str]| ps.iter().map(|p| (*p).to_string()).collect::<Vec<_>>();

    match parts.as_slice() {
        ["var", name] => Ok(Reference::Variable((*name).to_string())),
        ["var", ..] => Err(invalid("variable references take the form var.NAME")),
        ["self", rest @ ..] if !rest.is_empty() => Ok(Reference::SelfAttr(owned(rest))),
        ["data", ty, name, rest @ ..] => Ok(Reference::Node {
            address: format!("data.{ty}.{name}"),
            path: owned(rest),
        }),
        ["module", name, rest @ ..] => Ok(Reference::Node {
            address: format!("module.{name}"),
            path: owned(rest),
        }),
        [ty, name, rest @ ..] if !matches!(*ty, "data" | "self") => Ok(Reference::Node {
            address: format!("{ty}.{name}"),
            path: owned(rest),
        }),
        _ => Err(invalid("expected TYPE.NAME, var.NAME, module.NAME or data.TYPE.NAME")),
    }
}

fn split_template(s: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        // `$${` escapes a literal `${`
        if start > 0 && rest.as_bytes()[start - 1] == b'$' {
            literal.push_str(&rest[..start - 1]);
            literal.push_str("${");
            rest = &rest[start + 2..];
            continue;
        }
        literal.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| Error::InvalidReference {
            expr: s.to_string(),
            reason: "unterminated `${`".to_string(),
        })?;
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Interpolation(parse_reference(&after[..end])?));
        rest = &after[end + 1..];
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Collect every reference found in the strings of a value
pub fn collect_references(value: &Value, out: &mut Vec<Reference>) -> Result<()> {
    match value {
        Value::String(s) => {
            for segment in split_template(s)? {
                if let Segment::Interpolation(r) = segment {
                    out.push(r);
                }
            }
        }
        Value::List(items) => {
            for item in items {
                collect_references(item, out)?;
            }
        }
        Value::Map(map) => {
            for v in map.values() {
                collect_references(v, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// References found in a single string
pub fn string_references(s: &str) -> Result<Vec<Reference>> {
    let mut out = Vec::new();
    collect_references(&Value::String(s.to_string()), &mut out)?;
    Ok(out)
}

/// Addresses of the nodes a value references; malformed templates yield none
pub fn node_addresses(value: &Value) -> Vec<String> {
    let mut refs = Vec::new();
    if collect_references(value, &mut refs).is_err() {
        return Vec::new();
    }
    refs.into_iter()
        .filter_map(|r| match r {
            Reference::Node { address, .. } => Some(address),
            _ => None,
        })
        .collect()
}

/// Substitute references inside a value.
///
/// The resolver returns `Ok(None)` to leave a reference in place (it is
/// re-emitted as `${...}`), or an error to abort. A string consisting of a
/// single interpolation takes the resolved value with its type intact.
pub fn interpolate<F>(value: &Value, resolve: &mut F) -> Result<Value>
where
    F: FnMut(&Reference) -> Result<Option<Value>>,
{
    match value {
        Value::String(s) => interpolate_str(s, resolve),
        Value::List(items) => items
            .iter()
            .map(|item| interpolate(item, resolve))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        Value::Map(map) => {
            let mut out = indexmap::IndexMap::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate(v, resolve)?);
            }
            Ok(Value::Map(out))
        }
        other => Ok(other.clone()),
    }
}

/// String form of [`interpolate`]
pub fn interpolate_str<F>(s: &str, resolve: &mut F) -> Result<Value>
where
    F: FnMut(&Reference) -> Result<Option<Value>>,
{
    if !s.contains("${") {
        return Ok(Value::String(s.to_string()));
    }
    let segments = split_template(s)?;

    if let [Segment::Interpolation(r)] = segments.as_slice() {
        return Ok(resolve(r)?.unwrap_or_else(|| Value::String(format!("${{{r}}}"))));
    }

    let mut out = String::new();
    for segment in &segments {
        match segment {
            Segment::Literal(text) => out.push_str(&text.replace("${", "$${")),
            Segment::Interpolation(r) => match resolve(r)? {
                Some(v) => out.push_str(&v.to_template_string()),
                None => out.push_str(&format!("${{{r}}}")),
            },
        }
    }
    Ok(Value::String(out))
}

/// Protect literal `${` in a substituted value from later passes
pub fn escape(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace("${", "$${")),
        Value::List(items) => Value::List(items.into_iter().map(escape).collect()),
        Value::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, escape(v))).collect()),
        other => other,
    }
}

/// Turn `$${` escapes back into literal `${` once no further pass will run
pub fn unescape(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace("$${", "${")),
        Value::List(items) => Value::List(items.into_iter().map(unescape).collect()),
        Value::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, unescape(v))).collect()),
        other => other,
    }
}
