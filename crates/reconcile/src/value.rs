//! Attribute values and declared variable types

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A configuration value.
///
/// Objects are represented as maps and tuples as lists; the distinction only
/// exists in the declared [`VarType`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

/// Ordered attribute mapping of a node
pub type Attributes = IndexMap<String, Value>;

impl Value {
    /// Short name of the value's kind, used in type errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Walk a path of map keys and list indices
    pub fn lookup_path(&self, path: &[String]) -> Option<&Value> {
        let mut current = self;
        for segment in path {
            current = match current {
                Self::Map(map) => map.get(segment)?,
                Self::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Render the value as a string for interpolation into a larger template
    pub fn to_template_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            Self::String(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} = {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<Attributes> for Value {
    fn from(map: Attributes) -> Self {
        Self::Map(map)
    }
}

// ============================================================================
// Declared types
// ============================================================================

/// Declared type of a variable
#[derive(Debug, Clone, PartialEq, Default)]
pub enum VarType {
    #[default]
    Any,
    String,
    Number,
    Bool,
    List(Box<VarType>),
    Set(Box<VarType>),
    Map(Box<VarType>),
    Tuple(Vec<VarType>),
    Object(IndexMap<String, VarType>),
}

/// Where and why a value failed a type check
#[derive(Debug, Clone, PartialEq)]
pub struct TypeError {
    /// Path into the value (`[1]`, `.port`), empty at the root
    pub path: String,
    pub expected: String,
    pub found: String,
}

impl VarType {
    /// Parse a type expression such as `list(string)` or `object({ port = number })`
    pub fn parse(expr: &str) -> Result<Self> {
        let mut parser = TypeParser { src: expr, pos: 0 };
        let ty = parser.parse_type()?;
        parser.skip_ws();
        if parser.pos != expr.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(ty)
    }

    /// Check a value against this type
    pub fn check(&self, value: &Value) -> std::result::Result<(), TypeError> {
        self.check_at(value, String::new())
    }

    fn check_at(&self, value: &Value, path: String) -> std::result::Result<(), TypeError> {
        let mismatch = |path: String| TypeError {
            path,
            expected: self.to_string(),
            found: value.type_name().to_string(),
        };

        match (self, value) {
            (Self::Any, _) => Ok(()),
            (Self::String, Value::String(_))
            | (Self::Number, Value::Number(_))
            | (Self::Bool, Value::Bool(_)) => Ok(()),
            (Self::List(elem) | Self::Set(elem), Value::List(items)) => {
                for (i, item) in items.iter().enumerate() {
                    elem.check_at(item, format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            (Self::Map(elem), Value::Map(map)) => {
                for (k, v) in map {
                    elem.check_at(v, format!("{path}.{k}"))?;
                }
                Ok(())
            }
            (Self::Tuple(elems), Value::List(items)) => {
                if elems.len() != items.len() {
                    return Err(TypeError {
                        path,
                        expected: self.to_string(),
                        found: format!("list of {} elements", items.len()),
                    });
                }
                for (i, (ty, item)) in elems.iter().zip(items).enumerate() {
                    ty.check_at(item, format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            (Self::Object(fields), Value::Map(map)) => {
                for (name, ty) in fields {
                    match map.get(name) {
                        Some(v) => ty.check_at(v, format!("{path}.{name}"))?,
                        None => {
                            return Err(TypeError {
                                path,
                                expected: self.to_string(),
                                found: format!("map without attribute `{name}`"),
                            });
                        }
                    }
                }
                Ok(())
            }
            _ => Err(mismatch(path)),
        }
    }

    /// Convert a raw string (from the environment or a command-line flag)
    /// into a value of this type. Returns `None` if the text cannot be read.
    pub fn coerce(&self, raw: &str) -> Option<Value> {
        match self {
            Self::String => Some(Value::String(raw.to_string())),
            Self::Number => raw.trim().parse::<f64>().ok().map(Value::Number),
            Self::Bool => match raw.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            Self::Any => Some(
                serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.into())),
            ),
            _ => serde_json::from_str::<Value>(raw).ok(),
        }
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::String => write!(f, "string"),
            Self::Number => write!(f, "number"),
            Self::Bool => write!(f, "bool"),
            Self::List(t) => write!(f, "list({t})"),
            Self::Set(t) => write!(f, "set({t})"),
            Self::Map(t) => write!(f, "map({t})"),
            Self::Tuple(ts) => {
                let parts: Vec<String> = ts.iter().map(ToString::to_string).collect();
                write!(f, "tuple([{}])", parts.join(", "))
            }
            Self::Object(fields) => {
                let parts: Vec<String> = fields.iter().map(|(k, t)| format!("{k} = {t}")).collect();
                write!(f, "object({{{}}})", parts.join(", "))
            }
        }
    }
}

struct TypeParser<'a> {
    src: &'a str,
    pos: usize,
}

impl TypeParser<'_> {
    fn error(&self, reason: &str) -> Error {
        Error::InvalidType {
            expr: self.src.to_string(),
            reason: format!("{reason} at offset {}", self.pos),
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn expect(&mut self, c: char) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(self.error(&format!("expected `{c}`")))
        }
    }

    fn ident(&mut self) -> Result<&str> {
        self.skip_ws();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected an identifier"));
        }
        Ok(&self.src[start..self.pos])
    }

    fn parse_type(&mut self) -> Result<VarType> {
        let name = self.ident()?.to_string();
        match name.as_str() {
            "any" => Ok(VarType::Any),
            "string" => Ok(VarType::String),
            "number" => Ok(VarType::Number),
            "bool" => Ok(VarType::Bool),
            "list" | "set" | "map" => {
                self.expect('(')?;
                let inner = Box::new(self.parse_type()?);
                self.expect(')')?;
                Ok(match name.as_str() {
                    "list" => VarType::List(inner),
                    "set" => VarType::Set(inner),
                    _ => VarType::Map(inner),
                })
            }
            "tuple" => {
                self.expect('(')?;
                self.expect('[')?;
                let mut elems = Vec::new();
                self.skip_ws();
                if self.peek() != Some(']') {
                    loop {
                        elems.push(self.parse_type()?);
                        self.skip_ws();
                        if self.peek() == Some(',') {
                            self.pos += 1;
                            continue;
                        }
                        break;
                    }
                }
                self.expect(']')?;
                self.expect(')')?;
                Ok(VarType::Tuple(elems))
            }
            "object" => {
                self.expect('(')?;
                self.expect('{')?;
                let mut fields = IndexMap::new();
                self.skip_ws();
                if self.peek() != Some('}') {
                    loop {
                        let key = self.ident()?.to_string();
                        self.expect('=')?;
                        let ty = self.parse_type()?;
                        fields.insert(key, ty);
                        self.skip_ws();
                        if self.peek() == Some(',') {
                            self.pos += 1;
                            continue;
                        }
                        break;
                    }
                }
                self.expect('}')?;
                self.expect(')')?;
                Ok(VarType::Object(fields))
            }
            other => Err(self.error(&format!("unknown type `{other}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_types() {
        assert_eq!(VarType::parse("string").unwrap(), VarType::String);
        assert_eq!(
            VarType::parse("list(map(number))").unwrap(),
            VarType::List(Box::new(VarType::Map(Box::new(VarType::Number))))
        );
        let obj = VarType::parse("object({ name = string, ports = list(number) })").unwrap();
        assert_eq!(obj.to_string(), "object({name = string, ports = list(number)})");
        let tuple = VarType::parse("tuple([string, bool])").unwrap();
        assert_eq!(tuple, VarType::Tuple(vec![VarType::String, VarType::Bool]));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            VarType::parse("strin"),
            Err(Error::InvalidType { .. })
        ));
        assert!(VarType::parse("list(string").is_err());
        assert!(VarType::parse("string extra").is_err());
    }

    #[test]
    fn test_check_reports_nested_path() {
        let ty = VarType::parse("list(number)").unwrap();
        let value = Value::List(vec![Value::Number(1.0), Value::from("two")]);
        let err = ty.check(&value).unwrap_err();
        assert_eq!(err.path, "[1]");
        assert_eq!(err.expected, "number");
        assert_eq!(err.found, "string");
    }

    #[test]
    fn test_check_object_requires_declared_attributes() {
        let ty = VarType::parse("object({ name = string })").unwrap();
        let mut map = Attributes::new();
        map.insert("other".into(), Value::from("x"));
        assert!(ty.check(&Value::Map(map.clone())).is_err());
        map.insert("name".into(), Value::from("web"));
        assert!(ty.check(&Value::Map(map)).is_ok());
    }

    #[test]
    fn test_coerce_raw_strings() {
        assert_eq!(VarType::Number.coerce("3"), Some(Value::Number(3.0)));
        assert_eq!(VarType::Number.coerce("three"), None);
        assert_eq!(VarType::Bool.coerce("true"), Some(Value::Bool(true)));
        assert_eq!(
            VarType::parse("list(string)").unwrap().coerce(r#"["a","b"]"#),
            Some(Value::List(vec![Value::from("a"), Value::from("b")]))
        );
        assert_eq!(VarType::Any.coerce("plain"), Some(Value::from("plain")));
    }

    #[test]
    fn test_display_numbers_without_fraction() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::from("x").to_template_string(), "x");
    }
}
