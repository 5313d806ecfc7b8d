//! Variable resolution
//!
//! Precedence, lowest to highest: declared default, auto-loaded variable
//! files, explicit `--var-file` files, `LANDFORM_VAR_*` environment
//! variables, and `--var name=value` assignments. The highest source
//! present wins for each variable.

use crate::error::{Error, Result};
use crate::value::{Attributes, Value, VarType};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Default prefix for variables taken from the environment
pub const ENV_PREFIX: &str = "LANDFORM_VAR_";

/// Text shown in place of a sensitive value
pub const SENSITIVE: &str = "(sensitive)";

// ============================================================================
// Declarations
// ============================================================================

/// A `[variable.NAME]` block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableDecl {
    /// Type expression, `any` when omitted
    #[serde(rename = "type", default)]
    pub type_expr: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub validation: Vec<Validation>,
}

impl VariableDecl {
    /// Parsed declared type
    pub fn var_type(&self) -> Result<VarType> {
        self.type_expr
            .as_deref()
            .map_or(Ok(VarType::Any), VarType::parse)
    }
}

/// One validation rule; every constraint present must hold
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Validation {
    /// Regex the (string) value must match
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub one_of: Option<Vec<Value>>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Minimum length of a string, list or map
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    pub error_message: String,
}

impl Validation {
    /// Check the rule against a value
    fn check(&self, name: &str, value: &Value) -> Result<bool> {
        if let Some(pattern) = &self.pattern {
            let re = Regex::new(pattern).map_err(|e| Error::Config {
                origin: format!("variable.{name}"),
                message: format!("invalid validation pattern: {e}"),
            })?;
            match value.as_str() {
                Some(s) if re.is_match(s) => {}
                _ => return Ok(false),
            }
        }
        if let Some(allowed) = &self.one_of
            && !allowed.contains(value)
        {
            return Ok(false);
        }
        if self.min.is_some() || self.max.is_some() {
            let Some(n) = value.as_f64() else {
                return Ok(false);
            };
            if self.min.is_some_and(|min| n < min) || self.max.is_some_and(|max| n > max) {
                return Ok(false);
            }
        }
        if self.min_length.is_some() || self.max_length.is_some() {
            let len = match value {
                Value::String(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                _ => return Ok(false),
            };
            if self.min_length.is_some_and(|min| len < min)
                || self.max_length.is_some_and(|max| len > max)
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ============================================================================
// Sources
// ============================================================================

/// Where a resolved value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Default,
    File(PathBuf),
    Environment,
    CommandLine,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Environment => write!(f, "environment"),
            Self::CommandLine => write!(f, "command line"),
        }
    }
}

/// All value sources for one run
#[derive(Debug, Clone, Default)]
pub struct VariableSources {
    /// Auto-discovered variable files, in load order
    pub auto_files: Vec<(PathBuf, Attributes)>,
    /// `--var-file` files, in argument order
    pub var_files: Vec<(PathBuf, Attributes)>,
    /// Raw values from the environment, prefix stripped
    pub env: IndexMap<String, String>,
    /// Raw `--var` assignments, in argument order
    pub cli: Vec<(String, String)>,
}

impl VariableSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect `PREFIX*` variables from the process environment
    pub fn with_process_env(self, prefix: &str) -> Self {
        self.with_env(std::env::vars(), prefix)
    }

    /// Collect `PREFIX*` variables from the given pairs
    pub fn with_env(mut self, vars: impl IntoIterator<Item = (String, String)>, prefix: &str) -> Self {
        for (key, value) in vars {
            if let Some(name) = key.strip_prefix(prefix)
                && !name.is_empty()
            {
                self.env.insert(name.to_string(), value);
            }
        }
        self
    }

    /// Add a `name=value` assignment
    pub fn assign(&mut self, assignment: &str) -> Result<()> {
        let (name, value) = parse_assignment(assignment)?;
        self.cli.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Add an explicit variable file
    pub fn add_var_file(&mut self, path: &Path) -> Result<()> {
        let values = load_var_file(path)?;
        self.var_files.push((path.to_path_buf(), values));
        Ok(())
    }

    /// Add an auto-discovered variable file
    pub fn add_auto_file(&mut self, path: &Path) -> Result<()> {
        let values = load_var_file(path)?;
        self.auto_files.push((path.to_path_buf(), values));
        Ok(())
    }

    fn assigned_names(&self) -> impl Iterator<Item = (&str, String)> {
        let files = self
            .auto_files
            .iter()
            .chain(&self.var_files)
            .flat_map(|(path, values)| {
                values
                    .keys()
                    .map(move |k| (k.as_str(), path.display().to_string()))
            });
        let cli = self.cli.iter().map(|(k, _)| (k.as_str(), "--var".to_string()));
        files.chain(cli)
    }
}

/// Split `name=value`; the value may itself contain `=`
pub fn parse_assignment(assignment: &str) -> Result<(&str, &str)> {
    match assignment.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value)),
        _ => Err(Error::Config {
            origin: "--var".to_string(),
            message: format!("expected NAME=VALUE, got `{assignment}`"),
        }),
    }
}

/// Read a TOML variable file into typed values
pub fn load_var_file(path: &Path) -> Result<Attributes> {
    let content = fs::read_to_string(path).map_err(Error::io(path))?;
    toml::from_str(&content).map_err(|source| Error::Toml {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// Resolution
// ============================================================================

/// One resolved variable
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedVariable {
    pub value: Value,
    pub sensitive: bool,
    pub source: Source,
}

/// Variables of one run, immutable once resolved
#[derive(Debug, Clone, Default)]
pub struct ResolvedVariables {
    values: IndexMap<String, ResolvedVariable>,
}

impl ResolvedVariables {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).map(|v| &v.value)
    }

    pub fn variable(&self, name: &str) -> Option<&ResolvedVariable> {
        self.values.get(name)
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.values.get(name).is_some_and(|v| v.sensitive)
    }

    /// Printable value, `(sensitive)` for sensitive variables
    pub fn display(&self, name: &str) -> Option<String> {
        self.values.get(name).map(|v| {
            if v.sensitive {
                SENSITIVE.to_string()
            } else {
                v.value.to_string()
            }
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResolvedVariable)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

enum Candidate<'a> {
    Typed(&'a Value),
    Raw(&'a str),
}

/// Resolve every declared variable against the sources
pub fn resolve(
    decls: &IndexMap<String, VariableDecl>,
    sources: &VariableSources,
) -> Result<ResolvedVariables> {
    for (name, origin) in sources.assigned_names() {
        if !decls.contains_key(name) {
            log::warn!("Value for undeclared variable `{name}` ({origin}) is ignored");
        }
    }

    let mut values = IndexMap::with_capacity(decls.len());
    for (name, decl) in decls {
        let var_type = decl.var_type()?;
        let (candidate, source) = pick(name, decl, sources)?;

        let value = match candidate {
            Candidate::Raw(raw) => var_type.coerce(raw).ok_or_else(|| Error::TypeMismatch {
                name: name.clone(),
                expected: var_type.to_string(),
                found: "unparseable text".to_string(),
            })?,
            Candidate::Typed(v) => v.clone(),
        };
        var_type.check(&value).map_err(|e| Error::TypeMismatch {
            name: format!("{name}{}", e.path),
            expected: e.expected,
            found: e.found,
        })?;

        for rule in &decl.validation {
            if !rule.check(name, &value)? {
                return Err(Error::ValidationFailed {
                    name: name.clone(),
                    message: rule.error_message.clone(),
                });
            }
        }

        log::debug!("var.{name} set from {source}");
        values.insert(
            name.clone(),
            ResolvedVariable {
                value,
                sensitive: decl.sensitive,
                source,
            },
        );
    }
    Ok(ResolvedVariables { values })
}

fn pick<'a>(
    name: &str,
    decl: &'a VariableDecl,
    sources: &'a VariableSources,
) -> Result<(Candidate<'a>, Source)> {
    if let Some((_, raw)) = sources.cli.iter().rev().find(|(k, _)| k == name) {
        return Ok((Candidate::Raw(raw), Source::CommandLine));
    }
    if let Some(raw) = sources.env.get(name) {
        return Ok((Candidate::Raw(raw), Source::Environment));
    }
    for (path, values) in sources.var_files.iter().rev().chain(sources.auto_files.iter().rev()) {
        if let Some(v) = values.get(name) {
            return Ok((Candidate::Typed(v), Source::File(path.clone())));
        }
    }
    match &decl.default {
        Some(v) => Ok((Candidate::Typed(v), Source::Default)),
        None => Err(Error::MissingVariable {
            name: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn decl(type_expr: &str, default: Option<Value>) -> VariableDecl {
        VariableDecl {
            type_expr: Some(type_expr.to_string()),
            default,
            ..Default::default()
        }
    }

    fn decls(items: Vec<(&str, VariableDecl)>) -> IndexMap<String, VariableDecl> {
        items.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn file(values: &[(&str, Value)]) -> (PathBuf, Attributes) {
        (
            PathBuf::from("test.vars.toml"),
            values.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect(),
        )
    }

    #[test]
    fn test_default_used_without_sources() {
        let d = decls(vec![("instance_type", decl("string", Some("t2.micro".into())))]);
        let resolved = resolve(&d, &VariableSources::new()).unwrap();
        assert_eq!(resolved.get("instance_type"), Some(&Value::from("t2.micro")));
        assert_eq!(resolved.variable("instance_type").unwrap().source, Source::Default);
    }

    #[test]
    fn test_command_line_beats_file() {
        let d = decls(vec![("instance_type", decl("string", Some("t2.micro".into())))]);
        let mut sources = VariableSources::new();
        sources.var_files.push(file(&[("instance_type", "t2.medium".into())]));
        sources.assign("instance_type=t2.large").unwrap();
        let resolved = resolve(&d, &sources).unwrap();
        assert_eq!(resolved.get("instance_type"), Some(&Value::from("t2.large")));
    }

    #[test]
    fn test_full_precedence_chain() {
        let d = decls(vec![("v", decl("string", Some("default".into())))]);
        let mut sources = VariableSources::new();
        sources.auto_files.push(file(&[("v", "auto".into())]));
        assert_eq!(resolve(&d, &sources).unwrap().get("v"), Some(&Value::from("auto")));

        sources.var_files.push(file(&[("v", "file".into())]));
        assert_eq!(resolve(&d, &sources).unwrap().get("v"), Some(&Value::from("file")));

        let sources = sources.with_env(
            [("LANDFORM_VAR_v".to_string(), "env".to_string())],
            ENV_PREFIX,
        );
        assert_eq!(resolve(&d, &sources).unwrap().get("v"), Some(&Value::from("env")));

        let mut sources = sources;
        sources.assign("v=first").unwrap();
        sources.assign("v=cli").unwrap();
        let resolved = resolve(&d, &sources).unwrap();
        assert_eq!(resolved.get("v"), Some(&Value::from("cli")));
        assert_eq!(resolved.variable("v").unwrap().source, Source::CommandLine);
    }

    #[test]
    fn test_missing_variable() {
        let d = decls(vec![("region", decl("string", None))]);
        let err = resolve(&d, &VariableSources::new()).unwrap_err();
        assert!(matches!(err, Error::MissingVariable { name } if name == "region"));
    }

    #[test]
    fn test_raw_values_are_coerced() {
        let d = decls(vec![
            ("count", decl("number", None)),
            ("enabled", decl("bool", None)),
            ("zones", decl("list(string)", None)),
        ]);
        let mut sources = VariableSources::new();
        sources.assign("count=3").unwrap();
        sources.assign("enabled=true").unwrap();
        sources.assign(r#"zones=["a","b"]"#).unwrap();
        let resolved = resolve(&d, &sources).unwrap();
        assert_eq!(resolved.get("count"), Some(&Value::Number(3.0)));
        assert_eq!(resolved.get("enabled"), Some(&Value::Bool(true)));
        assert_eq!(
            resolved.get("zones"),
            Some(&Value::List(vec!["a".into(), "b".into()]))
        );

        let mut bad = VariableSources::new();
        bad.assign("count=many").unwrap();
        bad.assign("enabled=true").unwrap();
        bad.assign("zones=[]").unwrap();
        assert!(matches!(resolve(&d, &bad), Err(Error::TypeMismatch { name, .. }) if name == "count"));
    }

    #[test]
    fn test_nested_type_mismatch_names_path() {
        let d = decls(vec![("ports", decl("list(number)", None))]);
        let mut sources = VariableSources::new();
        sources.var_files.push(file(&[(
            "ports",
            Value::List(vec![Value::Number(80.0), "http".into()]),
        )]));
        match resolve(&d, &sources).unwrap_err() {
            Error::TypeMismatch { name, expected, found } => {
                assert_eq!(name, "ports[1]");
                assert_eq!(expected, "number");
                assert_eq!(found, "string");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_validation_rules() {
        let mut v = decl("string", Some("t2.micro".into()));
        v.validation.push(Validation {
            pattern: Some("^t[23]\\.".into()),
            error_message: "must be a t2 or t3 type".into(),
            ..Default::default()
        });
        let d = decls(vec![("instance_type", v)]);
        assert!(resolve(&d, &VariableSources::new()).is_ok());

        let mut sources = VariableSources::new();
        sources.assign("instance_type=m5.large").unwrap();
        match resolve(&d, &sources).unwrap_err() {
            Error::ValidationFailed { name, message } => {
                assert_eq!(name, "instance_type");
                assert_eq!(message, "must be a t2 or t3 type");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_numeric_and_length_validation() {
        let rule = Validation {
            min: Some(1.0),
            max: Some(10.0),
            error_message: "out of range".into(),
            ..Default::default()
        };
        assert!(rule.check("n", &Value::Number(5.0)).unwrap());
        assert!(!rule.check("n", &Value::Number(11.0)).unwrap());

        let rule = Validation {
            min_length: Some(2),
            one_of: None,
            error_message: "too short".into(),
            ..Default::default()
        };
        assert!(!rule.check("s", &Value::from("a")).unwrap());
        assert!(rule.check("s", &Value::List(vec![1_i64.into(), 2_i64.into()])).unwrap());

        let rule = Validation {
            one_of: Some(vec!["dev".into(), "prod".into()]),
            error_message: "unknown env".into(),
            ..Default::default()
        };
        assert!(rule.check("e", &Value::from("prod")).unwrap());
        assert!(!rule.check("e", &Value::from("qa")).unwrap());
    }

    #[test]
    fn test_sensitive_display_is_redacted() {
        let mut secret = decl("string", None);
        secret.sensitive = true;
        let d = decls(vec![("db_password", secret)]);
        let mut sources = VariableSources::new();
        sources.assign("db_password=hunter2").unwrap();
        let resolved = resolve(&d, &sources).unwrap();
        assert!(resolved.is_sensitive("db_password"));
        assert_eq!(resolved.display("db_password").unwrap(), SENSITIVE);

        let mut v = decl("string", None);
        v.sensitive = true;
        v.validation.push(Validation {
            min_length: Some(12),
            error_message: "password too short".into(),
            ..Default::default()
        });
        let err = resolve(&decls(vec![("db_password", v)]), &sources).unwrap_err();
        assert!(!err.to_string().contains("hunter2"));
    }

    #[test]
    fn test_load_var_file_and_env_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prod.vars.toml");
        fs::write(&path, "instance_type = \"t2.medium\"\ncount = 2\n").unwrap();
        let mut sources = VariableSources::new();
        sources.add_var_file(&path).unwrap();
        assert_eq!(sources.var_files[0].1["count"], Value::Number(2.0));

        let sources = VariableSources::new().with_env(
            [
                ("LANDFORM_VAR_region".to_string(), "eu-west-1".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ],
            ENV_PREFIX,
        );
        assert_eq!(sources.env.len(), 1);
        assert_eq!(sources.env["region"], "eu-west-1");
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(parse_assignment("a=b=c").unwrap(), ("a", "b=c"));
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=x").is_err());
    }
}
