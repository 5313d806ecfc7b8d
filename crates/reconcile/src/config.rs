//! Configuration loading
//!
//! A configuration is one `*.lf.toml` file or a directory of them, merged in
//! lexical order. Variables are substituted when nodes are produced; node
//! references stay in place for the executor.

use crate::error::{Error, Result};
use crate::expr::{self, Reference};
use crate::hooks::Hook;
use crate::planner::ReplacePolicy;
use crate::retry::RetryConfig;
use crate::state::{OutputValue, StateSnapshot};
use crate::types::{Lifecycle, Node, NodeKind};
use crate::value::{Attributes, Value};
use crate::variables::{ENV_PREFIX, ResolvedVariables, VariableDecl, VariableSources};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

/// Extension of configuration files
pub const CONFIG_EXTENSION: &str = ".lf.toml";

/// Variable file loaded automatically when present
pub const AUTO_VARS_FILE: &str = "landform.vars.toml";

/// Suffix of additional auto-loaded variable files
pub const AUTO_VARS_SUFFIX: &str = ".auto.vars.toml";

// ============================================================================
// Settings
// ============================================================================

/// The `[settings]` block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// State file, relative to the configuration directory
    pub state_path: String,
    /// Maximum changes applied at once
    pub parallelism: usize,
    /// Extra attempts to take a held state lock
    pub lock_retries: u32,
    /// Delay before the first lock retry; doubles per attempt
    pub lock_retry_delay_ms: u64,
    /// Prefix of environment variables that set input variables
    pub env_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_path: "landform.state.json".to_string(),
            parallelism: 4,
            lock_retries: 3,
            lock_retry_delay_ms: 500,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }
}

impl Settings {
    /// Retry policy for taking the state lock
    pub fn lock_retry(&self) -> RetryConfig {
        RetryConfig::new(
            self.lock_retries + 1,
            Duration::from_millis(self.lock_retry_delay_ms),
            2.0,
        )
    }
}

// ============================================================================
// Raw file layout
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    #[serde(default)]
    settings: Option<Settings>,
    #[serde(default)]
    variable: IndexMap<String, VariableDecl>,
    #[serde(default)]
    resource: Vec<RawNode>,
    #[serde(default)]
    data: Vec<RawNode>,
    #[serde(default)]
    module: Vec<RawModule>,
    #[serde(default)]
    output: IndexMap<String, OutputDecl>,
    #[serde(default)]
    policy: Option<ReplacePolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNode {
    #[serde(rename = "type")]
    node_type: String,
    name: String,
    #[serde(default)]
    attributes: Attributes,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    lifecycle: Lifecycle,
    #[serde(default, rename = "hook")]
    hooks: Vec<Hook>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModule {
    name: String,
    source: String,
    #[serde(default)]
    inputs: Attributes,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// A `[output.NAME]` block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputDecl {
    pub value: Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
}

/// A node as declared, before variables are substituted
#[derive(Debug, Clone)]
struct Declaration {
    node: Node,
    origin: PathBuf,
}

// ============================================================================
// Configuration
// ============================================================================

/// A loaded, merged configuration
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    /// Directory the configuration lives in
    pub root: PathBuf,
    /// Files merged, in load order
    pub files: Vec<PathBuf>,
    pub settings: Settings,
    pub variables: IndexMap<String, VariableDecl>,
    pub outputs: IndexMap<String, OutputDecl>,
    pub policy: ReplacePolicy,
    declarations: Vec<Declaration>,
    settings_origin: Option<PathBuf>,
}

impl Configuration {
    /// Load a single file or every `*.lf.toml` file in a directory
    pub fn load(path: &Path) -> Result<Self> {
        let (root, files) = if path.is_dir() {
            (path.to_path_buf(), config_files(path)?)
        } else {
            let root = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            (root, vec![path.to_path_buf()])
        };
        if files.is_empty() {
            return Err(Error::Config {
                origin: path.display().to_string(),
                message: format!("no *{CONFIG_EXTENSION} files found"),
            });
        }

        let mut config = Self {
            root,
            policy: ReplacePolicy::builtin(),
            ..Default::default()
        };
        for file in files {
            let content = fs::read_to_string(&file).map_err(Error::io(&file))?;
            let raw: RawFile = toml::from_str(&content).map_err(|source| Error::Toml {
                path: file.clone(),
                source,
            })?;
            config.merge(&file, raw)?;
            config.files.push(file);
        }
        log::debug!(
            "Loaded {} nodes and {} variables from {} file(s)",
            config.declarations.len(),
            config.variables.len(),
            config.files.len()
        );
        Ok(config)
    }

    /// Parse configuration text; the root is the current directory
    pub fn parse(content: &str) -> Result<Self> {
        let origin = PathBuf::from("<inline>");
        let raw: RawFile = toml::from_str(content).map_err(|source| Error::Toml {
            path: origin.clone(),
            source,
        })?;
        let mut config = Self {
            root: PathBuf::from("."),
            policy: ReplacePolicy::builtin(),
            ..Default::default()
        };
        config.merge(&origin, raw)?;
        config.files.push(origin);
        Ok(config)
    }

    fn merge(&mut self, origin: &Path, raw: RawFile) -> Result<()> {
        if let Some(settings) = raw.settings {
            if let Some(previous) = &self.settings_origin {
                return Err(Error::Config {
                    origin: origin.display().to_string(),
                    message: format!("[settings] already declared in {}", previous.display()),
                });
            }
            self.settings = settings;
            self.settings_origin = Some(origin.to_path_buf());
        }

        for (name, decl) in raw.variable {
            if self.variables.contains_key(&name) {
                return Err(Error::DuplicateDeclaration {
                    name: format!("var.{name}"),
                });
            }
            decl.var_type()?;
            self.variables.insert(name, decl);
        }

        for (name, decl) in raw.output {
            if self.outputs.contains_key(&name) {
                return Err(Error::DuplicateDeclaration {
                    name: format!("output.{name}"),
                });
            }
            self.outputs.insert(name, decl);
        }

        if let Some(policy) = raw.policy {
            self.policy.merge(&policy);
        }

        let nodes = raw
            .resource
            .into_iter()
            .map(|r| r.into_node(NodeKind::Resource))
            .chain(raw.data.into_iter().map(|d| d.into_node(NodeKind::DataSource)))
            .chain(raw.module.into_iter().map(RawModule::into_node));
        for node in nodes {
            let node = node.map_err(|message| Error::Config {
                origin: origin.display().to_string(),
                message,
            })?;
            if self.declarations.iter().any(|d| d.node.id == node.id) {
                return Err(Error::DuplicateDeclaration { name: node.id });
            }
            self.declarations.push(Declaration {
                node,
                origin: origin.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Number of declared nodes
    pub fn node_count(&self) -> usize {
        self.declarations.len()
    }

    /// File a node was declared in
    pub fn origin_of(&self, id: &str) -> Option<&Path> {
        self.declarations
            .iter()
            .find(|d| d.node.id == id)
            .map(|d| d.origin.as_path())
    }

    /// State file path, resolved against the configuration directory
    pub fn state_path(&self) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(&self.settings.state_path).as_ref());
        if expanded.is_absolute() {
            expanded
        } else {
            self.root.join(expanded)
        }
    }

    /// Auto-loaded variable files in the configuration directory:
    /// `landform.vars.toml`, then `*.auto.vars.toml` in lexical order
    pub fn auto_var_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let base = self.root.join(AUTO_VARS_FILE);
        if base.is_file() {
            files.push(base);
        }
        for entry in WalkDir::new(&self.root)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
        {
            let entry = entry.map_err(|e| Error::Config {
                origin: self.root.display().to_string(),
                message: e.to_string(),
            })?;
            if entry.file_type().is_file()
                && entry.file_name().to_string_lossy().ends_with(AUTO_VARS_SUFFIX)
            {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    /// Gather variable sources: auto files, explicit files, the environment
    /// and `name=value` assignments
    pub fn sources(&self, var_files: &[PathBuf], assignments: &[String]) -> Result<VariableSources> {
        let mut sources = VariableSources::new().with_process_env(&self.settings.env_prefix);
        for path in self.auto_var_files()? {
            sources.add_auto_file(&path)?;
        }
        for path in var_files {
            sources.add_var_file(path)?;
        }
        for assignment in assignments {
            sources.assign(assignment)?;
        }
        Ok(sources)
    }

    /// Nodes with every variable reference substituted
    pub fn nodes(&self, vars: &ResolvedVariables) -> Result<Vec<Node>> {
        self.declarations
            .iter()
            .map(|d| substitute(&d.node, vars))
            .collect()
    }

    /// Evaluate root outputs against applied state
    pub fn evaluate_outputs(
        &self,
        vars: &ResolvedVariables,
        state: &StateSnapshot,
    ) -> Result<IndexMap<String, OutputValue>> {
        let mut out = IndexMap::with_capacity(self.outputs.len());
        for (name, decl) in &self.outputs {
            let owner = format!("output.{name}");
            let mut sensitive = decl.sensitive;
            let mut resolve = |r: &Reference| -> Result<Option<Value>> {
                match r {
                    Reference::Variable(var) => {
                        sensitive |= vars.is_sensitive(var);
                        vars.get(var).cloned().map(Some).ok_or_else(|| unknown(&owner, r))
                    }
                    Reference::Node { address, path } => {
                        let record = state.get(address).ok_or_else(|| unknown(&owner, r))?;
                        if path.first().is_some_and(|p| record.sensitive_attributes.contains(p)) {
                            sensitive = true;
                        }
                        let exposed = record.exposed_value();
                        exposed.lookup_path(path).cloned().map(Some).ok_or_else(|| {
                            Error::InvalidReference {
                                expr: r.to_string(),
                                reason: format!("{address} has no such attribute"),
                            }
                        })
                    }
                    Reference::SelfAttr(_) => Err(Error::InvalidReference {
                        expr: r.to_string(),
                        reason: "`self` is only valid inside hooks".to_string(),
                    }),
                }
            };
            let value = expr::unescape(expr::interpolate(&decl.value, &mut resolve)?);
            out.insert(name.clone(), OutputValue { value, sensitive });
        }
        Ok(out)
    }

    /// Check that outputs only reference declared variables and nodes
    pub fn check_outputs(&self, node_ids: &BTreeSet<String>) -> Result<()> {
        for (name, decl) in &self.outputs {
            let mut refs = Vec::new();
            expr::collect_references(&decl.value, &mut refs)?;
            for r in refs {
                let known = match &r {
                    Reference::Variable(var) => self.variables.contains_key(var),
                    Reference::Node { address, .. } => node_ids.contains(address),
                    Reference::SelfAttr(_) => false,
                };
                if !known {
                    return Err(unknown(&format!("output.{name}"), &r));
                }
            }
        }
        Ok(())
    }
}

fn unknown(owner: &str, r: &Reference) -> Error {
    Error::UnknownReference {
        node: owner.to_string(),
        reference: r.to_string(),
    }
}

fn config_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Config {
            origin: dir.display().to_string(),
            message: e.to_string(),
        })?;
        if entry.file_type().is_file()
            && entry.file_name().to_string_lossy().ends_with(CONFIG_EXTENSION)
        {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn valid_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl RawNode {
    fn into_node(self, kind: NodeKind) -> std::result::Result<Node, String> {
        if !valid_name(&self.node_type) || !valid_name(&self.name) {
            return Err(format!(
                "invalid {kind} address `{}.{}`: names use letters, digits, `_` and `-`",
                self.node_type, self.name
            ));
        }
        let mut node = Node::new(kind, &self.node_type, &self.name);
        node.attributes = self.attributes;
        node.depends_on = self.depends_on.into_iter().collect();
        node.lifecycle = self.lifecycle;
        node.hooks = self.hooks;
        Ok(node)
    }
}

impl RawModule {
    fn into_node(self) -> std::result::Result<Node, String> {
        if !valid_name(&self.name) {
            return Err(format!("invalid module name `{}`", self.name));
        }
        let mut node = Node::new(NodeKind::Module, "module", &self.name);
        node.attributes
            .insert("source".to_string(), Value::String(self.source));
        node.attributes.extend(self.inputs);
        node.depends_on = self.depends_on.into_iter().collect();
        Ok(node)
    }
}

/// Substitute variables into a node's attributes and hooks, marking
/// attributes and hooks fed by sensitive variables
fn substitute(node: &Node, vars: &ResolvedVariables) -> Result<Node> {
    let mut resolve = |r: &Reference| -> Result<Option<Value>> {
        match r {
            Reference::Variable(name) => vars
                .get(name)
                .cloned()
                .map(|v| Some(expr::escape(v)))
                .ok_or_else(|| unknown(&node.id, r)),
            _ => Ok(None),
        }
    };

    let mut out = node.clone();
    for (key, value) in &node.attributes {
        let mut refs = Vec::new();
        expr::collect_references(value, &mut refs)?;
        if refs
            .iter()
            .any(|r| matches!(r, Reference::Variable(v) if vars.is_sensitive(v)))
        {
            out.sensitive_attributes.insert(key.clone());
        }
        out.attributes
            .insert(key.clone(), expr::interpolate(value, &mut resolve)?);
    }
    out.hooks = Vec::with_capacity(node.hooks.len());
    for hook in &node.hooks {
        let mut resolved = hook.interpolate(&mut resolve)?;
        resolved.sensitive |= hook
            .references()?
            .iter()
            .any(|r| matches!(r, Reference::Variable(v) if vars.is_sensitive(v)));
        out.hooks.push(resolved);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{HookAction, HookWhen};
    use crate::state::StateRecord;
    use crate::variables::resolve;
    use tempfile::TempDir;

    const WEB: &str = r#"
[variable.instance_type]
type = "string"
default = "t2.micro"

[variable.db_password]
type = "string"
sensitive = true
default = "hunter2"

[[resource]]
type = "aws_instance"
name = "web"
depends_on = ["aws_security_group.sg"]

[resource.attributes]
instance_type = "${var.instance_type}"
name = "web-${var.instance_type}"
password = "${var.db_password}"
home = "$${HOME}"

[resource.lifecycle]
create_before_destroy = true
ignore_changes = ["tags"]

[[resource.hook]]
kind = "local-exec"
command = "echo ${self.id} ${var.instance_type}"

[[resource.hook]]
kind = "local-exec"
when = "destroy"
on_failure = "continue"
command = "cleanup --password ${var.db_password}"

[[resource]]
type = "aws_security_group"
name = "sg"

[[data]]
type = "aws_ami"
name = "ubuntu"
attributes = { owner = "canonical" }

[[module]]
name = "vpc"
source = "./modules/vpc"
inputs = { cidr = "10.0.0.0/16" }

[output.web_id]
value = "${aws_instance.web.id}"

[policy.force_new]
aws_instance = ["ami"]
"#;

    #[test]
    fn test_parse_and_substitute() {
        let config = Configuration::parse(WEB).unwrap();
        assert_eq!(config.node_count(), 4);
        assert_eq!(config.settings, Settings::default());
        assert!(config.policy.force_new["aws_instance"].contains("ami"));
        assert!(config.policy.force_new["local_file"].contains("filename"));

        let vars = resolve(&config.variables, &VariableSources::new()).unwrap();
        let nodes = config.nodes(&vars).unwrap();
        let web = &nodes[0];
        assert_eq!(web.id, "aws_instance.web");
        assert_eq!(web.attributes["instance_type"], Value::from("t2.micro"));
        assert_eq!(web.attributes["name"], Value::from("web-t2.micro"));
        assert_eq!(web.attributes["home"], Value::from("$${HOME}"));
        assert!(web.lifecycle.create_before_destroy);
        assert_eq!(
            web.sensitive_attributes,
            BTreeSet::from(["password".to_string()])
        );
        assert!(web.depends_on.contains("aws_security_group.sg"));

        assert_eq!(web.hooks.len(), 2);
        assert_eq!(web.hooks[1].when, HookWhen::Destroy);
        assert!(!web.hooks[0].sensitive);
        assert!(web.hooks[1].sensitive);
        match &web.hooks[0].action {
            HookAction::LocalExec { command, .. } => {
                assert_eq!(command, "echo ${self.id} t2.micro");
            }
            other => panic!("unexpected hook {other:?}"),
        }

        assert_eq!(nodes[2].id, "data.aws_ami.ubuntu");
        assert_eq!(nodes[3].id, "module.vpc");
        assert_eq!(nodes[3].attributes["cidr"], Value::from("10.0.0.0/16"));
    }

    #[test]
    fn test_load_directory_in_lexical_order() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("b.lf.toml"),
            "[[resource]]\ntype = \"null_resource\"\nname = \"b\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("a.lf.toml"),
            "[settings]\nparallelism = 8\n\n[[resource]]\ntype = \"null_resource\"\nname = \"a\"\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.toml"), "ignored = true\n").unwrap();

        let config = Configuration::load(dir.path()).unwrap();
        assert_eq!(config.files.len(), 2);
        assert_eq!(config.settings.parallelism, 8);
        let nodes = config.nodes(&ResolvedVariables::default()).unwrap();
        assert_eq!(nodes[0].id, "null_resource.a");
        assert_eq!(config.state_path(), dir.path().join("landform.state.json"));
        assert_eq!(
            config.origin_of("null_resource.b"),
            Some(dir.path().join("b.lf.toml").as_path())
        );
    }

    #[test]
    fn test_duplicates_rejected() {
        let dir = TempDir::new().unwrap();
        let node = "[[resource]]\ntype = \"null_resource\"\nname = \"a\"\n";
        fs::write(dir.path().join("a.lf.toml"), node).unwrap();
        fs::write(dir.path().join("b.lf.toml"), node).unwrap();
        let err = Configuration::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::DuplicateDeclaration { name } if name == "null_resource.a"));
    }

    #[test]
    fn test_empty_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Configuration::load(dir.path()),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_bad_toml_names_file() {
        let err = Configuration::parse("[[resource]\n").unwrap_err();
        assert!(matches!(err, Error::Toml { .. }));
        let err = Configuration::parse("[[resource]]\ntype = \"x\"\nname = \"a.b\"\n").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_undeclared_variable_reference() {
        let config = Configuration::parse(
            "[[resource]]\ntype = \"null_resource\"\nname = \"a\"\nattributes = { v = \"${var.nope}\" }\n",
        )
        .unwrap();
        let err = config.nodes(&ResolvedVariables::default()).unwrap_err();
        assert!(matches!(err, Error::UnknownReference { node, reference }
            if node == "null_resource.a" && reference == "var.nope"));
    }

    #[test]
    fn test_auto_var_files_order() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.lf.toml"), "[variable.v]\ntype = \"string\"\n").unwrap();
        fs::write(dir.path().join("z.auto.vars.toml"), "v = \"z\"\n").unwrap();
        fs::write(dir.path().join("a.auto.vars.toml"), "v = \"a\"\n").unwrap();
        fs::write(dir.path().join(AUTO_VARS_FILE), "v = \"base\"\n").unwrap();

        let config = Configuration::load(dir.path()).unwrap();
        let files = config.auto_var_files().unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![AUTO_VARS_FILE, "a.auto.vars.toml", "z.auto.vars.toml"]);

        let sources = config.sources(&[], &[]).unwrap();
        let vars = resolve(&config.variables, &sources).unwrap();
        assert_eq!(vars.get("v"), Some(&Value::from("z")));
    }

    #[test]
    fn test_outputs_evaluated_against_state() {
        let config = Configuration::parse(WEB).unwrap();
        let vars = resolve(&config.variables, &VariableSources::new()).unwrap();
        let nodes = config.nodes(&vars).unwrap();

        let mut state = StateSnapshot::default();
        let mut outputs = Attributes::new();
        outputs.insert("id".into(), Value::from("i-123"));
        state.records.insert(
            nodes[0].id.clone(),
            StateRecord::from_node(&nodes[0], BTreeSet::new(), outputs),
        );
        let evaluated = config.evaluate_outputs(&vars, &state).unwrap();
        assert_eq!(evaluated["web_id"].value, Value::from("i-123"));
        assert!(!evaluated["web_id"].sensitive);

        let ids: BTreeSet<String> = nodes.iter().map(|n| n.id.clone()).collect();
        assert!(config.check_outputs(&ids).is_ok());
        assert!(config.check_outputs(&BTreeSet::new()).is_err());
    }
}
