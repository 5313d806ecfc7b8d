//! Lifecycle hooks (provisioner steps) attached to nodes
//!
//! Hooks are ordered descriptors, not callbacks. The executor decides when
//! each one runs and hands it to a [`HookRunner`].

use crate::expr::{self, Reference};
use crate::diff::REDACTED;
use crate::error::Result;
use crate::value::Value;
use anyhow::{Context, bail};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

/// When a hook fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookWhen {
    /// After the node is created or updated
    #[default]
    Create,
    /// Before the node is torn down
    Destroy,
}

/// What a hook failure does to the node's action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Fail the node
    #[default]
    Fail,
    /// Log and carry on
    Continue,
}

/// SSH connection for remote hooks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub host: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub private_key: Option<String>,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

/// The capability a hook exercises
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HookAction {
    /// Run a command on the machine running landform
    LocalExec {
        command: String,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        environment: IndexMap<String, String>,
        /// Interpreter and its flags, defaults to `sh -c`
        #[serde(default)]
        interpreter: Vec<String>,
    },
    /// Run inline commands on a remote host over ssh
    RemoteExec {
        connection: Connection,
        inline: Vec<String>,
    },
    /// Copy a file or write literal content to a destination
    File {
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        content: Option<String>,
        destination: String,
        #[serde(default)]
        connection: Option<Connection>,
    },
}

/// A lifecycle hook descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    #[serde(flatten)]
    pub action: HookAction,
    #[serde(default)]
    pub when: HookWhen,
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Fields carry sensitive values: shown redacted, and the hook's output
    /// is kept out of error messages
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,
}

impl Hook {
    /// Short kind name used in messages
    pub fn kind(&self) -> &'static str {
        match self.action {
            HookAction::LocalExec { .. } => "local-exec",
            HookAction::RemoteExec { .. } => "remote-exec",
            HookAction::File { .. } => "file",
        }
    }

    fn strings(&self) -> Vec<&str> {
        match &self.action {
            HookAction::LocalExec {
                command,
                working_dir,
                environment,
                ..
            } => {
                let mut out = vec![command.as_str()];
                out.extend(working_dir.as_deref());
                out.extend(environment.values().map(String::as_str));
                out
            }
            HookAction::RemoteExec { connection, inline } => {
                let mut out = vec![connection.host.as_str()];
                out.extend(inline.iter().map(String::as_str));
                out
            }
            HookAction::File {
                source,
                content,
                destination,
                connection,
            } => {
                let mut out = vec![destination.as_str()];
                out.extend(source.as_deref());
                out.extend(content.as_deref());
                out.extend(connection.as_ref().map(|c| c.host.as_str()));
                out
            }
        }
    }

    /// References used by the hook's fields
    pub fn references(&self) -> Result<Vec<Reference>> {
        let mut out = Vec::new();
        for s in self.strings() {
            out.extend(expr::string_references(s)?);
        }
        Ok(out)
    }

    /// Copy of the hook with references substituted in every field
    pub fn interpolate<F>(&self, resolve: &mut F) -> Result<Hook>
    where
        F: FnMut(&Reference) -> Result<Option<Value>>,
    {
        self.map_strings(&mut |s: &str| -> Result<String> {
            Ok(expr::interpolate_str(s, resolve)?.to_template_string())
        })
    }

    /// Copy of the hook with every substitutable field replaced by the
    /// redaction placeholder when it is sensitive
    pub fn redacted(&self) -> Hook {
        if !self.sensitive {
            return self.clone();
        }
        match self.map_strings(&mut |_: &str| -> Result<String> { Ok(REDACTED.to_string()) }) {
            Ok(hook) => hook,
            Err(_) => self.clone(),
        }
    }

    /// Copy of the hook with `$${` escapes turned back into `${`
    pub fn unescaped(&self) -> Hook {
        match self.map_strings(&mut |s: &str| -> Result<String> { Ok(s.replace("$${", "${")) }) {
            Ok(hook) => hook,
            Err(_) => self.clone(),
        }
    }

    fn map_strings(&self, sub: &mut dyn FnMut(&str) -> Result<String>) -> Result<Hook> {
        let connection = |c: &Connection, sub: &mut dyn FnMut(&str) -> Result<String>| {
            Ok::<_, crate::error::Error>(Connection {
                host: sub(&c.host)?,
                ..c.clone()
            })
        };

        let action = match &self.action {
            HookAction::LocalExec {
                command,
                working_dir,
                environment,
                interpreter,
            } => HookAction::LocalExec {
                command: sub(command)?,
                working_dir: working_dir.as_deref().map(|s| sub(s)).transpose()?,
                environment: environment
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), sub(v)?)))
                    .collect::<Result<_>>()?,
                interpreter: interpreter.clone(),
            },
            HookAction::RemoteExec {
                connection: c,
                inline,
            } => HookAction::RemoteExec {
                connection: connection(c, &mut *sub)?,
                inline: inline.iter().map(|s| sub(s)).collect::<Result<_>>()?,
            },
            HookAction::File {
                source,
                content,
                destination,
                connection: c,
            } => HookAction::File {
                source: source.as_deref().map(|s| sub(s)).transpose()?,
                content: content.as_deref().map(|s| sub(s)).transpose()?,
                destination: sub(destination)?,
                connection: c
                    .as_ref()
                    .map(|c| connection(c, &mut *sub))
                    .transpose()?,
            },
        };

        Ok(Hook {
            action,
            when: self.when,
            on_failure: self.on_failure,
            sensitive: self.sensitive,
        })
    }
}

/// Runs hooks on behalf of the executor
pub trait HookRunner: Send + Sync {
    /// Run one hook for a node
    fn run(&self, node_id: &str, hook: &Hook) -> anyhow::Result<()>;
}

/// Hook runner backed by local processes (`sh`, `ssh`, `scp`)
#[derive(Debug, Default)]
pub struct CommandHookRunner;

impl HookRunner for CommandHookRunner {
    fn run(&self, node_id: &str, hook: &Hook) -> anyhow::Result<()> {
        log::info!("{node_id}: running {} hook", hook.kind());
        match &hook.action {
            HookAction::LocalExec {
                command,
                working_dir,
                environment,
                interpreter,
            } => {
                let (program, args) = match interpreter.split_first() {
                    Some((program, args)) => (program.as_str(), args.to_vec()),
                    None => ("sh", vec!["-c".to_string()]),
                };
                let mut cmd = Command::new(program);
                cmd.args(&args).arg(command).envs(environment);
                if let Some(dir) = working_dir {
                    cmd.current_dir(shellexpand::tilde(dir).as_ref());
                }
                run_checked(cmd, program, hook.sensitive)
            }
            HookAction::RemoteExec { connection, inline } => {
                let mut cmd = ssh_command("ssh", connection, "-p");
                cmd.arg(format!("{}@{}", connection.user, connection.host))
                    .arg(inline.join(" && "));
                run_checked(cmd, "ssh", hook.sensitive)
            }
            HookAction::File {
                source,
                content,
                destination,
                connection,
            } => copy_file(
                source.as_deref(),
                content.as_deref(),
                destination,
                connection.as_ref(),
                hook.sensitive,
            ),
        }
    }
}

fn ssh_command(program: &str, connection: &Connection, port_flag: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(["-o", "BatchMode=yes"])
        .arg(port_flag)
        .arg(connection.port.to_string());
    if let Some(key) = &connection.private_key {
        cmd.arg("-i").arg(shellexpand::tilde(key).as_ref());
    }
    cmd
}

/// Run a command to completion; `quiet` keeps its output out of errors and logs
fn run_checked(mut cmd: Command, program: &str, quiet: bool) -> anyhow::Result<()> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Failed to execute: {program}"))?;
    if !output.status.success() {
        if quiet {
            bail!("{program} exited with {} (output hidden)", output.status);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        );
    }
    if !quiet {
        log::debug!("{}", String::from_utf8_lossy(&output.stdout).trim());
    }
    Ok(())
}

fn copy_file(
    source: Option<&str>,
    content: Option<&str>,
    destination: &str,
    connection: Option<&Connection>,
    quiet: bool,
) -> anyhow::Result<()> {
    let staged;
    let local_source = match (source, content) {
        (Some(src), None) => shellexpand::tilde(src).into_owned(),
        (None, Some(text)) => {
            if connection.is_none() {
                let dest = shellexpand::tilde(destination);
                write_with_parents(Path::new(dest.as_ref()), text)?;
                return Ok(());
            }
            staged = tempfile::NamedTempFile::new().context("Failed to stage file content")?;
            fs::write(staged.path(), text).context("Failed to stage file content")?;
            staged.path().to_string_lossy().into_owned()
        }
        _ => bail!("file hook needs exactly one of `source` or `content`"),
    };

    match connection {
        Some(conn) => {
            let mut cmd = ssh_command("scp", conn, "-P");
            cmd.arg(&local_source)
                .arg(format!("{}@{}:{}", conn.user, conn.host, destination));
            run_checked(cmd, "scp", quiet)
        }
        None => {
            let dest = shellexpand::tilde(destination);
            let dest = Path::new(dest.as_ref());
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::copy(&local_source, dest).with_context(|| {
                format!("Failed to copy {local_source} to {}", dest.display())
            })?;
            Ok(())
        }
    }
}

fn write_with_parents(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local(command: &str) -> Hook {
        Hook {
            action: HookAction::LocalExec {
                command: command.into(),
                working_dir: None,
                environment: IndexMap::new(),
                interpreter: Vec::new(),
            },
            when: HookWhen::Create,
            on_failure: OnFailure::Fail,
            sensitive: false,
        }
    }

    #[test]
    fn test_deserialize_hook_from_toml() {
        let hook: Hook = toml::from_str(
            r#"
kind = "remote-exec"
when = "destroy"
inline = ["systemctl stop app"]
connection = { host = "${self.public_ip}", user = "ubuntu" }
"#,
        )
        .unwrap();
        assert_eq!(hook.kind(), "remote-exec");
        assert_eq!(hook.when, HookWhen::Destroy);
        assert_eq!(hook.on_failure, OnFailure::Fail);
        match &hook.action {
            HookAction::RemoteExec { connection, .. } => {
                assert_eq!(connection.port, 22);
                assert_eq!(connection.user, "ubuntu");
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(
            hook.references().unwrap(),
            vec![Reference::SelfAttr(vec!["public_ip".into()])]
        );
    }

    #[test]
    fn test_interpolate_substitutes_self() {
        let hook = local("echo ${self.id} >> hosts");
        let resolved = hook
            .interpolate(&mut |r: &Reference| match r {
                Reference::SelfAttr(_) => Ok(Some(Value::from("i-123"))),
                _ => Ok(None),
            })
            .unwrap();
        match resolved.action {
            HookAction::LocalExec { command, .. } => assert_eq!(command, "echo i-123 >> hosts"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_local_exec_success_and_failure() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let runner = CommandHookRunner;
        runner
            .run("null_resource.a", &local(&format!("touch {}", marker.display())))
            .unwrap();
        assert!(marker.exists());

        let err = runner.run("null_resource.a", &local("exit 3")).unwrap_err();
        assert!(err.to_string().contains("sh exited"));
    }

    #[cfg(unix)]
    #[test]
    fn test_sensitive_hook_failure_hides_output() {
        let mut hook = local("echo 'bad password hunter2' >&2; exit 1");
        hook.sensitive = true;
        let err = CommandHookRunner.run("null_resource.a", &hook).unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("sh exited"));
        assert!(!text.contains("hunter2"));

        hook.sensitive = false;
        let err = CommandHookRunner.run("null_resource.a", &hook).unwrap_err();
        assert!(format!("{err:#}").contains("hunter2"));
    }

    #[test]
    fn test_redacted_masks_only_sensitive_hooks() {
        let mut hook = local("cleanup --password hunter2");
        assert_eq!(hook.redacted(), hook);

        hook.sensitive = true;
        match hook.redacted().action {
            HookAction::LocalExec { command, .. } => assert_eq!(command, REDACTED),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_file_hook_writes_content_locally() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested/motd");
        let hook = Hook {
            action: HookAction::File {
                source: None,
                content: Some("hello".into()),
                destination: dest.to_string_lossy().into_owned(),
                connection: None,
            },
            when: HookWhen::Create,
            on_failure: OnFailure::Fail,
            sensitive: false,
        };
        CommandHookRunner.run("null_resource.a", &hook).unwrap();
        assert_eq!(fs::read_to_string(dest).unwrap(), "hello");
    }
}
