//! `local_file` - a file on the local filesystem
//!
//! Attributes: `filename` (required, `~` and env vars expanded), `content`,
//! and on unix an octal `file_permission`. Outputs the expanded `path` and
//! a blake3 digest of the content as `id`.

use crate::provider::{Provider, ProviderRequest};
use crate::state::StateRecord;
use crate::value::{Attributes, Value};
use anyhow::{Context, Result, bail};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileProvider;

fn string_attr<'a>(attributes: &'a Attributes, key: &str, node_id: &str) -> Result<Option<&'a str>> {
    match attributes.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => bail!(
            "{node_id}: attribute `{key}` must be a string, found {}",
            other.type_name()
        ),
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(path).map_or_else(|_| path.to_string(), |p| p.into_owned()))
}

fn target_path(request: &ProviderRequest<'_>) -> Result<PathBuf> {
    let Some(filename) = string_attr(request.attributes, "filename", request.node_id)? else {
        bail!("{}: missing required attribute `filename`", request.node_id);
    };
    Ok(expand(filename))
}

/// Write via a temp file in the same directory, then rename
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: Option<&str>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let Some(mode) = mode else {
        return Ok(());
    };
    let bits = u32::from_str_radix(mode, 8)
        .with_context(|| format!("Invalid file_permission `{mode}`"))?;
    fs::set_permissions(path, fs::Permissions::from_mode(bits))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: Option<&str>) -> Result<()> {
    Ok(())
}

fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::debug!("{} already gone", path.display());
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

fn outputs(path: &Path, content: &[u8]) -> Attributes {
    let mut out = Attributes::new();
    out.insert("id".into(), Value::from(blake3::hash(content).to_hex().to_string()));
    out.insert("path".into(), Value::from(path.display().to_string()));
    out
}

fn recorded_path(record: &StateRecord) -> Option<PathBuf> {
    record
        .outputs
        .get("path")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .or_else(|| {
            record
                .attributes
                .get("filename")
                .and_then(Value::as_str)
                .map(expand)
        })
}

impl Provider for LocalFileProvider {
    fn name(&self) -> &'static str {
        "local_file"
    }

    fn create(&self, request: &ProviderRequest<'_>) -> Result<Attributes> {
        let path = target_path(request)?;
        let content = string_attr(request.attributes, "content", request.node_id)?.unwrap_or("");
        write_atomic(&path, content.as_bytes())?;
        set_permissions(
            &path,
            string_attr(request.attributes, "file_permission", request.node_id)?,
        )?;
        log::info!("{}: wrote {}", request.node_id, path.display());
        Ok(outputs(&path, content.as_bytes()))
    }

    fn update(&self, request: &ProviderRequest<'_>, prior: &StateRecord) -> Result<Attributes> {
        let out = self.create(request)?;
        if let Some(old) = recorded_path(prior)
            && out.get("path").and_then(Value::as_str) != Some(&*old.to_string_lossy())
        {
            remove(&old)?;
        }
        Ok(out)
    }

    fn delete(&self, record: &StateRecord) -> Result<()> {
        let Some(path) = recorded_path(record) else {
            bail!("{}: no recorded path to delete", record.id);
        };
        remove(&path)?;
        log::info!("{}: removed {}", record.id, path.display());
        Ok(())
    }

    /// Read an existing file; `content` is an output
    fn read(&self, request: &ProviderRequest<'_>) -> Result<Attributes> {
        let path = target_path(request)?;
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut out = outputs(&path, content.as_bytes());
        out.insert("content".into(), Value::from(content));
        Ok(out)
    }
}
