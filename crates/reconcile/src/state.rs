//! State store - the last-applied snapshot of every node
//!
//! The store is the only data that survives between runs. It is passed in
//! explicitly; writes are scoped to one record and persisted immediately.

use crate::error::{Error, Result};
use crate::expr;
use crate::hooks::{Hook, HookWhen};
use crate::retry::{RetryConfig, with_retry};
use crate::types::{Node, NodeId, NodeKind};
use crate::value::{Attributes, Value};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Current on-disk format version
pub const STATE_VERSION: u32 = 1;

/// Appended to the id of a replaced object still awaiting teardown
pub const DEPOSED_SUFFIX: &str = " (deposed)";

// ============================================================================
// State Structures
// ============================================================================

/// Persisted snapshot of one node's last successful apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: NodeId,
    pub kind: NodeKind,
    pub node_type: String,
    /// Configured attributes as applied (node references left unresolved)
    pub attributes: Attributes,
    /// Values computed by the provider (`id`, addresses, digests)
    #[serde(default)]
    pub outputs: Attributes,
    /// Attributes that reference other nodes, as resolved when applied
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: Attributes,
    /// Dependencies at apply time, used to order deletes of removed nodes
    #[serde(default)]
    pub dependencies: BTreeSet<NodeId>,
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Destroy-time hooks, kept so a removed node can still be cleaned up
    #[serde(default)]
    pub destroy_hooks: Vec<Hook>,
    #[serde(default)]
    pub sensitive_attributes: BTreeSet<String>,
    pub applied_at: DateTime<Utc>,
}

impl StateRecord {
    /// Build the record written after `node` was applied
    pub fn from_node(node: &Node, dependencies: BTreeSet<NodeId>, outputs: Attributes) -> Self {
        Self {
            id: node.id.clone(),
            kind: node.kind,
            node_type: node.node_type.clone(),
            attributes: node.attributes.clone(),
            outputs,
            inputs: Attributes::new(),
            dependencies,
            prevent_destroy: node.lifecycle.prevent_destroy,
            destroy_hooks: node.hooks_for(HookWhen::Destroy).cloned().collect(),
            sensitive_attributes: node.sensitive_attributes.clone(),
            applied_at: Utc::now(),
        }
    }

    /// Keep the resolved value of every attribute that references a node
    pub fn with_inputs(mut self, node: &Node, resolved: &Attributes) -> Self {
        self.inputs = node
            .attributes
            .iter()
            .filter(|(_, value)| !expr::node_addresses(value).is_empty())
            .filter_map(|(name, _)| resolved.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        self
    }

    /// Copy kept under a separate key for an object that was replaced but
    /// could not be torn down yet
    pub fn deposed(&self) -> Self {
        let mut record = self.clone();
        record.id = format!("{}{DEPOSED_SUFFIX}", self.id);
        record
    }

    /// Value other nodes see when they reference this one:
    /// attributes overlaid with provider outputs
    pub fn exposed_value(&self) -> Value {
        let mut map = self.attributes.clone();
        for (k, v) in &self.outputs {
            map.insert(k.clone(), v.clone());
        }
        Value::Map(map)
    }
}

/// A root output value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub value: Value,
    #[serde(default)]
    pub sensitive: bool,
}

/// The whole persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    /// Incremented on every write
    pub serial: u64,
    /// Fixed when the state is first created
    pub lineage: String,
    #[serde(default)]
    pub records: BTreeMap<NodeId, StateRecord>,
    #[serde(default)]
    pub outputs: IndexMap<String, OutputValue>,
    pub last_updated: DateTime<Utc>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: uuid::Uuid::new_v4().to_string(),
            records: BTreeMap::new(),
            outputs: IndexMap::new(),
            last_updated: Utc::now(),
        }
    }
}

impl StateSnapshot {
    pub fn get(&self, id: &str) -> Option<&StateRecord> {
        self.records.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }
}

/// Who holds the run lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: String,
    pub operation: String,
    pub who: String,
    pub created: DateTime<Utc>,
}

impl LockInfo {
    fn new(operation: &str) -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.to_string(),
            who: format!("{user} (pid {})", std::process::id()),
            created: Utc::now(),
        }
    }

    fn locked_error(&self) -> Error {
        Error::StateLocked {
            holder: self.who.clone(),
            lock_id: self.id.clone(),
            operation: self.operation.clone(),
        }
    }
}

// ============================================================================
// Store abstraction
// ============================================================================

/// Keyed record store with a run-level lock
///
/// Implementations must make each write atomic: a concurrent reader sees
/// either the old or the new record, never a partial one.
pub trait StateStore: Send + Sync {
    /// Full copy of the current state
    fn snapshot(&self) -> Result<StateSnapshot>;

    /// One record
    fn get(&self, id: &str) -> Result<Option<StateRecord>>;

    /// Insert or replace a record and persist
    fn put(&self, record: StateRecord) -> Result<()>;

    /// Remove a record and persist
    fn remove(&self, id: &str) -> Result<()>;

    /// Replace the root outputs and persist
    fn set_outputs(&self, outputs: IndexMap<String, OutputValue>) -> Result<()>;

    /// Take the run lock, failing fast with `StateLocked` if it is held
    fn lock(&self, operation: &str) -> Result<LockInfo>;

    /// Release the run lock; `lock_id` must match the holder
    fn unlock(&self, lock_id: &str) -> Result<()>;

    /// Current lock holder, if any
    fn current_lock(&self) -> Result<Option<LockInfo>>;
}

/// Held run lock, released on drop
pub struct StateLock<'a> {
    store: &'a dyn StateStore,
    info: LockInfo,
}

impl StateLock<'_> {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for StateLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.unlock(&self.info.id) {
            log::warn!("Failed to release state lock {}: {}", self.info.id, e);
        }
    }
}

/// Take the run lock, retrying with backoff while another run holds it
pub fn acquire_lock<'a>(
    store: &'a dyn StateStore,
    operation: &str,
    retry: &RetryConfig,
) -> Result<StateLock<'a>> {
    let info = with_retry(retry, || store.lock(operation))?;
    log::debug!("Acquired state lock {}", info.id);
    Ok(StateLock { store, info })
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Local file store
// ============================================================================

fn load_snapshot(path: &Path) -> Result<StateSnapshot> {
    if !path.exists() {
        log::debug!("State file does not exist, using empty state");
        return Ok(StateSnapshot::default());
    }
    let content = fs::read_to_string(path).map_err(Error::io(path))?;
    let state: StateSnapshot = serde_json::from_str(&content)?;
    if state.version > STATE_VERSION {
        return Err(Error::Config {
            origin: path.display().to_string(),
            message: format!(
                "state format version {} is newer than supported version {STATE_VERSION}",
                state.version
            ),
        });
    }
    log::debug!("Loaded state from {} (serial {})", path.display(), state.serial);
    Ok(state)
}

/// JSON state file with a sibling `.lock` file
pub struct LocalStateStore {
    path: PathBuf,
    lock_path: PathBuf,
    state: Mutex<StateSnapshot>,
    backed_up: Mutex<bool>,
}

impl LocalStateStore {
    /// Open a state file, starting empty if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = load_snapshot(&path)?;

        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");

        Ok(Self {
            lock_path: PathBuf::from(lock_path),
            path,
            state: Mutex::new(state),
            backed_up: Mutex::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the whole snapshot via a temp file and rename
    fn persist(&self, state: &StateSnapshot) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(Error::io(&dir))?;

        {
            let mut backed_up = guard(&self.backed_up);
            if !*backed_up && self.path.exists() {
                let mut backup = self.path.clone().into_os_string();
                backup.push(".backup");
                fs::copy(&self.path, &backup).map_err(Error::io(&self.path))?;
            }
            *backed_up = true;
        }

        let content = serde_json::to_string_pretty(state)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(Error::io(&dir))?;
        tmp.write_all(content.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(Error::io(tmp.path()))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::io(&self.path)(e.error))?;

        log::debug!("Saved state to {} (serial {})", self.path.display(), state.serial);
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut StateSnapshot)) -> Result<()> {
        let mut state = guard(&self.state);
        let mut next = state.clone();
        f(&mut next);
        next.touch();
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    fn read_lock(&self) -> Result<Option<LockInfo>> {
        match fs::read_to_string(&self.lock_path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&self.lock_path)(e)),
        }
    }
}

impl StateStore for LocalStateStore {
    fn snapshot(&self) -> Result<StateSnapshot> {
        Ok(guard(&self.state).clone())
    }

    fn get(&self, id: &str) -> Result<Option<StateRecord>> {
        Ok(guard(&self.state).records.get(id).cloned())
    }

    fn put(&self, record: StateRecord) -> Result<()> {
        self.mutate(|s| {
            s.records.insert(record.id.clone(), record);
        })
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.mutate(|s| {
            s.records.remove(id);
        })
    }

    fn set_outputs(&self, outputs: IndexMap<String, OutputValue>) -> Result<()> {
        self.mutate(|s| s.outputs = outputs)
    }

    fn lock(&self, operation: &str) -> Result<LockInfo> {
        let info = LockInfo::new(operation);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(mut file) => {
                let written = serde_json::to_string_pretty(&info)
                    .map_err(Error::from)
                    .and_then(|content| {
                        file.write_all(content.as_bytes())
                            .map_err(Error::io(&self.lock_path))
                    })
                    // Another run may have written while we waited for the lock
                    .and_then(|()| load_snapshot(&self.path));
                match written {
                    Ok(state) => {
                        *guard(&self.state) = state;
                        Ok(info)
                    }
                    Err(e) => {
                        drop(file);
                        let _ = fs::remove_file(&self.lock_path);
                        Err(e)
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // The holder may be mid-write; report what we can read
                let held = self.read_lock().ok().flatten().unwrap_or(LockInfo {
                    id: "unknown".to_string(),
                    operation: "unknown".to_string(),
                    who: "unknown".to_string(),
                    created: Utc::now(),
                });
                Err(held.locked_error())
            }
            Err(e) => Err(Error::io(&self.lock_path)(e)),
        }
    }

    fn unlock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock()? {
            None => Ok(()),
            Some(held) if held.id == lock_id => {
                fs::remove_file(&self.lock_path).map_err(Error::io(&self.lock_path))
            }
            Some(held) => Err(Error::LockMismatch {
                given: lock_id.to_string(),
                held: held.id,
            }),
        }
    }

    fn current_lock(&self) -> Result<Option<LockInfo>> {
        self.read_lock()
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Store kept entirely in memory; used for tests and speculative plans
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<StateSnapshot>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
            lock: Mutex::new(None),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn snapshot(&self) -> Result<StateSnapshot> {
        Ok(guard(&self.state).clone())
    }

    fn get(&self, id: &str) -> Result<Option<StateRecord>> {
        Ok(guard(&self.state).records.get(id).cloned())
    }

    fn put(&self, record: StateRecord) -> Result<()> {
        let mut state = guard(&self.state);
        state.records.insert(record.id.clone(), record);
        state.touch();
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let mut state = guard(&self.state);
        state.records.remove(id);
        state.touch();
        Ok(())
    }

    fn set_outputs(&self, outputs: IndexMap<String, OutputValue>) -> Result<()> {
        let mut state = guard(&self.state);
        state.outputs = outputs;
        state.touch();
        Ok(())
    }

    fn lock(&self, operation: &str) -> Result<LockInfo> {
        let mut lock = guard(&self.lock);
        if let Some(held) = lock.as_ref() {
            return Err(held.locked_error());
        }
        let info = LockInfo::new(operation);
        *lock = Some(info.clone());
        Ok(info)
    }

    fn unlock(&self, lock_id: &str) -> Result<()> {
        let mut lock = guard(&self.lock);
        match lock.as_ref() {
            Some(held) if held.id != lock_id => Err(Error::LockMismatch {
                given: lock_id.to_string(),
                held: held.id.clone(),
            }),
            _ => {
                *lock = None;
                Ok(())
            }
        }
    }

    fn current_lock(&self) -> Result<Option<LockInfo>> {
        Ok(guard(&self.lock).clone())
    }
}
