//! Execution engine - applies a change set with bounded parallelism
//!
//! The calling thread coordinates: it launches every change whose
//! prerequisites are done onto a rayon pool, collects completions over a
//! channel, and is the only thread that talks to the progress callback.
//! Workers write state themselves, one record at a time, as soon as their
//! change has fully succeeded.

use crate::context::ProgressCallback;
use crate::error::{Error, Result};
use crate::expr::{self, Reference};
use crate::hooks::{Hook, HookRunner, HookWhen, OnFailure};
use crate::planner::{Action, Change, ChangeSet, ReplaceOrder};
use crate::provider::{ProviderRegistry, ProviderRequest};
use crate::state::{StateRecord, StateStore};
use crate::types::{ApplyReport, ApplyResult, ExecuteOptions, Node, NodeKind};
use crate::value::{Attributes, Value};
use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

/// How often the coordinator re-checks cancellation while changes run
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything a worker needs to apply one change
#[derive(Clone, Copy)]
struct Backends<'a> {
    store: &'a dyn StateStore,
    providers: &'a ProviderRegistry,
    hooks: &'a dyn HookRunner,
}

/// Apply a change set.
///
/// Returns one result per change, in change-set order. Per-node failures
/// are reported in the [`ApplyReport`], not as an `Err`; dependents of a
/// failed change are skipped, unrelated changes continue. Once cancellation
/// is requested (or the timeout passes) no new change is launched, in-flight
/// changes finish, and the rest are reported as cancelled.
pub fn apply(
    changes: &ChangeSet,
    store: &dyn StateStore,
    providers: &ProviderRegistry,
    hooks: &dyn HookRunner,
    options: &ExecuteOptions,
    progress: &mut dyn ProgressCallback,
) -> Result<ApplyReport> {
    let total = changes.len();
    let backends = Backends {
        store,
        providers,
        hooks,
    };

    let mut results: Vec<Option<ApplyResult>> = (0..total).map(|_| None).collect();
    let mut remaining: Vec<usize> = changes.changes.iter().map(|c| c.waits_on.len()).collect();
    let mut waiters: Vec<Vec<usize>> = vec![Vec::new(); total];
    for (i, change) in changes.changes.iter().enumerate() {
        for &dep in &change.waits_on {
            waiters[dep].push(i);
        }
    }
    let mut ready: VecDeque<usize> = (0..total).filter(|&i| remaining[i] == 0).collect();

    let jobs = options.jobs.max(1);
    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
    let deadline = options.timeout.map(|t| Instant::now() + t);
    let (tx, rx) = mpsc::channel::<(usize, ApplyResult)>();
    let mut stopped = false;

    progress.on_apply_start(total);

    pool.in_place_scope(|scope| {
        let mut in_flight = 0usize;
        loop {
            if !stopped
                && (options.cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d))
            {
                log::warn!("Interrupted: no new changes will be started");
                stopped = true;
            }

            while !stopped && in_flight < jobs {
                let Some(i) = ready.pop_front() else {
                    break;
                };
                let change = &changes.changes[i];
                if change.action == Action::NoOp {
                    finish(i, ApplyResult::NoChange, changes, &mut results, &mut remaining, &waiters, &mut ready, progress);
                    continue;
                }

                progress.on_node_start(&change.node_id, &change.action);
                in_flight += 1;
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let result = match run_change(change, backends) {
                        Ok(result) => result,
                        Err(e) => {
                            log::error!("{}: {}", change.node_id, e);
                            ApplyResult::Failed(e)
                        }
                    };
                    // The coordinator outlives every worker
                    let _ = tx.send((i, result));
                });
            }

            if in_flight == 0 && (stopped || ready.is_empty()) {
                break;
            }

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok((i, result)) => {
                    in_flight -= 1;
                    finish(i, result, changes, &mut results, &mut remaining, &waiters, &mut ready, progress);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    let mut report = ApplyReport::default();
    for (change, result) in changes.changes.iter().zip(results) {
        let result = match result {
            Some(result) => result,
            None => {
                let result = ApplyResult::Cancelled;
                progress.on_node_complete(&change.node_id, &result);
                result
            }
        };
        report.results.push((change.node_id.clone(), result));
    }
    progress.on_apply_complete();
    Ok(report)
}

/// Record a terminal result and release or skip the changes waiting on it
#[allow(clippy::too_many_arguments)]
fn finish(
    i: usize,
    result: ApplyResult,
    changes: &ChangeSet,
    results: &mut [Option<ApplyResult>],
    remaining: &mut [usize],
    waiters: &[Vec<usize>],
    ready: &mut VecDeque<usize>,
    progress: &mut dyn ProgressCallback,
) {
    let node_id = &changes.changes[i].node_id;
    progress.on_node_complete(node_id, &result);

    if result.is_success() {
        for &w in &waiters[i] {
            remaining[w] -= 1;
            if remaining[w] == 0 && results[w].is_none() {
                ready.push_back(w);
            }
        }
    } else {
        // Skip everything downstream, depth first
        let mut stack: Vec<(usize, usize)> = waiters[i].iter().map(|&w| (w, i)).collect();
        while let Some((w, cause)) = stack.pop() {
            if results[w].is_some() {
                continue;
            }
            let skipped = ApplyResult::Skipped {
                reason: format!("dependency {} did not apply", changes.changes[cause].node_id),
            };
            log::warn!("{}: skipped", changes.changes[w].node_id);
            progress.on_node_complete(&changes.changes[w].node_id, &skipped);
            results[w] = Some(skipped);
            stack.extend(waiters[w].iter().map(|&n| (n, w)));
        }
    }
    results[i] = Some(result);
}

fn desired(change: &Change) -> Result<&Node> {
    change.node.as_ref().ok_or_else(|| Error::Config {
        origin: change.node_id.clone(),
        message: format!("{} has no configuration to apply", change.action),
    })
}

fn prior(change: &Change) -> Result<&StateRecord> {
    change.prior.as_ref().ok_or_else(|| Error::Config {
        origin: change.node_id.clone(),
        message: format!("{} has no recorded state", change.action),
    })
}

fn run_change(change: &Change, b: Backends<'_>) -> Result<ApplyResult> {
    log::info!("{}: {}", change.node_id, change.action);
    match change.action {
        Action::NoOp => Ok(ApplyResult::NoChange),
        Action::Create => {
            let node = desired(change)?;
            let (attributes, outputs) = create(node, b)?;
            record(change, node, &attributes, outputs, b)?;
            Ok(ApplyResult::Created)
        }
        Action::Update => {
            let node = desired(change)?;
            let old = prior(change)?;
            let attributes = resolve_attributes(node, b.store)?;
            let provider = b.providers.get(&node.id, &node.node_type)?;
            let outputs = provider
                .update(&request(node, &attributes), old)
                .map_err(|e| side_effect(&node.id, &e))?;
            run_hooks(&node.id, node.hooks_for(HookWhen::Create), &attributes, &outputs, b)?;
            record(change, node, &attributes, outputs, b)?;
            Ok(ApplyResult::Modified)
        }
        Action::Replace(ReplaceOrder::CreateBeforeDestroy) => {
            let node = desired(change)?;
            let old = prior(change)?;
            let (attributes, outputs) = create(node, b)?;
            // The old object stays tracked until its teardown succeeds
            let deposed = old.deposed();
            b.store.put(deposed.clone())?;
            record(change, node, &attributes, outputs, b)?;
            teardown(old, &old.destroy_hooks, b)?;
            b.store.remove(&deposed.id)?;
            Ok(ApplyResult::Replaced)
        }
        Action::Replace(ReplaceOrder::DestroyBeforeCreate) => {
            let node = desired(change)?;
            let old = prior(change)?;
            teardown(old, &old.destroy_hooks, b)?;
            b.store.remove(&old.id)?;
            let (attributes, outputs) = create(node, b)?;
            record(change, node, &attributes, outputs, b)?;
            Ok(ApplyResult::Replaced)
        }
        Action::Delete => {
            let old = prior(change)?;
            if old.kind != NodeKind::DataSource {
                match &change.node {
                    Some(node) => {
                        let hooks: Vec<Hook> = node.hooks_for(HookWhen::Destroy).cloned().collect();
                        teardown(old, &hooks, b)?;
                    }
                    None => teardown(old, &old.destroy_hooks, b)?,
                }
            }
            b.store.remove(&old.id)?;
            Ok(ApplyResult::Removed)
        }
        Action::Read => {
            let node = desired(change)?;
            let attributes = resolve_attributes(node, b.store)?;
            let provider = b.providers.get(&node.id, &node.node_type)?;
            let outputs = provider
                .read(&request(node, &attributes))
                .map_err(|e| side_effect(&node.id, &e))?;
            record(change, node, &attributes, outputs, b)?;
            Ok(ApplyResult::Read)
        }
    }
}

/// Provider create followed by the node's create-time hooks; returns the
/// resolved attributes and the provider outputs
fn create(node: &Node, b: Backends<'_>) -> Result<(Attributes, Attributes)> {
    let attributes = resolve_attributes(node, b.store)?;
    let provider = b.providers.get(&node.id, &node.node_type)?;
    let outputs = provider
        .create(&request(node, &attributes))
        .map_err(|e| side_effect(&node.id, &e))?;
    run_hooks(&node.id, node.hooks_for(HookWhen::Create), &attributes, &outputs, b)?;
    Ok((attributes, outputs))
}

/// Destroy hooks, then the provider teardown of a recorded object
fn teardown(old: &StateRecord, hooks: &[Hook], b: Backends<'_>) -> Result<()> {
    let attributes = resolve_record_attributes(old, b.store);
    run_hooks(&old.id, hooks.iter(), &attributes, &old.outputs, b)?;
    let provider = b.providers.get(&old.id, &old.node_type)?;
    let mut resolved = old.clone();
    resolved.attributes = attributes;
    provider
        .delete(&resolved)
        .map_err(|e| side_effect(&old.id, &e))
}

fn record(
    change: &Change,
    node: &Node,
    attributes: &Attributes,
    outputs: Attributes,
    b: Backends<'_>,
) -> Result<()> {
    b.store.put(
        StateRecord::from_node(node, change.dependencies.clone(), outputs)
            .with_inputs(node, attributes),
    )
}

fn request<'a>(node: &'a Node, attributes: &'a Attributes) -> ProviderRequest<'a> {
    ProviderRequest {
        node_id: &node.id,
        node_type: &node.node_type,
        attributes,
    }
}

fn side_effect(node_id: &str, e: &anyhow::Error) -> Error {
    Error::SideEffectFailure {
        node: node_id.to_string(),
        message: format!("{e:#}"),
    }
}

/// Value of a node reference, read from the dependency's record
fn lookup_node(owner: &str, address: &str, path: &[String], store: &dyn StateStore) -> Result<Value> {
    let Some(record) = store.get(address)? else {
        return Err(Error::UnknownReference {
            node: owner.to_string(),
            reference: address.to_string(),
        });
    };
    let exposed = record.exposed_value();
    if path.is_empty() {
        return Ok(exposed);
    }
    exposed.lookup_path(path).cloned().ok_or_else(|| Error::InvalidReference {
        expr: format!("{address}.{}", path.join(".")),
        reason: format!("{address} has no attribute `{}`", path.join(".")),
    })
}

/// Attributes with every node reference replaced by the dependency's value
fn resolve_attributes(node: &Node, store: &dyn StateStore) -> Result<Attributes> {
    let mut resolve = |r: &Reference| -> Result<Option<Value>> {
        match r {
            Reference::Node { address, path } => lookup_node(&node.id, address, path, store).map(Some),
            Reference::SelfAttr(_) | Reference::Variable(_) => Err(Error::InvalidReference {
                expr: r.to_string(),
                reason: "only node references can appear in attributes at apply time".to_string(),
            }),
        }
    };

    let mut out = Attributes::with_capacity(node.attributes.len());
    for (key, value) in &node.attributes {
        let resolved = expr::interpolate(value, &mut resolve)?;
        out.insert(key.clone(), expr::unescape(resolved));
    }
    Ok(out)
}

/// Best-effort resolution for an object being torn down; references to
/// records that are already gone stay as written
fn resolve_record_attributes(old: &StateRecord, store: &dyn StateStore) -> Attributes {
    let mut resolve = |r: &Reference| -> Result<Option<Value>> {
        match r {
            Reference::Node { address, path } => {
                Ok(lookup_node(&old.id, address, path, store).ok())
            }
            _ => Ok(None),
        }
    };
    old.attributes
        .iter()
        .map(|(key, value)| {
            let resolved = expr::interpolate(value, &mut resolve).unwrap_or_else(|_| value.clone());
            (key.clone(), expr::unescape(resolved))
        })
        .collect()
}

/// Run hooks in order; `self.*` resolves against the node's own attributes
/// overlaid with its outputs
fn run_hooks<'h>(
    node_id: &str,
    hooks: impl Iterator<Item = &'h Hook>,
    attributes: &Attributes,
    outputs: &Attributes,
    b: Backends<'_>,
) -> Result<()> {
    let mut own = attributes.clone();
    for (k, v) in outputs {
        own.insert(k.clone(), v.clone());
    }
    let own = Value::Map(own);

    for hook in hooks {
        let mut resolve = |r: &Reference| -> Result<Option<Value>> {
            match r {
                Reference::SelfAttr(path) => own.lookup_path(path).cloned().map(Some).ok_or_else(|| {
                    Error::InvalidReference {
                        expr: r.to_string(),
                        reason: format!("{node_id} has no attribute `{}`", path.join(".")),
                    }
                }),
                Reference::Node { address, path } => {
                    lookup_node(node_id, address, path, b.store).map(Some)
                }
                Reference::Variable(_) => Ok(None),
            }
        };
        let resolved = hook.interpolate(&mut resolve)?.unescaped();

        if let Err(e) = b.hooks.run(node_id, &resolved) {
            let message = if hook.sensitive {
                "failed; details hidden because the hook uses sensitive values".to_string()
            } else {
                format!("{e:#}")
            };
            let failure = Error::HookFailure {
                node: node_id.to_string(),
                hook: hook.kind().to_string(),
                message,
            };
            match hook.on_failure {
                OnFailure::Continue => log::warn!("{failure} (continuing)"),
                OnFailure::Fail => return Err(failure),
            }
        }
    }
    Ok(())
}
