//! Progress and cancellation hooks for the executor
//!
//! These keep the crate free of any particular terminal UI or signal
//! handling; the caller plugs in its own implementations.

use crate::planner::Action;
use crate::types::ApplyResult;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Progress callback for execution operations
///
/// Called only from the coordinating thread, never from workers.
pub trait ProgressCallback: Send {
    /// Called once before any change starts
    fn on_apply_start(&mut self, total: usize);

    /// Called when a change is launched
    fn on_node_start(&mut self, id: &str, action: &Action);

    /// Called when a change reaches a terminal state
    fn on_node_complete(&mut self, id: &str, result: &ApplyResult);

    /// Called after the last change finished
    fn on_apply_complete(&mut self);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_apply_start(&mut self, _total: usize) {}
    fn on_node_start(&mut self, _id: &str, _action: &Action) {}
    fn on_node_complete(&mut self, _id: &str, _result: &ApplyResult) {}
    fn on_apply_complete(&mut self) {}
}

/// Cooperative cancellation flag shared between the caller and the executor
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from a signal handler.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
