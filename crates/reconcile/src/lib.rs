//! # Reconcile
//!
//! A declarative reconciliation engine.
//!
//! Users declare infrastructure as nodes with attributes and dependencies.
//! The engine works out what has to change by comparing that declaration
//! with the last-applied state, then applies the changes in dependency
//! order with bounded parallelism.
//!
//! ## Core Concepts
//!
//! - **Configuration**: TOML files declaring variables, nodes and outputs
//! - **Variables**: Typed inputs resolved from defaults, files, the environment and flags
//! - **Graph**: Nodes plus the edges derived from references and `depends_on`
//! - **ChangeSet**: The ordered plan of actions produced by [`plan`]
//! - **StateStore**: The last-applied snapshot, the only data kept between runs
//! - **Provider**: The side effect behind a node type
//!
//! ## Example
//!
//! ```ignore
//! use reconcile::{
//!     Configuration, LocalStateStore, NoProgress, PlanOptions, ProviderRegistry,
//!     CommandHookRunner, ExecuteOptions, StateStore,
//! };
//!
//! let config = Configuration::load("infra".as_ref())?;
//! let sources = config.sources(&[], &[])?;
//! let vars = reconcile::resolve(&config.variables, &sources)?;
//! let graph = reconcile::build(config.nodes(&vars)?)?;
//!
//! let store = LocalStateStore::open(config.state_path())?;
//! let changes = reconcile::plan(&graph, &store.snapshot()?, &PlanOptions::default())?;
//! let report = reconcile::apply(
//!     &changes,
//!     &store,
//!     &ProviderRegistry::with_builtins(),
//!     &CommandHookRunner,
//!     &ExecuteOptions::default(),
//!     &mut NoProgress,
//! )?;
//! ```
//!
//! ## Extension Traits
//!
//! - [`StateStore`]: Where state lives
//! - [`Provider`]: Side effects for a node type
//! - [`HookRunner`]: How lifecycle hooks are executed
//! - [`ProgressCallback`]: Receives progress updates
//!
//! The crate has no terminal or signal handling of its own; callers plug
//! those in through the traits above and [`CancelToken`].

pub mod config;
pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod expr;
pub mod graph;
pub mod hooks;
pub mod planner;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod state;
pub mod types;
pub mod value;
pub mod variables;

// Re-export main types at crate root
pub use config::{Configuration, OutputDecl, Settings};
pub use context::{CancelToken, NoProgress, ProgressCallback};
pub use diff::{AttributeChange, REDACTED};
pub use error::{Error, ErrorCategory, Result};
pub use executor::apply;
pub use graph::{Graph, build};
pub use hooks::{CommandHookRunner, Hook, HookAction, HookRunner, HookWhen, OnFailure};
pub use planner::{
    Action, Change, ChangeSet, PlanMode, PlanOptions, PlanSummary, ReplaceOrder, ReplacePolicy,
    plan,
};
pub use provider::{Provider, ProviderRegistry, ProviderRequest};
pub use retry::RetryConfig;
pub use state::{
    LocalStateStore, LockInfo, MemoryStateStore, OutputValue, StateLock, StateRecord,
    StateSnapshot, StateStore, acquire_lock,
};
pub use types::{ApplyReport, ApplyResult, ExecuteOptions, ExecuteSummary, Node, NodeId, NodeKind};
pub use value::{Attributes, Value, VarType};
pub use variables::{ResolvedVariables, VariableDecl, VariableSources, resolve};
