//! # Convoflow
//!
//! Convoflow is a conversational flow execution engine written in Rust.
//! It drives multi-step interactions (wizards, checkouts, booking dialogs) as
//! state machines that pause between requests and resume by key.
//!
//! ## Core Features
//!
//! - **Flow Definitions**: View, action, decision, subflow and end states with first-match transitions
//! - **Scoped State**: Request, flash, view, flow and conversation scopes with distinct lifetimes
//! - **Snapshotting Repository**: Paused executions are stored as (optionally gzip compressed) snapshots
//! - **Conversation Locking**: Requests against one conversation are serialized by a reentrant lock
//! - **Listeners**: Lifecycle hooks, including vetoable state entry, attached by flow id globs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use convoflow::{AttributeMap, FlowBuilder, FlowDefinitionRegistry, FlowExecutorBuilder, LocalExternalContext, StateBuilder};
//!
//! let registry = Arc::new(FlowDefinitionRegistry::new());
//! registry.register(
//!     FlowBuilder::new("booking")
//!         .state(StateBuilder::view("enterData").on("submit", "confirm"))
//!         .state(StateBuilder::end("confirm"))
//!         .build()?,
//! );
//! let executor = FlowExecutorBuilder::new(registry).build()?;
//!
//! let paused = executor.launch_execution("booking", AttributeMap::new(), &mut LocalExternalContext::new())?;
//! let key = paused.key().unwrap().to_string();
//! let ended = executor.resume_execution(&key, &mut LocalExternalContext::with_event("submit"))?;
//! ```

mod builder;
mod common;
mod config;
mod definition;
mod error;
mod execution;
mod executor;
mod repository;
mod utils;

use std::sync::{Arc, RwLock};

pub use builder::FlowExecutorBuilder;
pub use common::*;
pub use config::{Config, ConversationConfig, ExecutionConfig, RepositoryConfig};
pub use definition::*;
pub use error::{ConvoflowError, UnmarshalKind};
pub use execution::*;
pub use executor::{FlowExecutionResult, FlowExecutor};
pub use repository::*;

/// Result type alias for Convoflow operations.
pub type Result<T> = std::result::Result<T, ConvoflowError>;

/// Thread-safe shared lock wrapper using Arc<RwLock<T>>.
pub(crate) type ShareLock<T> = Arc<RwLock<T>>;
