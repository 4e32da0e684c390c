//! runestack - dependency-aware orchestration of multi-container stacks
//!
//! Given a stack of services with declared dependencies, runestack starts
//! them in dependency order, waits on health gates, shares named volumes
//! and networks between instances, and tears everything down in reverse.
//!
//! - [`stack`]: the service model and the dependency graph
//! - [`health`]: health probing of running instances
//! - [`resource`]: reference-counted volumes and networks
//! - [`orchestrator`]: up, down and scale
//! - [`compose`]: compose-style stack files
//! - [`driver`]: the image provider and runtime driver the core calls into

pub mod cancel;
pub mod compose;
pub mod config;
pub mod driver;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod resource;
pub mod stack;

pub use cancel::CancelToken;
pub use config::OrchestratorConfig;
pub use error::{LoadError, OrchestrationError, Result};
pub use orchestrator::{Orchestrator, StackHandle};
pub use stack::{ServiceGraph, Stack};
