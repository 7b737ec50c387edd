//! Domain layer: workflow graphs, runs, events and the store abstraction

/// Component catalogue entries
pub mod component;

/// Branch guard expressions
pub mod condition;

/// Per-step execution context
pub mod context;

/// Orchestration events
pub mod events;

/// Workflow runs
pub mod execution;

/// Graph flatten/inflate codec
pub mod graph;

/// Source process definitions
pub mod process;

/// Document store traits
pub mod repository;

/// Workflow definitions
pub mod workflow;
