//! Application layer: registries, event dispatch, the orchestrator and the
//! runtime engine

/// Inbound connector callbacks
pub mod connectors;

/// Process definition converters
pub mod converter;

/// Event bus, publisher and dispatcher
pub mod dispatch;

/// Event handlers and their routing table
pub mod handlers;

/// Fire-and-forget interaction log
pub mod interaction;

/// Orchestration state machine
pub mod orchestrator;

/// Entity registries over the document store
pub mod registry;

/// Facade wiring everything together
pub mod runtime_interface;

/// Component runtime engine
pub mod runtime_engine;
