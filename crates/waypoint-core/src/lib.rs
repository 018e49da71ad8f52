//! Waypoint Core — transport-agnostic domain logic for the Waypoint
//! workflow orchestrator.
//!
//! This crate contains the orchestration engine, the workflow definition
//! service, the SQLite persistence layer, and the AI client contract with
//! its Gemini and stub implementations. It has **no HTTP framework
//! dependency** by default, making it suitable for use in:
//!
//! - HTTP servers (via `waypoint-server`)
//! - CLI tools and one-off scripts
//! - Test harnesses that drive the engine directly
//!
//! # Feature Flags
//!
//! - `axum` — Enables `IntoResponse` impl on `EngineError` for use in
//!   axum handlers.

pub mod ai;
pub mod config;
pub mod db;
pub mod definitions;
pub mod engine;
pub mod error;
pub mod models;
pub mod state;
pub mod store;

// Convenience re-exports
pub use db::Database;
pub use engine::OrchestrationEngine;
pub use error::EngineError;
pub use state::{AppState, AppStateInner};
