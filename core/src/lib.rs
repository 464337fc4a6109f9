//! Core library entry point that wires together the dispatch subsystems.
//!
//! Each module is intentionally kept lightweight so that the boundaries
//! between responsibilities remain obvious when exploring the codebase:
//! - [`providers`] holds the provider registry, the backend adapters and the
//!   seed configuration they are built from.
//! - [`dispatcher`] orchestrates triage, resolution, memory and failover.
//! - [`memory`] keeps per-user, per-session bounded conversation history.
//! - [`credentials`] persists per-user API keys behind an explicit cache.
//! - [`triage`] scores messages for urgency and emotional state.
//! - [`api`] exposes the HTTP surface that external clients invoke.
//! - [`store`] initialises the SQLite database, applies migrations and offers
//!   the transactional record store the stateful modules build on.
//! - [`errors`] keeps the central error catalogue with human friendly metadata.
//! - [`logging`] writes structured diagnostics to the event log table.

pub mod api;
pub mod credentials;
pub mod dispatcher;
pub mod errors;
pub mod logging;
pub mod memory;
pub mod providers;
pub mod store;
pub mod triage;
