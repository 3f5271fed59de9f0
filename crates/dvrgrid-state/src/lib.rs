//! dvrgrid-state — persisted router/agent bindings.
//!
//! Backed by [redb](https://docs.rs/redb), holds the two binding relations
//! the distributed-router scheduler maintains:
//!
//! - **Centralized SNAT bindings**: at most one per router, naming the agent
//!   that hosts the router's SNAT namespace.
//! - **Distributed host bindings**: one per (router, agent) pair, marking
//!   that the router must be present on that agent's host.
//!
//! # Architecture
//!
//! Values are JSON-serialized into redb's `&[u8]` value columns. SNAT
//! bindings are keyed by router id alone, so the key enforces the
//! one-per-router constraint. Host bindings use `{router_id}:{agent_id}`
//! composite keys for prefix scans per router.
//!
//! Multi-row mutations go through [`BindingStore::transaction`], which
//! commits on `Ok` and aborts on `Err`. redb admits a single writer at a
//! time, so racing writers serialize and the loser observes the winner's row.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{BindingStore, BindingTxn};
pub use types::*;
