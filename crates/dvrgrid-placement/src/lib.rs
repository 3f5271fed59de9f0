//! Placement policy for distributed routers.
//!
//! This crate makes placement decisions only. It does NOT touch the binding
//! store (that's `dvrgrid-scheduler`). Given a router and the known agents,
//! it filters the agents able to host the router's centralized SNAT and
//! picks one of them.
//!
//! # Components
//!
//! - **`candidates`** — SNAT eligibility rules per agent
//! - **`selector`** — Uniform random choice over a seedable source

pub mod candidates;
pub mod selector;

pub use candidates::{SnatRejection, check_snat_candidate, snat_candidates};
pub use selector::{SnatSelector, choose_uniform};
