//! redb table definitions for the binding store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized bindings).

use redb::TableDefinition;

/// Centralized SNAT bindings keyed by `{router_id}`.
pub const CSNAT_BINDINGS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("csnat_l3_agent_bindings");

/// Distributed host bindings keyed by `{router_id_len}:{router_id}:{agent_id}`.
pub const HOST_BINDINGS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("router_l3_agent_bindings");
