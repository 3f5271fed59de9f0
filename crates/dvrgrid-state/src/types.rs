//! Persisted binding rows.

use serde::{Deserialize, Serialize};

/// The agent hosting a distributed router's centralized SNAT.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CentralizedSnatBinding {
    pub router_id: String,
    pub l3_agent_id: String,
    /// Host of the bound agent, recorded at bind time.
    pub host_id: String,
    /// Router gateway port the SNAT namespace serves.
    pub csnat_gw_port_id: Option<String>,
}

impl CentralizedSnatBinding {
    pub fn table_key(&self) -> String {
        self.router_id.clone()
    }
}

/// Router presence on an agent's host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DistributedHostBinding {
    pub router_id: String,
    pub l3_agent_id: String,
}

impl DistributedHostBinding {
    pub fn new(router_id: &str, agent_id: &str) -> Self {
        Self {
            router_id: router_id.to_string(),
            l3_agent_id: agent_id.to_string(),
        }
    }

    /// Build the composite key for the host bindings table.
    pub fn table_key(&self) -> String {
        host_binding_key(&self.router_id, &self.l3_agent_id)
    }
}

/// `{router_id_len}:{router_id}:{agent_id}`; the length prefix keeps ids
/// containing `:` from colliding.
pub(crate) fn host_binding_key(router_id: &str, agent_id: &str) -> String {
    format!("{}:{router_id}:{agent_id}", router_id.len())
}
