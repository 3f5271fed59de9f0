//! Shared types used across dvrgrid crates.
//!
//! Routers, agents, and ports are owned by external services (the router
//! lifecycle API, agent heartbeats, the port inventory). These types are the
//! read model the scheduler works against.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type RouterId = String;
pub type AgentId = String;
pub type PortId = String;
pub type SubnetId = String;
pub type NetworkId = String;

// ── Device owners ──────────────────────────────────────────────────

/// Prefix shared by every VM port (`compute:<availability-zone>`).
pub const DEVICE_OWNER_COMPUTE_PREFIX: &str = "compute:";
/// Internal attachment of a distributed router on a subnet.
pub const DEVICE_OWNER_DVR_INTERFACE: &str = "network:router_interface_distributed";
pub const DEVICE_OWNER_ROUTER_GATEWAY: &str = "network:router_gateway";
pub const DEVICE_OWNER_AGENT_GATEWAY: &str = "network:floatingip_agent_gateway";
pub const DEVICE_OWNER_ROUTER_SNAT: &str = "network:router_centralized_snat";
pub const DEVICE_OWNER_DHCP: &str = "network:dhcp";
pub const DEVICE_OWNER_LOADBALANCER: &str = "neutron:LOADBALANCER";
pub const DEVICE_OWNER_LOADBALANCERV2: &str = "neutron:LOADBALANCERV2";

/// Whether a port with this device owner needs distributed-router presence
/// on the host it is bound to.
pub fn is_dvr_serviced(device_owner: &str) -> bool {
    device_owner.starts_with(DEVICE_OWNER_COMPUTE_PREFIX)
        || matches!(
            device_owner,
            DEVICE_OWNER_DHCP | DEVICE_OWNER_LOADBALANCER | DEVICE_OWNER_LOADBALANCERV2
        )
}

// ── Router ─────────────────────────────────────────────────────────

/// External gateway attached to a router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalGateway {
    pub network_id: NetworkId,
    /// The router's gateway port on the external network, once allocated.
    #[serde(default)]
    pub port_id: Option<PortId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: RouterId,
    pub tenant_id: String,
    pub distributed: bool,
    #[serde(default)]
    pub external_gateway: Option<ExternalGateway>,
}

impl Router {
    pub fn has_gateway(&self) -> bool {
        self.external_gateway.is_some()
    }

    pub fn gateway_network_id(&self) -> Option<&str> {
        self.external_gateway.as_ref().map(|gw| gw.network_id.as_str())
    }

    pub fn gateway_port_id(&self) -> Option<&str> {
        self.external_gateway
            .as_ref()
            .and_then(|gw| gw.port_id.as_deref())
    }
}

// ── Agent ──────────────────────────────────────────────────────────

/// Operating mode reported by an L3 agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    #[default]
    Legacy,
    Dvr,
    DvrSnat,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Legacy => "legacy",
            AgentMode::Dvr => "dvr",
            AgentMode::DvrSnat => "dvr_snat",
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown agent mode: {0}")]
pub struct UnknownAgentMode(pub String);

impl FromStr for AgentMode {
    type Err = UnknownAgentMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(AgentMode::Legacy),
            "dvr" => Ok(AgentMode::Dvr),
            "dvr_snat" => Ok(AgentMode::DvrSnat),
            other => Err(UnknownAgentMode(other.to_string())),
        }
    }
}

/// Typed view of the configuration map an agent reports in its heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfiguration {
    pub agent_mode: AgentMode,
    /// Agent is pinned to a single router.
    pub router_id: Option<RouterId>,
    /// Agent accepts routers without an external gateway.
    pub handle_internal_only_routers: bool,
    /// Agent only serves routers whose gateway is on this network.
    pub gateway_external_network_id: Option<NetworkId>,
}

impl Default for AgentConfiguration {
    fn default() -> Self {
        Self {
            agent_mode: AgentMode::Legacy,
            router_id: None,
            handle_internal_only_routers: true,
            gateway_external_network_id: None,
        }
    }
}

impl AgentConfiguration {
    /// Build from the raw reported map. Missing or malformed keys fall back
    /// to the defaults; empty strings count as unset.
    pub fn from_reported(reported: &Map<String, Value>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| {
            reported
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            agent_mode: reported
                .get("agent_mode")
                .and_then(Value::as_str)
                .and_then(|m| m.parse().ok())
                .unwrap_or(defaults.agent_mode),
            router_id: non_empty("router_id"),
            handle_internal_only_routers: reported
                .get("handle_internal_only_routers")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.handle_internal_only_routers),
            gateway_external_network_id: non_empty("gateway_external_network_id"),
        }
    }
}

/// An L3 control agent as seen through the agent directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub host: String,
    pub admin_state_up: bool,
    /// Heartbeats are arriving within the liveness window.
    #[serde(default = "default_true")]
    pub alive: bool,
    #[serde(default)]
    pub configurations: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Agent {
    pub fn configuration(&self) -> AgentConfiguration {
        AgentConfiguration::from_reported(&self.configurations)
    }

    pub fn is_active(&self) -> bool {
        self.admin_state_up && self.alive
    }
}

// ── Port ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: SubnetId,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub tenant_id: String,
    pub network_id: NetworkId,
    /// Owning device (VM id, router id, ...).
    pub device_id: String,
    pub device_owner: String,
    pub mac_address: String,
    /// Host the port is bound to, if any.
    #[serde(default)]
    pub binding_host: Option<String>,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

impl Port {
    pub fn is_dvr_serviced(&self) -> bool {
        is_dvr_serviced(&self.device_owner)
    }

    /// The bound host, with the empty string treated as unbound.
    pub fn host(&self) -> Option<&str> {
        self.binding_host.as_deref().filter(|h| !h.is_empty())
    }
}

/// Per-host binding of a distributed-router interface port.
///
/// A DVR interface port exists once per subnet but is bound on every host
/// that hosts the router; each host gets one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DvrPortBinding {
    pub port_id: PortId,
    pub host: String,
    pub router_id: Option<RouterId>,
}

// ── Request context ────────────────────────────────────────────────

/// Authorization scope a request runs under.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestContext {
    pub tenant_id: Option<String>,
    pub is_admin: bool,
}

impl RequestContext {
    pub fn for_tenant(tenant_id: &str) -> Self {
        Self {
            tenant_id: Some(tenant_id.to_string()),
            is_admin: false,
        }
    }

    pub fn admin() -> Self {
        Self {
            tenant_id: None,
            is_admin: true,
        }
    }

    /// Same request, cross-tenant visibility.
    pub fn elevated(&self) -> Self {
        Self {
            tenant_id: self.tenant_id.clone(),
            is_admin: true,
        }
    }

    /// Whether a resource owned by `tenant_id` is visible in this context.
    pub fn can_see(&self, tenant_id: &str) -> bool {
        self.is_admin || self.tenant_id.as_deref() == Some(tenant_id)
    }
}
