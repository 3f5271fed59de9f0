//! Collaborator interfaces the scheduler consumes and produces.
//!
//! The port inventory, agent directory, and router lookup are owned by other
//! services; the notifiers push binding changes out to agents. They are
//! handed to the scheduler as one [`Services`] registry at construction.

use std::sync::Arc;

use dvr_core::{
    Agent, AgentConfiguration, DvrPortBinding, Port, RequestContext, Router, RouterId,
};

// ── Port inventory ─────────────────────────────────────────────────

/// Port query. Empty lists and `None` match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortFilter {
    /// Any fixed IP on one of these subnets.
    pub subnet_ids: Vec<String>,
    pub device_owners: Vec<String>,
    pub device_ids: Vec<String>,
    pub host: Option<String>,
}

impl PortFilter {
    pub fn on_subnet(mut self, subnet_id: &str) -> Self {
        self.subnet_ids.push(subnet_id.to_string());
        self
    }

    pub fn with_device_owner(mut self, device_owner: &str) -> Self {
        self.device_owners.push(device_owner.to_string());
        self
    }

    pub fn with_device_id(mut self, device_id: &str) -> Self {
        self.device_ids.push(device_id.to_string());
        self
    }

    pub fn on_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn matches(&self, port: &Port) -> bool {
        (self.subnet_ids.is_empty()
            || port
                .fixed_ips
                .iter()
                .any(|ip| self.subnet_ids.contains(&ip.subnet_id)))
            && (self.device_owners.is_empty() || self.device_owners.contains(&port.device_owner))
            && (self.device_ids.is_empty() || self.device_ids.contains(&port.device_id))
            && self
                .host
                .as_deref()
                .is_none_or(|host| port.host() == Some(host))
    }
}

/// Read access to ports, plus the one write the scheduler needs: clearing
/// the router linkage of a DVR interface port's per-host binding.
pub trait PortInventory: Send + Sync {
    fn get_port(&self, ctx: &RequestContext, port_id: &str) -> anyhow::Result<Option<Port>>;

    fn get_ports(&self, ctx: &RequestContext, filter: &PortFilter) -> anyhow::Result<Vec<Port>>;

    fn get_ports_on_host_by_subnet(
        &self,
        ctx: &RequestContext,
        host: &str,
        subnet_id: &str,
    ) -> anyhow::Result<Vec<Port>> {
        self.get_ports(ctx, &PortFilter::default().on_subnet(subnet_id).on_host(host))
    }

    /// Last host the port was bound to.
    fn get_port_binding_host(
        &self,
        ctx: &RequestContext,
        port_id: &str,
    ) -> anyhow::Result<Option<String>>;

    fn get_dvr_port_binding(
        &self,
        ctx: &RequestContext,
        port_id: &str,
        host: &str,
    ) -> anyhow::Result<Option<DvrPortBinding>>;

    fn update_dvr_port_binding(
        &self,
        ctx: &RequestContext,
        binding: &DvrPortBinding,
    ) -> anyhow::Result<()>;
}

// ── Agent directory ────────────────────────────────────────────────

/// Agent query. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentFilter {
    pub host: Option<String>,
    /// Admin-up and alive.
    pub active: Option<bool>,
}

impl AgentFilter {
    pub fn active() -> Self {
        Self {
            host: None,
            active: Some(true),
        }
    }

    pub fn on_host(host: &str) -> Self {
        Self {
            host: Some(host.to_string()),
            active: None,
        }
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        self.host.as_deref().is_none_or(|host| agent.host == host)
            && self.active.is_none_or(|active| agent.is_active() == active)
    }
}

pub trait AgentDirectory: Send + Sync {
    fn get_l3_agents(&self, filter: &AgentFilter) -> anyhow::Result<Vec<Agent>>;

    fn get_agent(&self, agent_id: &str) -> anyhow::Result<Option<Agent>>;

    /// The L3 agent running on `host`, if any.
    fn get_agent_by_host(&self, host: &str) -> anyhow::Result<Option<Agent>> {
        Ok(self
            .get_l3_agents(&AgentFilter::on_host(host))?
            .into_iter()
            .next())
    }

    fn get_agent_config(&self, agent: &Agent) -> AgentConfiguration {
        agent.configuration()
    }
}

// ── Router lookup ──────────────────────────────────────────────────

pub trait RouterLookup: Send + Sync {
    fn get_router(&self, ctx: &RequestContext, router_id: &str) -> anyhow::Result<Option<Router>>;
}

// ── Outbound notifications ─────────────────────────────────────────

/// Best-effort push of binding changes to L3 agents.
///
/// Delivery is fire-and-forget; agents reconcile through their own
/// periodic resync.
pub trait L3Notifier: Send + Sync {
    fn routers_updated_on_host(&self, ctx: &RequestContext, router_ids: &[RouterId], host: &str);

    fn router_removed_from_agent(&self, ctx: &RequestContext, router_id: &str, host: &str);

    fn routers_updated(&self, ctx: &RequestContext, router_ids: &[RouterId], schedule_routers: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpAction {
    Add,
    Del,
}

impl ArpAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArpAction::Add => "add",
            ArpAction::Del => "del",
        }
    }
}

/// Address-resolution refresh for a serviced port's neighbours.
pub trait ArpEntryUpdater: Send + Sync {
    fn update_arp_entry(&self, ctx: &RequestContext, port: &Port, action: ArpAction);
}

// ── Registry ───────────────────────────────────────────────────────

/// Everything the scheduler and port handlers call out to.
#[derive(Clone)]
pub struct Services {
    pub inventory: Arc<dyn PortInventory>,
    pub agents: Arc<dyn AgentDirectory>,
    pub routers: Arc<dyn RouterLookup>,
    pub notifier: Arc<dyn L3Notifier>,
    pub arp: Arc<dyn ArpEntryUpdater>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvr_core::FixedIp;
    use serde_json::Map;

    fn port(owner: &str, host: Option<&str>, subnets: &[&str]) -> Port {
        Port {
            id: "p1".to_string(),
            tenant_id: "t1".to_string(),
            network_id: "n1".to_string(),
            device_id: "vm1".to_string(),
            device_owner: owner.to_string(),
            mac_address: "fa:16:3e:00:00:01".to_string(),
            binding_host: host.map(str::to_string),
            fixed_ips: subnets
                .iter()
                .map(|s| FixedIp {
                    subnet_id: s.to_string(),
                    ip_address: "10.0.0.5".to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn empty_port_filter_matches_everything() {
        assert!(PortFilter::default().matches(&port("compute:nova", None, &[])));
    }

    #[test]
    fn port_filter_combines_criteria() {
        let p = port("compute:nova", Some("h1"), &["s1", "s2"]);

        assert!(PortFilter::default().on_subnet("s2").matches(&p));
        assert!(!PortFilter::default().on_subnet("s3").matches(&p));
        assert!(PortFilter::default().on_subnet("s1").on_host("h1").matches(&p));
        assert!(!PortFilter::default().on_subnet("s1").on_host("h2").matches(&p));
        assert!(!PortFilter::default()
            .with_device_owner("network:dhcp")
            .matches(&p));
        assert!(PortFilter::default().with_device_id("vm1").matches(&p));
    }

    #[test]
    fn unbound_port_never_matches_host_filter() {
        let p = port("compute:nova", Some(""), &["s1"]);
        assert!(!PortFilter::default().on_host("").matches(&p));
    }

    #[test]
    fn agent_filter_active_requires_admin_up_and_alive() {
        let mut agent = Agent {
            id: "a1".to_string(),
            host: "h1".to_string(),
            admin_state_up: true,
            alive: true,
            configurations: Map::new(),
        };
        assert!(AgentFilter::active().matches(&agent));
        assert!(AgentFilter::on_host("h1").matches(&agent));
        assert!(!AgentFilter::on_host("h2").matches(&agent));

        agent.alive = false;
        assert!(!AgentFilter::active().matches(&agent));
        agent.alive = true;
        agent.admin_state_up = false;
        assert!(!AgentFilter::active().matches(&agent));
    }
}
