//! In-memory collaborators.
//!
//! Map-backed implementations of the inventory, agent directory, and router
//! lookup, plus a notifier that records what it was asked to send. Used by
//! tests and for running the scheduler without the surrounding services.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::{Map, Value};
use tracing::debug;

use dvr_core::{Agent, AgentId, DvrPortBinding, Port, PortId, RequestContext, Router, RouterId};

use crate::services::{
    AgentDirectory, AgentFilter, ArpAction, ArpEntryUpdater, L3Notifier, PortFilter,
    PortInventory, RouterLookup, Services,
};

// ── Ports ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryInventory {
    ports: RwLock<BTreeMap<PortId, Port>>,
    /// Keyed by `(port_id, host)`.
    dvr_bindings: RwLock<BTreeMap<(PortId, String), DvrPortBinding>>,
}

impl InMemoryInventory {
    pub fn put_port(&self, port: Port) {
        let mut ports = self.ports.write().unwrap_or_else(PoisonError::into_inner);
        ports.insert(port.id.clone(), port);
    }

    pub fn remove_port(&self, port_id: &str) -> Option<Port> {
        let mut ports = self.ports.write().unwrap_or_else(PoisonError::into_inner);
        ports.remove(port_id)
    }

    pub fn put_dvr_port_binding(&self, binding: DvrPortBinding) {
        let mut bindings = self
            .dvr_bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        bindings.insert((binding.port_id.clone(), binding.host.clone()), binding);
    }

    pub fn dvr_port_binding(&self, port_id: &str, host: &str) -> Option<DvrPortBinding> {
        let bindings = self
            .dvr_bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        bindings
            .get(&(port_id.to_string(), host.to_string()))
            .cloned()
    }
}

impl PortInventory for InMemoryInventory {
    fn get_port(&self, ctx: &RequestContext, port_id: &str) -> anyhow::Result<Option<Port>> {
        let ports = self.ports.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ports
            .get(port_id)
            .filter(|p| ctx.can_see(&p.tenant_id))
            .cloned())
    }

    fn get_ports(&self, ctx: &RequestContext, filter: &PortFilter) -> anyhow::Result<Vec<Port>> {
        let ports = self.ports.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ports
            .values()
            .filter(|p| ctx.can_see(&p.tenant_id) && filter.matches(p))
            .cloned()
            .collect())
    }

    fn get_port_binding_host(
        &self,
        _ctx: &RequestContext,
        port_id: &str,
    ) -> anyhow::Result<Option<String>> {
        let ports = self.ports.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ports
            .get(port_id)
            .and_then(|p| p.host())
            .map(str::to_string))
    }

    fn get_dvr_port_binding(
        &self,
        _ctx: &RequestContext,
        port_id: &str,
        host: &str,
    ) -> anyhow::Result<Option<DvrPortBinding>> {
        Ok(self.dvr_port_binding(port_id, host))
    }

    fn update_dvr_port_binding(
        &self,
        _ctx: &RequestContext,
        binding: &DvrPortBinding,
    ) -> anyhow::Result<()> {
        let mut bindings = self
            .dvr_bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let key = (binding.port_id.clone(), binding.host.clone());
        anyhow::ensure!(
            bindings.contains_key(&key),
            "no DVR binding for port {} on host {}",
            binding.port_id,
            binding.host
        );
        bindings.insert(key, binding.clone());
        Ok(())
    }
}

// ── Agents ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryAgentDirectory {
    agents: RwLock<BTreeMap<AgentId, Agent>>,
}

impl InMemoryAgentDirectory {
    pub fn put_agent(&self, agent: Agent) {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        agents.insert(agent.id.clone(), agent);
    }

    pub fn remove_agent(&self, agent_id: &str) -> Option<Agent> {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        agents.remove(agent_id)
    }
}

impl AgentDirectory for InMemoryAgentDirectory {
    fn get_l3_agents(&self, filter: &AgentFilter) -> anyhow::Result<Vec<Agent>> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        Ok(agents.values().filter(|a| filter.matches(a)).cloned().collect())
    }

    fn get_agent(&self, agent_id: &str) -> anyhow::Result<Option<Agent>> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        Ok(agents.get(agent_id).cloned())
    }
}

// ── Routers ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryRouters {
    routers: RwLock<BTreeMap<RouterId, Router>>,
}

impl InMemoryRouters {
    pub fn put_router(&self, router: Router) {
        let mut routers = self.routers.write().unwrap_or_else(PoisonError::into_inner);
        routers.insert(router.id.clone(), router);
    }
}

impl RouterLookup for InMemoryRouters {
    fn get_router(&self, _ctx: &RequestContext, router_id: &str) -> anyhow::Result<Option<Router>> {
        let routers = self.routers.read().unwrap_or_else(PoisonError::into_inner);
        Ok(routers.get(router_id).cloned())
    }
}

// ── Notifications ──────────────────────────────────────────────────

/// A notification the scheduler asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    RoutersUpdatedOnHost {
        router_ids: Vec<RouterId>,
        host: String,
    },
    RouterRemovedFromAgent {
        router_id: RouterId,
        host: String,
    },
    RoutersUpdated {
        router_ids: Vec<RouterId>,
        schedule_routers: bool,
    },
    ArpEntry {
        port_id: PortId,
        action: ArpAction,
    },
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    fn record(&self, notification: Notification) {
        debug!(?notification, "notification recorded");
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }

    /// Drain everything recorded so far.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl L3Notifier for RecordingNotifier {
    fn routers_updated_on_host(&self, _ctx: &RequestContext, router_ids: &[RouterId], host: &str) {
        self.record(Notification::RoutersUpdatedOnHost {
            router_ids: router_ids.to_vec(),
            host: host.to_string(),
        });
    }

    fn router_removed_from_agent(&self, _ctx: &RequestContext, router_id: &str, host: &str) {
        self.record(Notification::RouterRemovedFromAgent {
            router_id: router_id.to_string(),
            host: host.to_string(),
        });
    }

    fn routers_updated(&self, _ctx: &RequestContext, router_ids: &[RouterId], schedule_routers: bool) {
        self.record(Notification::RoutersUpdated {
            router_ids: router_ids.to_vec(),
            schedule_routers,
        });
    }
}

impl ArpEntryUpdater for RecordingNotifier {
    fn update_arp_entry(&self, _ctx: &RequestContext, port: &Port, action: ArpAction) {
        self.record(Notification::ArpEntry {
            port_id: port.id.clone(),
            action,
        });
    }
}

// ── Bundle ─────────────────────────────────────────────────────────

/// One of each in-memory collaborator, wired into a [`Services`] registry.
#[derive(Clone, Default)]
pub struct InMemoryFabric {
    pub inventory: Arc<InMemoryInventory>,
    pub agents: Arc<InMemoryAgentDirectory>,
    pub routers: Arc<InMemoryRouters>,
    pub notifier: Arc<RecordingNotifier>,
}

impl InMemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> Services {
        Services {
            inventory: self.inventory.clone(),
            agents: self.agents.clone(),
            routers: self.routers.clone(),
            notifier: self.notifier.clone(),
            arp: self.notifier.clone(),
        }
    }

    /// An admin-up, alive agent reporting `agent_mode = mode`.
    pub fn agent(id: &str, host: &str, mode: &str) -> Agent {
        let mut configurations = Map::new();
        configurations.insert("agent_mode".to_string(), Value::String(mode.to_string()));
        Agent {
            id: id.to_string(),
            host: host.to_string(),
            admin_state_up: true,
            alive: true,
            configurations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvr_core::FixedIp;

    fn port(id: &str, tenant: &str, host: &str) -> Port {
        Port {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            network_id: "n1".to_string(),
            device_id: format!("vm-{id}"),
            device_owner: "compute:nova".to_string(),
            mac_address: "fa:16:3e:00:00:01".to_string(),
            binding_host: Some(host.to_string()),
            fixed_ips: vec![FixedIp {
                subnet_id: "s1".to_string(),
                ip_address: "10.0.0.5".to_string(),
            }],
        }
    }

    #[test]
    fn tenant_context_hides_other_tenants_ports() {
        let inventory = InMemoryInventory::default();
        inventory.put_port(port("p1", "t1", "h1"));
        inventory.put_port(port("p2", "t2", "h1"));

        let tenant = RequestContext::for_tenant("t1");
        let all = PortFilter::default();
        assert_eq!(inventory.get_ports(&tenant, &all).unwrap().len(), 1);
        assert!(inventory.get_port(&tenant, "p2").unwrap().is_none());
        assert_eq!(inventory.get_ports(&tenant.elevated(), &all).unwrap().len(), 2);
    }

    #[test]
    fn ports_on_host_by_subnet() {
        let inventory = InMemoryInventory::default();
        inventory.put_port(port("p1", "t1", "h1"));
        inventory.put_port(port("p2", "t1", "h2"));

        let found = inventory
            .get_ports_on_host_by_subnet(&RequestContext::admin(), "h2", "s1")
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "p2");
    }

    #[test]
    fn update_requires_existing_dvr_binding() {
        let inventory = InMemoryInventory::default();
        let binding = DvrPortBinding {
            port_id: "dvr-1".to_string(),
            host: "h1".to_string(),
            router_id: None,
        };
        assert!(inventory
            .update_dvr_port_binding(&RequestContext::admin(), &binding)
            .is_err());
    }

    #[test]
    fn notifier_records_in_order() {
        let notifier = RecordingNotifier::default();
        let ctx = RequestContext::admin();
        notifier.routers_updated(&ctx, &["r1".to_string()], false);
        notifier.router_removed_from_agent(&ctx, "r1", "h1");

        let sent = notifier.take();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Notification::RoutersUpdated { .. }));
        assert!(notifier.take().is_empty());
    }
}
