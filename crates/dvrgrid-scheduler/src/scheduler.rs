//! DvrScheduler — binding decisions for distributed routers.
//!
//! A distributed router lives in two kinds of places:
//! - on every compute host that runs a serviced port on one of its subnets
//!   (a distributed host binding per agent)
//! - on exactly one `dvr_snat` agent that hosts its centralized SNAT, when
//!   the router has an external gateway (a SNAT binding, plus a host
//!   binding for that agent's own router namespace)
//!
//! Host bindings follow port presence; SNAT bindings follow the gateway.
//! Everything not specific to distributed routers is delegated to the
//! wrapped [`RouterScheduler`].

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use dvr_core::config::SchedulerConfig;
use dvr_core::{
    Agent, AgentId, AgentMode, DEVICE_OWNER_DVR_INTERFACE, FixedIp, Port, RequestContext,
    Router, RouterId, SubnetId,
};
use dvrgrid_placement::{SnatSelector, snat_candidates};
use dvrgrid_state::{BindingStore, BindingTxn, CentralizedSnatBinding, DistributedHostBinding};

use crate::error::{SchedulerError, SchedulerResult};
use crate::generic::RouterScheduler;
use crate::services::{AgentFilter, PortFilter, Services};

/// Result of trying to place a router's SNAT.
#[derive(Debug, Clone, PartialEq)]
pub enum SnatOutcome {
    Bound(Agent),
    /// The router has no external gateway; nothing to centralize.
    NoGateway,
    NoActiveAgents,
    NoCandidates,
    /// Another scheduler committed a SNAT binding first.
    AlreadyBound,
}

impl SnatOutcome {
    pub fn bound_agent(&self) -> Option<&Agent> {
        match self {
            SnatOutcome::Bound(agent) => Some(agent),
            _ => None,
        }
    }
}

/// A router namespace that is no longer needed on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedRouter {
    pub router_id: RouterId,
    pub host: String,
    pub agent_id: AgentId,
}

/// What happened to the SNAT agent's own host binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceNodeUnbind {
    /// Serviced ports remain on the host; the router namespace stays.
    Kept { host: String },
    /// Host binding deleted; the agent must tear the router down.
    Removed { host: String },
}

/// A released SNAT binding and the fate of its host binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnatUnbind {
    pub binding: CentralizedSnatBinding,
    pub service_node: ServiceNodeUnbind,
}

pub struct DvrScheduler {
    services: Services,
    store: BindingStore,
    generic: Arc<dyn RouterScheduler>,
    selector: SnatSelector,
}

impl DvrScheduler {
    pub fn new(services: Services, store: BindingStore, generic: Arc<dyn RouterScheduler>) -> Self {
        Self {
            services,
            store,
            generic,
            selector: SnatSelector::from_entropy(),
        }
    }

    /// Build with the selector seeded per `[scheduler]` configuration.
    pub fn configured(
        services: Services,
        store: BindingStore,
        generic: Arc<dyn RouterScheduler>,
        config: &SchedulerConfig,
    ) -> Self {
        Self::new(services, store, generic)
            .with_selector(SnatSelector::from_seed_option(config.snat_selection_seed))
    }

    /// Replace the random source used to pick SNAT agents.
    pub fn with_selector(mut self, selector: SnatSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn store(&self) -> &BindingStore {
        &self.store
    }

    // ── Port-driven host bindings ──────────────────────────────────

    /// Routers with a DVR interface on any subnet of the given fixed IPs.
    ///
    /// When `fixed_ips` is `None` they are read from the port itself.
    pub fn dvr_routers_for_port(
        &self,
        ctx: &RequestContext,
        port_id: &str,
        fixed_ips: Option<&[FixedIp]>,
    ) -> SchedulerResult<BTreeSet<RouterId>> {
        let fetched;
        let fixed_ips = match fixed_ips {
            Some(ips) => ips,
            None => match self.services.inventory.get_port(ctx, port_id)? {
                Some(port) => {
                    fetched = port.fixed_ips;
                    fetched.as_slice()
                }
                None => {
                    debug!(%port_id, "port not found, no DVR routers");
                    return Ok(BTreeSet::new());
                }
            },
        };

        if fixed_ips.is_empty() {
            debug!(%port_id, "port has no fixed IPs, no DVR routers");
        }

        let mut router_ids = BTreeSet::new();
        for fixed_ip in fixed_ips {
            let filter = PortFilter::default()
                .on_subnet(&fixed_ip.subnet_id)
                .with_device_owner(DEVICE_OWNER_DVR_INTERFACE);
            for subnet_port in self.services.inventory.get_ports(ctx, &filter)? {
                router_ids.insert(subnet_port.device_id);
            }
        }
        Ok(router_ids)
    }

    /// Subnets the router has interfaces on.
    pub fn subnet_ids_on_router(
        &self,
        ctx: &RequestContext,
        router_id: &str,
    ) -> SchedulerResult<BTreeSet<SubnetId>> {
        let filter = PortFilter::default().with_device_id(router_id);
        let mut subnet_ids = BTreeSet::new();
        for int_port in self.services.inventory.get_ports(ctx, &filter)? {
            match int_port.fixed_ips.first() {
                Some(fixed_ip) => {
                    subnet_ids.insert(fixed_ip.subnet_id.clone());
                }
                None => debug!(
                    %router_id,
                    port_id = %int_port.id,
                    "could not find a subnet id for router interface"
                ),
            }
        }
        Ok(subnet_ids)
    }

    /// Whether any serviced port other than `except_port` sits on `host`
    /// in one of `subnet_ids`.
    pub fn check_dvr_serviceable_ports_on_host(
        &self,
        ctx: &RequestContext,
        host: &str,
        subnet_ids: &BTreeSet<SubnetId>,
        except_port: Option<&str>,
    ) -> SchedulerResult<bool> {
        for subnet_id in subnet_ids {
            let ports = self
                .services
                .inventory
                .get_ports_on_host_by_subnet(ctx, host, subnet_id)?;
            if ports
                .iter()
                .any(|p| p.is_dvr_serviced() && Some(p.id.as_str()) != except_port)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Bring the port's routers to the port's host.
    ///
    /// Returns the routers the host was notified about; empty when the host
    /// runs no L3 agent.
    pub fn on_new_service_port(
        &self,
        ctx: &RequestContext,
        port: &Port,
    ) -> SchedulerResult<Vec<RouterId>> {
        let Some(host) = port.host() else {
            debug!(port_id = %port.id, "port is not bound to a host");
            return Ok(Vec::new());
        };
        let Some(agent) = self.services.agents.get_agent_by_host(host)? else {
            debug!(port_id = %port.id, %host, "no L3 agent on host");
            return Ok(Vec::new());
        };

        let router_ids = self.dvr_routers_for_port(ctx, &port.id, Some(&port.fixed_ips))?;
        for router_id in &router_ids {
            if !self.store.has_host_binding(router_id, &agent.id)? {
                self.generic
                    .schedule_router(ctx, router_id, std::slice::from_ref(&agent))?;
            }
            debug!(%router_id, port_id = %port.id, "handled new service port on router");
        }

        let router_ids: Vec<RouterId> = router_ids.into_iter().collect();
        if !router_ids.is_empty() {
            self.services
                .notifier
                .routers_updated_on_host(ctx, &router_ids, host);
        }
        Ok(router_ids)
    }

    /// Find router namespaces that become unneeded on a host once `port_id`
    /// is gone from it.
    ///
    /// `host` defaults to the port's last bound host. The DVR interface
    /// bindings of each such router on that host are unlinked; the caller
    /// turns the returned records into agent notifications.
    pub fn teardown_if_unneeded(
        &self,
        ctx: &RequestContext,
        port_id: &str,
        host: Option<&str>,
    ) -> SchedulerResult<Vec<RemovedRouter>> {
        // The last serviced port on a shared network may belong to another
        // tenant than the router.
        let admin = ctx.elevated();
        let router_ids = self.dvr_routers_for_port(&admin, port_id, None)?;

        let host = match host.filter(|h| !h.is_empty()) {
            Some(host) => host.to_string(),
            None => match self.services.inventory.get_port_binding_host(&admin, port_id)? {
                Some(host) if !host.is_empty() => host,
                _ => {
                    debug!(%port_id, "host name not found for port");
                    return Ok(Vec::new());
                }
            },
        };

        if router_ids.is_empty() {
            debug!(%port_id, %host, "no router namespaces for this port");
            return Ok(Vec::new());
        }

        let agent = self.services.agents.get_agent_by_host(&host)?;
        let mut removed = Vec::new();
        for router_id in router_ids {
            let subnet_ids = self.subnet_ids_on_router(&admin, &router_id)?;
            if self.check_dvr_serviceable_ports_on_host(&admin, &host, &subnet_ids, Some(port_id))? {
                continue;
            }
            // Interface linkage stays until an agent can act on the removal.
            let Some(agent) = &agent else {
                warn!(%router_id, %host, "no L3 agent on host for unneeded router namespace");
                continue;
            };

            let filter = PortFilter::default()
                .with_device_id(&router_id)
                .with_device_owner(DEVICE_OWNER_DVR_INTERFACE);
            for int_port in self.services.inventory.get_ports(&admin, &filter)? {
                if let Some(mut binding) = self
                    .services
                    .inventory
                    .get_dvr_port_binding(&admin, &int_port.id, &host)?
                {
                    binding.router_id = None;
                    self.services
                        .inventory
                        .update_dvr_port_binding(&admin, &binding)?;
                }
            }

            debug!(%router_id, %host, "router namespace to be deleted");
            removed.push(RemovedRouter {
                router_id,
                host: host.clone(),
                agent_id: agent.id.clone(),
            });
        }
        Ok(removed)
    }

    // ── Centralized SNAT ───────────────────────────────────────────

    /// Bind the router's SNAT to a randomly chosen eligible agent.
    ///
    /// Losing a race against another scheduler for the same router is an
    /// [`SnatOutcome::AlreadyBound`], not an error. A router without an
    /// external gateway is never bound.
    pub fn schedule_snat(&self, _ctx: &RequestContext, router: &Router) -> SchedulerResult<SnatOutcome> {
        if !router.has_gateway() {
            debug!(router_id = %router.id, "router has no external gateway, no SNAT to schedule");
            return Ok(SnatOutcome::NoGateway);
        }

        let active = self.services.agents.get_l3_agents(&AgentFilter::active())?;
        if active.is_empty() {
            warn!(router_id = %router.id, "no active L3 agents found for SNAT");
            return Ok(SnatOutcome::NoActiveAgents);
        }

        let candidates = snat_candidates(router, &active);
        let Some(chosen) = self.selector.choose(&candidates) else {
            warn!(router_id = %router.id, "no candidates found for SNAT");
            return Ok(SnatOutcome::NoCandidates);
        };
        let chosen = (*chosen).clone();

        match self.store.transaction(|txn| self.bind_snat_in(txn, router, &chosen)) {
            Ok(()) => {
                info!(router_id = %router.id, agent_id = %chosen.id, host = %chosen.host, "SNAT scheduled");
                Ok(SnatOutcome::Bound(chosen))
            }
            Err(e) if e.is_duplicate() => {
                info!(router_id = %router.id, "SNAT already bound to a service node");
                Ok(SnatOutcome::AlreadyBound)
            }
            Err(e) => {
                error!(router_id = %router.id, agent_id = %chosen.id, error = %e, "SNAT binding failed");
                Err(SchedulerError::scheduling_failed(&router.id, &chosen.id, e))
            }
        }
    }

    /// Insert the SNAT binding and, unless present, the agent's host binding.
    fn bind_snat_in(
        &self,
        txn: &BindingTxn<'_>,
        router: &Router,
        agent: &Agent,
    ) -> dvrgrid_state::StateResult<()> {
        txn.insert_snat_binding(&CentralizedSnatBinding {
            router_id: router.id.clone(),
            l3_agent_id: agent.id.clone(),
            host_id: agent.host.clone(),
            csnat_gw_port_id: router.gateway_port_id().map(str::to_string),
        })?;
        debug!(router_id = %router.id, agent_id = %agent.id, "SNAT router is scheduled to L3 agent");

        if txn.insert_host_binding(&DistributedHostBinding::new(&router.id, &agent.id))? {
            debug!(router_id = %router.id, snat_id = %agent.id, "binding the distributed router to the snat agent");
        } else {
            debug!(router_id = %router.id, snat_id = %agent.id, "distributed router already hosted on snat agent");
        }
        Ok(())
    }

    /// Release the router's SNAT binding, optionally only from `agent_id`.
    pub fn unbind_snat(
        &self,
        router_id: &str,
        agent_id: Option<&str>,
    ) -> SchedulerResult<Option<CentralizedSnatBinding>> {
        self.store
            .transaction(|txn| self.unbind_snat_in(txn, router_id, agent_id))
    }

    fn unbind_snat_in(
        &self,
        txn: &BindingTxn<'_>,
        router_id: &str,
        agent_id: Option<&str>,
    ) -> SchedulerResult<Option<CentralizedSnatBinding>> {
        let binding = txn.delete_snat_binding(router_id, agent_id)?;
        match &binding {
            Some(_) => debug!(%router_id, "deleted binding of the SNAT router"),
            None => debug!(
                %router_id,
                agent_id = agent_id.unwrap_or("any"),
                "no SNAT router binding found"
            ),
        }
        Ok(binding)
    }

    /// Drop the SNAT agent's host binding unless serviced ports still need
    /// the router namespace on that host.
    pub fn unbind_service_node(
        &self,
        ctx: &RequestContext,
        router_id: &str,
        binding: &CentralizedSnatBinding,
    ) -> SchedulerResult<ServiceNodeUnbind> {
        self.store
            .transaction(|txn| self.unbind_service_node_in(txn, ctx, router_id, binding))
    }

    fn unbind_service_node_in(
        &self,
        txn: &BindingTxn<'_>,
        ctx: &RequestContext,
        router_id: &str,
        binding: &CentralizedSnatBinding,
    ) -> SchedulerResult<ServiceNodeUnbind> {
        let host = binding.host_id.clone();
        let subnet_ids = self.subnet_ids_on_router(ctx, router_id)?;
        if self.check_dvr_serviceable_ports_on_host(ctx, &host, &subnet_ids, None)? {
            debug!(%host, %router_id, "serviced ports remain on the snat host");
            return Ok(ServiceNodeUnbind::Kept { host });
        }

        txn.delete_host_binding(router_id, &binding.l3_agent_id)?;
        debug!(%router_id, agent_id = %binding.l3_agent_id, "removed binding for router and agent");
        Ok(ServiceNodeUnbind::Removed { host })
    }

    /// Release the SNAT binding and the SNAT agent's host binding as one unit.
    pub fn unbind_snat_service_node(
        &self,
        ctx: &RequestContext,
        router_id: &str,
    ) -> SchedulerResult<Option<SnatUnbind>> {
        self.unbind_snat_service_node_in(ctx, router_id, None)
    }

    /// As [`Self::unbind_snat_service_node`], scoped to the SNAT binding
    /// held by `agent_id` when given.
    fn unbind_snat_service_node_in(
        &self,
        ctx: &RequestContext,
        router_id: &str,
        agent_id: Option<&str>,
    ) -> SchedulerResult<Option<SnatUnbind>> {
        self.store.transaction(|txn| {
            let Some(binding) = self.unbind_snat_in(txn, router_id, agent_id)? else {
                return Ok(None);
            };
            let service_node = self.unbind_service_node_in(txn, ctx, router_id, &binding)?;
            Ok(Some(SnatUnbind {
                binding,
                service_node,
            }))
        })
    }

    /// SNAT bindings of the given routers.
    pub fn get_snat_bindings(&self, router_ids: &[RouterId]) -> SchedulerResult<Vec<CentralizedSnatBinding>> {
        Ok(self.store.get_snat_bindings(router_ids)?)
    }

    // ── Generic scheduler overrides ────────────────────────────────

    pub fn check_scheduling_needed(
        &self,
        ctx: &RequestContext,
        agent: &Agent,
        router: &Router,
    ) -> SchedulerResult<bool> {
        if !router.distributed {
            return self.generic.check_scheduling_needed(ctx, agent, router);
        }
        if !router.has_gateway() {
            return Ok(false);
        }
        Ok(self.store.get_snat_binding(&router.id)?.is_none())
    }

    /// For a distributed router, unscheduling releases only the SNAT part;
    /// host bindings follow port presence.
    pub fn unschedule_router(
        &self,
        ctx: &RequestContext,
        router_id: &str,
        agent_ids: &[AgentId],
    ) -> SchedulerResult<()> {
        let router = self.get_router(ctx, router_id)?;
        if !router.distributed {
            return self.generic.unschedule_router(ctx, router_id, agent_ids);
        }
        if let Some(unbind) = self.unbind_snat_service_node(ctx, router_id)? {
            self.notify_service_node(ctx, router_id, &unbind.service_node);
        }
        Ok(())
    }

    /// Explicit bind of a router to an agent.
    ///
    /// A distributed router with a gateway bound to a `dvr_snat` agent gets
    /// that agent as its SNAT host. Every store failure here, including a
    /// duplicate, is a scheduling failure.
    pub fn bind_router_to_agent(
        &self,
        ctx: &RequestContext,
        agent: &Agent,
        router: &Router,
    ) -> SchedulerResult<()> {
        let snat_capable = agent.configuration().agent_mode == AgentMode::DvrSnat;
        if !(router.distributed && router.has_gateway() && snat_capable) {
            return self.generic.bind_router_to_agent(ctx, agent, router);
        }

        self.store
            .transaction(|txn| self.bind_snat_in(txn, router, agent))
            .map_err(|e| {
                error!(router_id = %router.id, agent_id = %agent.id, error = %e, "explicit SNAT bind failed");
                SchedulerError::scheduling_failed(&router.id, &agent.id, e)
            })?;
        info!(router_id = %router.id, agent_id = %agent.id, "SNAT bound to agent on request");
        Ok(())
    }

    /// Remove a router from one agent.
    ///
    /// On a `dvr_snat` agent holding the router's SNAT this releases the
    /// SNAT part; otherwise the generic removal applies.
    pub fn remove_router_from_agent(
        &self,
        ctx: &RequestContext,
        agent_id: &str,
        router_id: &str,
    ) -> SchedulerResult<()> {
        let router = self.get_router(ctx, router_id)?;
        if router.has_gateway() && router.distributed {
            if let Some(unbind) = self.unbind_snat_service_node_in(ctx, router_id, Some(agent_id))? {
                match &unbind.service_node {
                    ServiceNodeUnbind::Removed { .. } => {
                        self.notify_service_node(ctx, router_id, &unbind.service_node);
                    }
                    ServiceNodeUnbind::Kept { .. } => {
                        // Namespace stays for distributed traffic; the agent
                        // only drops its SNAT part.
                        self.services
                            .notifier
                            .routers_updated(ctx, &[router_id.to_string()], false);
                    }
                }
                return Ok(());
            }
        }

        self.generic.remove_router_from_agent(ctx, agent_id, router_id)
    }

    // ── Router lifecycle ───────────────────────────────────────────

    /// Reconcile a router's SNAT binding with its gateway after a router
    /// create/update or gateway set/clear.
    pub fn sync_router_snat(&self, ctx: &RequestContext, router_id: &str) -> SchedulerResult<()> {
        let router = self.get_router(ctx, router_id)?;
        if !router.distributed {
            return Ok(());
        }

        let bound = self.store.get_snat_binding(router_id)?;
        match (router.has_gateway(), bound) {
            (true, None) => {
                if let SnatOutcome::Bound(agent) = self.schedule_snat(ctx, &router)? {
                    self.services.notifier.routers_updated_on_host(
                        ctx,
                        &[router.id.clone()],
                        &agent.host,
                    );
                }
            }
            (false, Some(_)) => {
                if let Some(unbind) = self.unbind_snat_service_node(ctx, router_id)? {
                    match &unbind.service_node {
                        ServiceNodeUnbind::Removed { .. } => {
                            self.notify_service_node(ctx, router_id, &unbind.service_node);
                        }
                        ServiceNodeUnbind::Kept { host } => {
                            self.services.notifier.routers_updated_on_host(
                                ctx,
                                &[router.id.clone()],
                                host,
                            );
                        }
                    }
                }
            }
            _ => debug!(%router_id, "SNAT binding already matches gateway"),
        }
        Ok(())
    }

    /// Delete every binding of a removed agent.
    pub fn purge_agent(&self, agent_id: &str) -> SchedulerResult<(u32, u32)> {
        let (snat_rows, host_rows) = self
            .store
            .transaction(|txn| txn.delete_agent_bindings(agent_id))?;
        info!(%agent_id, snat_rows, host_rows, "agent bindings purged");
        Ok((snat_rows, host_rows))
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn get_router(&self, ctx: &RequestContext, router_id: &str) -> SchedulerResult<Router> {
        self.services
            .routers
            .get_router(ctx, router_id)?
            .ok_or_else(|| SchedulerError::RouterNotFound(router_id.to_string()))
    }

    fn notify_service_node(&self, ctx: &RequestContext, router_id: &str, outcome: &ServiceNodeUnbind) {
        if let ServiceNodeUnbind::Removed { host } = outcome {
            self.services
                .notifier
                .router_removed_from_agent(ctx, router_id, host);
        }
    }
}
