//! Generic router scheduling — the policy distributed routers extend.
//!
//! [`RouterScheduler`] is the capability interface [`crate::DvrScheduler`]
//! wraps and delegates to for everything that is not distributed-router
//! specific. [`StoreRouterScheduler`] is a least-routers implementation over
//! the binding store's host bindings.

use tracing::{debug, info, warn};

use dvr_core::{Agent, AgentId, RequestContext, Router};
use dvrgrid_state::BindingStore;

use crate::error::{SchedulerError, SchedulerResult};
use crate::services::{AgentFilter, Services};

pub trait RouterScheduler: Send + Sync {
    /// Place a router on one of `candidates` (all active agents when empty).
    ///
    /// Returns the chosen agent, or `None` when nothing was placed.
    fn schedule_router(
        &self,
        ctx: &RequestContext,
        router_id: &str,
        candidates: &[Agent],
    ) -> SchedulerResult<Option<AgentId>>;

    fn check_scheduling_needed(
        &self,
        ctx: &RequestContext,
        agent: &Agent,
        router: &Router,
    ) -> SchedulerResult<bool>;

    fn bind_router_to_agent(
        &self,
        ctx: &RequestContext,
        agent: &Agent,
        router: &Router,
    ) -> SchedulerResult<()>;

    fn unschedule_router(
        &self,
        ctx: &RequestContext,
        router_id: &str,
        agent_ids: &[AgentId],
    ) -> SchedulerResult<()>;

    fn remove_router_from_agent(
        &self,
        ctx: &RequestContext,
        agent_id: &str,
        router_id: &str,
    ) -> SchedulerResult<()>;
}

/// Least-routers placement over host bindings.
pub struct StoreRouterScheduler {
    store: BindingStore,
    services: Services,
}

impl StoreRouterScheduler {
    pub fn new(store: BindingStore, services: Services) -> Self {
        Self { store, services }
    }
}

impl RouterScheduler for StoreRouterScheduler {
    fn schedule_router(
        &self,
        _ctx: &RequestContext,
        router_id: &str,
        candidates: &[Agent],
    ) -> SchedulerResult<Option<AgentId>> {
        let pool = if candidates.is_empty() {
            self.services.agents.get_l3_agents(&AgentFilter::active())?
        } else {
            candidates.iter().filter(|a| a.is_active()).cloned().collect()
        };

        let bound = self.store.list_host_bindings_for_router(router_id)?;
        let mut ranked = Vec::new();
        for agent in pool {
            if bound.iter().any(|b| b.l3_agent_id == agent.id) {
                continue;
            }
            let load = self.store.list_host_bindings_for_agent(&agent.id)?.len();
            ranked.push((load, agent.id));
        }
        // Fewest routers first, ties broken by agent id.
        ranked.sort();

        let Some((load, agent_id)) = ranked.into_iter().next() else {
            debug!(%router_id, "no unbound agent available for router");
            return Ok(None);
        };

        self.store
            .insert_host_binding(router_id, &agent_id)
            .map_err(|e| SchedulerError::scheduling_failed(router_id, &agent_id, e))?;
        info!(%router_id, %agent_id, load, "router scheduled to L3 agent");
        Ok(Some(agent_id))
    }

    fn check_scheduling_needed(
        &self,
        _ctx: &RequestContext,
        _agent: &Agent,
        router: &Router,
    ) -> SchedulerResult<bool> {
        Ok(self.store.list_host_bindings_for_router(&router.id)?.is_empty())
    }

    fn bind_router_to_agent(
        &self,
        _ctx: &RequestContext,
        agent: &Agent,
        router: &Router,
    ) -> SchedulerResult<()> {
        let inserted = self
            .store
            .insert_host_binding(&router.id, &agent.id)
            .map_err(|e| SchedulerError::scheduling_failed(&router.id, &agent.id, e))?;
        debug!(router_id = %router.id, agent_id = %agent.id, inserted, "router bound to L3 agent");
        Ok(())
    }

    fn unschedule_router(
        &self,
        _ctx: &RequestContext,
        router_id: &str,
        agent_ids: &[AgentId],
    ) -> SchedulerResult<()> {
        self.store.transaction(|txn| {
            for agent_id in agent_ids {
                txn.delete_host_binding(router_id, agent_id)?;
            }
            Ok::<_, SchedulerError>(())
        })?;
        info!(%router_id, agents = agent_ids.len(), "router unscheduled");
        Ok(())
    }

    fn remove_router_from_agent(
        &self,
        ctx: &RequestContext,
        agent_id: &str,
        router_id: &str,
    ) -> SchedulerResult<()> {
        if !self.store.delete_host_binding(router_id, agent_id)? {
            debug!(%router_id, %agent_id, "router was not bound to agent");
            return Ok(());
        }
        match self.services.agents.get_agent(agent_id)? {
            Some(agent) => {
                self.services
                    .notifier
                    .router_removed_from_agent(ctx, router_id, &agent.host);
            }
            None => warn!(%agent_id, "binding removed for unknown agent, no notification sent"),
        }
        info!(%router_id, %agent_id, "router removed from L3 agent");
        Ok(())
    }
}
