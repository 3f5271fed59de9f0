//! Distributed-router reactions to port lifecycle events.

use std::sync::Arc;

use tracing::{debug, info};

use dvr_core::{Port, RequestContext};
use dvrgrid_scheduler::{ArpAction, DvrScheduler, RemovedRouter, SchedulerResult};

use crate::bus::{PortEvent, PortEventBus, PortEventKind};

pub struct DvrPortEventHandlers {
    scheduler: Arc<DvrScheduler>,
}

impl DvrPortEventHandlers {
    pub fn new(scheduler: Arc<DvrScheduler>) -> Self {
        Self { scheduler }
    }

    /// Subscribe the create, update and delete handlers on `bus`.
    pub fn register(self: &Arc<Self>, bus: &PortEventBus) {
        let handlers = Arc::clone(self);
        bus.subscribe(
            PortEventKind::AfterCreate,
            "dvr_new_port",
            Arc::new(move |ctx: &RequestContext, event: &PortEvent| {
                match event {
                    PortEvent::Created { port } => handlers.after_create(ctx, port),
                    _ => Ok(()),
                }
            }),
        );

        let handlers = Arc::clone(self);
        bus.subscribe(
            PortEventKind::AfterUpdate,
            "dvr_port_update",
            Arc::new(move |ctx: &RequestContext, event: &PortEvent| {
                match event {
                    PortEvent::Updated { original, port } => {
                        handlers.after_update(ctx, original, port)
                    }
                    _ => Ok(()),
                }
            }),
        );

        let handlers = Arc::clone(self);
        bus.subscribe(
            PortEventKind::AfterDelete,
            "dvr_port_delete",
            Arc::new(move |ctx: &RequestContext, event: &PortEvent| {
                match event {
                    PortEvent::Deleted {
                        port,
                        removed_routers,
                    } => handlers.after_delete(ctx, port, removed_routers),
                    _ => Ok(()),
                }
            }),
        );
    }

    /// Removal records to attach to the delete event of `port`.
    ///
    /// Must run while the port still exists in the inventory.
    pub fn prepare_port_delete(
        &self,
        ctx: &RequestContext,
        port: &Port,
    ) -> SchedulerResult<Vec<RemovedRouter>> {
        self.scheduler.teardown_if_unneeded(ctx, &port.id, port.host())
    }

    pub fn after_create(&self, ctx: &RequestContext, port: &Port) -> SchedulerResult<()> {
        if !port.is_dvr_serviced() {
            return Ok(());
        }
        self.scheduler.on_new_service_port(ctx, port)?;
        self.refresh_arp(ctx, port, ArpAction::Add);
        Ok(())
    }

    pub fn after_delete(
        &self,
        ctx: &RequestContext,
        port: &Port,
        removed_routers: &[RemovedRouter],
    ) -> SchedulerResult<()> {
        self.refresh_arp(ctx, port, ArpAction::Del);
        // The acting tenant may not own the router.
        let admin = ctx.elevated();
        for removed in removed_routers {
            info!(
                router_id = %removed.router_id,
                host = %removed.host,
                "removing router namespace left without ports"
            );
            self.scheduler
                .remove_router_from_agent(&admin, &removed.agent_id, &removed.router_id)?;
        }
        Ok(())
    }

    pub fn after_update(
        &self,
        ctx: &RequestContext,
        original: &Port,
        port: &Port,
    ) -> SchedulerResult<()> {
        let no_longer_serviced = original.is_dvr_serviced() && !port.is_dvr_serviced();
        let moved = original
            .host()
            .is_some_and(|old_host| port.host() != Some(old_host));

        if no_longer_serviced || moved {
            debug!(
                port_id = %port.id,
                no_longer_serviced,
                moved,
                "tearing down routers on the port's previous host"
            );
            let removed = self
                .scheduler
                .teardown_if_unneeded(ctx, &original.id, original.host())?;
            if !removed.is_empty() {
                self.after_delete(ctx, original, &removed)?;
            }
            if !port.is_dvr_serviced() {
                return Ok(());
            }
        }

        let binding_changed = port
            .host()
            .is_some_and(|new_host| original.host() != Some(new_host));
        if binding_changed && port.is_dvr_serviced() {
            self.scheduler.on_new_service_port(ctx, port)?;
            self.refresh_arp(ctx, port, ArpAction::Add);
        } else if original.mac_address != port.mac_address {
            self.refresh_arp(ctx, port, ArpAction::Add);
        }
        Ok(())
    }

    /// Only serviced ports have neighbours programmed on DVR routers.
    fn refresh_arp(&self, ctx: &RequestContext, port: &Port, action: ArpAction) {
        if !port.is_dvr_serviced() {
            return;
        }
        debug!(port_id = %port.id, action = action.as_str(), "refreshing ARP entry");
        self.scheduler
            .services()
            .arp
            .update_arp_entry(ctx, port, action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvr_core::{DEVICE_OWNER_DVR_INTERFACE, FixedIp, Router};
    use dvrgrid_scheduler::StoreRouterScheduler;
    use dvrgrid_scheduler::memory::{InMemoryFabric, Notification};
    use dvrgrid_state::BindingStore;

    fn port(id: &str, owner: &str, host: Option<&str>) -> Port {
        Port {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            network_id: "n1".to_string(),
            device_id: format!("dev-{id}"),
            device_owner: owner.to_string(),
            mac_address: "fa:16:3e:00:00:01".to_string(),
            binding_host: host.map(str::to_string),
            fixed_ips: vec![FixedIp {
                subnet_id: "s1".to_string(),
                ip_address: "10.0.0.5".to_string(),
            }],
        }
    }

    fn setup() -> (InMemoryFabric, BindingStore, Arc<DvrPortEventHandlers>) {
        let fabric = InMemoryFabric::new();
        fabric.agents.put_agent(InMemoryFabric::agent("a1", "h1", "dvr"));
        fabric.agents.put_agent(InMemoryFabric::agent("a2", "h2", "dvr"));
        fabric.routers.put_router(Router {
            id: "r1".to_string(),
            tenant_id: "t1".to_string(),
            distributed: true,
            external_gateway: None,
        });
        let mut interface = port("dvr-r1", DEVICE_OWNER_DVR_INTERFACE, None);
        interface.device_id = "r1".to_string();
        fabric.inventory.put_port(interface);

        let store = BindingStore::open_in_memory().unwrap();
        let generic = Arc::new(StoreRouterScheduler::new(store.clone(), fabric.services()));
        let scheduler = Arc::new(DvrScheduler::new(fabric.services(), store.clone(), generic));
        (fabric, store, Arc::new(DvrPortEventHandlers::new(scheduler)))
    }

    #[test]
    fn create_of_unserviced_port_does_nothing() {
        let (fabric, store, handlers) = setup();
        let gw = port("gw", "network:router_gateway", Some("h1"));
        fabric.inventory.put_port(gw.clone());

        handlers.after_create(&RequestContext::admin(), &gw).unwrap();

        assert!(store.list_host_bindings().unwrap().is_empty());
        assert!(fabric.notifier.take().is_empty());
    }

    #[test]
    fn create_binds_then_refreshes_arp() {
        let (fabric, store, handlers) = setup();
        let vm = port("vm", "compute:nova", Some("h1"));
        fabric.inventory.put_port(vm.clone());

        handlers.after_create(&RequestContext::admin(), &vm).unwrap();

        assert!(store.has_host_binding("r1", "a1").unwrap());
        let sent = fabric.notifier.take();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Notification::RoutersUpdatedOnHost { .. }));
        assert_eq!(
            sent[1],
            Notification::ArpEntry {
                port_id: "vm".to_string(),
                action: ArpAction::Add,
            }
        );
    }

    #[test]
    fn mac_change_only_refreshes_arp() {
        let (fabric, store, handlers) = setup();
        let original = port("vm", "compute:nova", Some("h1"));
        let mut updated = original.clone();
        updated.mac_address = "fa:16:3e:00:00:02".to_string();
        fabric.inventory.put_port(updated.clone());

        handlers
            .after_update(&RequestContext::admin(), &original, &updated)
            .unwrap();

        assert!(store.list_host_bindings().unwrap().is_empty());
        assert_eq!(
            fabric.notifier.take(),
            vec![Notification::ArpEntry {
                port_id: "vm".to_string(),
                action: ArpAction::Add,
            }]
        );
    }

    #[test]
    fn first_host_binding_schedules_like_create() {
        let (fabric, store, handlers) = setup();
        let original = port("vm", "compute:nova", None);
        let bound = port("vm", "compute:nova", Some("h2"));
        fabric.inventory.put_port(bound.clone());

        handlers
            .after_update(&RequestContext::admin(), &original, &bound)
            .unwrap();

        assert!(store.has_host_binding("r1", "a2").unwrap());
    }

    #[test]
    fn owner_change_away_from_compute_tears_down() {
        let (fabric, store, handlers) = setup();
        let vm = port("vm", "compute:nova", Some("h1"));
        fabric.inventory.put_port(vm.clone());
        handlers.after_create(&RequestContext::admin(), &vm).unwrap();
        fabric.notifier.take();

        let mut repurposed = vm.clone();
        repurposed.device_owner = "network:router_gateway".to_string();
        fabric.inventory.put_port(repurposed.clone());
        handlers
            .after_update(&RequestContext::admin(), &vm, &repurposed)
            .unwrap();

        assert!(!store.has_host_binding("r1", "a1").unwrap());
        let sent = fabric.notifier.take();
        assert_eq!(
            sent,
            vec![
                Notification::ArpEntry {
                    port_id: "vm".to_string(),
                    action: ArpAction::Del,
                },
                Notification::RouterRemovedFromAgent {
                    router_id: "r1".to_string(),
                    host: "h1".to_string(),
                },
            ]
        );
    }
}
