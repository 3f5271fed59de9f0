use tracing::info;

use dvr_core::DvrConfig;
use dvrgrid_state::{BindingStore, CentralizedSnatBinding, StateResult};

pub fn release_snat(
    config: &DvrConfig,
    router_id: &str,
    agent_id: Option<&str>,
    drop_host_binding: bool,
) -> anyhow::Result<()> {
    let store = super::open_store(config)?;
    match release(&store, router_id, agent_id, drop_host_binding)? {
        Some(released) => {
            let binding = &released.binding;
            println!(
                "✓ Released SNAT of router {} from agent {} ({})",
                binding.router_id, binding.l3_agent_id, binding.host_id
            );
            if released.host_binding_dropped {
                println!(
                    "✓ Dropped host binding of router {} on agent {}",
                    binding.router_id, binding.l3_agent_id
                );
            } else {
                println!("  The agent keeps its host binding; pass --drop-host-binding to remove it.");
            }
        }
        None => println!("No matching SNAT binding for router {router_id}"),
    }
    Ok(())
}

pub fn purge_agent(config: &DvrConfig, agent_id: &str) -> anyhow::Result<()> {
    let store = super::open_store(config)?;
    let (snat_rows, host_rows) = purge(&store, agent_id)?;
    println!("✓ Purged agent {agent_id}: {snat_rows} SNAT binding(s), {host_rows} host binding(s)");
    Ok(())
}

/// A SNAT binding removed by the operator.
#[derive(Debug)]
pub struct Released {
    pub binding: CentralizedSnatBinding,
    pub host_binding_dropped: bool,
}

/// Delete the router's SNAT binding and, with `drop_host_binding`, the
/// bound agent's host binding, as one transaction.
pub fn release(
    store: &BindingStore,
    router_id: &str,
    agent_id: Option<&str>,
    drop_host_binding: bool,
) -> StateResult<Option<Released>> {
    let released = store.transaction(|txn| -> StateResult<_> {
        let Some(binding) = txn.delete_snat_binding(router_id, agent_id)? else {
            return Ok(None);
        };
        let host_binding_dropped =
            drop_host_binding && txn.delete_host_binding(router_id, &binding.l3_agent_id)?;
        Ok(Some(Released {
            binding,
            host_binding_dropped,
        }))
    })?;
    if let Some(released) = &released {
        info!(
            %router_id,
            agent_id = %released.binding.l3_agent_id,
            host_binding_dropped = released.host_binding_dropped,
            "SNAT binding released by operator"
        );
    }
    Ok(released)
}

pub fn purge(store: &BindingStore, agent_id: &str) -> StateResult<(u32, u32)> {
    let counts = store.transaction(|txn| txn.delete_agent_bindings(agent_id))?;
    info!(%agent_id, snat_rows = counts.0, host_rows = counts.1, "agent purged by operator");
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(store: &BindingStore, router_id: &str, agent_id: &str) {
        store
            .transaction(|txn| {
                txn.insert_snat_binding(&CentralizedSnatBinding {
                    router_id: router_id.to_string(),
                    l3_agent_id: agent_id.to_string(),
                    host_id: format!("host-{agent_id}"),
                    csnat_gw_port_id: None,
                })
            })
            .unwrap();
        store.insert_host_binding(router_id, agent_id).unwrap();
    }

    #[test]
    fn release_respects_agent_scope() {
        let store = BindingStore::open_in_memory().unwrap();
        bind(&store, "r1", "a1");

        assert!(release(&store, "r1", Some("a2"), false).unwrap().is_none());
        let released = release(&store, "r1", Some("a1"), false).unwrap().unwrap();
        assert_eq!(released.binding.l3_agent_id, "a1");
        assert!(!released.host_binding_dropped);
        assert!(store.get_snat_binding("r1").unwrap().is_none());
        assert!(store.has_host_binding("r1", "a1").unwrap());
    }

    #[test]
    fn release_can_drop_host_binding() {
        let store = BindingStore::open_in_memory().unwrap();
        bind(&store, "r1", "a1");
        store.insert_host_binding("r1", "a2").unwrap();

        let released = release(&store, "r1", None, true).unwrap().unwrap();
        assert!(released.host_binding_dropped);
        assert!(store.get_snat_binding("r1").unwrap().is_none());
        assert!(!store.has_host_binding("r1", "a1").unwrap());
        assert!(store.has_host_binding("r1", "a2").unwrap());

        assert!(release(&store, "r1", None, true).unwrap().is_none());
        assert!(store.has_host_binding("r1", "a2").unwrap());
    }

    #[test]
    fn purge_counts_rows() {
        let store = BindingStore::open_in_memory().unwrap();
        bind(&store, "r1", "a1");
        bind(&store, "r2", "a1");
        store.insert_host_binding("r3", "a1").unwrap();
        store.insert_host_binding("r3", "a2").unwrap();

        assert_eq!(purge(&store, "a1").unwrap(), (2, 3));
        assert_eq!(purge(&store, "a1").unwrap(), (0, 0));
        assert_eq!(store.list_host_bindings().unwrap().len(), 1);
    }

    #[test]
    fn commands_create_store_under_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DvrConfig::default();
        config.store.path = dir.path().join("nested").join("bindings.redb");

        purge_agent(&config, "a1").unwrap();
        assert!(config.store.path.exists());
    }
}
