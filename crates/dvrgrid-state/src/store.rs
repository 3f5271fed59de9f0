//! BindingStore — redb-backed persistence for router/agent bindings.
//!
//! Provides typed access to centralized SNAT bindings and distributed host
//! bindings. Reads run in their own read transaction; writes run inside a
//! [`BindingTxn`] obtained from [`BindingStore::transaction`], so callers can
//! group several row changes into one atomic unit.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn get_row<T, Tb>(table: &Tb, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    Tb: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Collect `(key, row)` pairs accepted by `keep`.
fn scan_rows<T, Tb>(table: &Tb, mut keep: impl FnMut(&str, &T) -> bool) -> StateResult<Vec<(String, T)>>
where
    T: DeserializeOwned,
    Tb: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let row: T = decode(value.value())?;
        if keep(key.value(), &row) {
            results.push((key.value().to_string(), row));
        }
    }
    Ok(results)
}

/// Thread-safe binding store backed by redb.
#[derive(Clone)]
pub struct BindingStore {
    db: Arc<Database>,
}

impl BindingStore {
    /// Open (or create) a persistent binding store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "binding store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory binding store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory binding store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CSNAT_BINDINGS).map_err(map_err!(Table))?;
        txn.open_table(HOST_BINDINGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside one write transaction.
    ///
    /// Commits when `f` returns `Ok`, aborts when it returns `Err`. Work that
    /// must join an enclosing unit takes the `&BindingTxn` instead of calling
    /// this again.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&BindingTxn<'_>) -> Result<T, E>,
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = f(&BindingTxn { txn: &txn });
        match result {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!(error = %abort_err, "failed to abort binding transaction");
                }
                Err(e)
            }
        }
    }

    // ── Centralized SNAT bindings ──────────────────────────────────

    /// Get the SNAT binding for a router.
    pub fn get_snat_binding(&self, router_id: &str) -> StateResult<Option<CentralizedSnatBinding>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CSNAT_BINDINGS).map_err(map_err!(Table))?;
        get_row(&table, router_id)
    }

    /// Get the SNAT bindings for a set of routers. Routers without one are skipped.
    pub fn get_snat_bindings(&self, router_ids: &[String]) -> StateResult<Vec<CentralizedSnatBinding>> {
        if router_ids.is_empty() {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CSNAT_BINDINGS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for router_id in router_ids {
            if let Some(binding) = get_row(&table, router_id)? {
                results.push(binding);
            }
        }
        Ok(results)
    }

    /// List every SNAT binding.
    pub fn list_snat_bindings(&self) -> StateResult<Vec<CentralizedSnatBinding>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CSNAT_BINDINGS).map_err(map_err!(Table))?;
        let rows = scan_rows(&table, |_, _: &CentralizedSnatBinding| true)?;
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    // ── Distributed host bindings ──────────────────────────────────

    /// Whether the router is bound to the agent's host.
    pub fn has_host_binding(&self, router_id: &str, agent_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOST_BINDINGS).map_err(map_err!(Table))?;
        let row: Option<DistributedHostBinding> =
            get_row(&table, &host_binding_key(router_id, agent_id))?;
        Ok(row.is_some())
    }

    /// List the host bindings of one router.
    pub fn list_host_bindings_for_router(
        &self,
        router_id: &str,
    ) -> StateResult<Vec<DistributedHostBinding>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOST_BINDINGS).map_err(map_err!(Table))?;
        let rows = scan_rows(&table, |_, b: &DistributedHostBinding| b.router_id == router_id)?;
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    /// List the routers bound to one agent.
    pub fn list_host_bindings_for_agent(
        &self,
        agent_id: &str,
    ) -> StateResult<Vec<DistributedHostBinding>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOST_BINDINGS).map_err(map_err!(Table))?;
        let rows = scan_rows(&table, |_, b: &DistributedHostBinding| b.l3_agent_id == agent_id)?;
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    /// List every host binding.
    pub fn list_host_bindings(&self) -> StateResult<Vec<DistributedHostBinding>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HOST_BINDINGS).map_err(map_err!(Table))?;
        let rows = scan_rows(&table, |_, _: &DistributedHostBinding| true)?;
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    /// Bind a router to an agent's host. Returns false if already bound.
    pub fn insert_host_binding(&self, router_id: &str, agent_id: &str) -> StateResult<bool> {
        self.transaction(|txn| txn.insert_host_binding(&DistributedHostBinding::new(router_id, agent_id)))
    }

    /// Remove a router's host binding. Returns true if it existed.
    pub fn delete_host_binding(&self, router_id: &str, agent_id: &str) -> StateResult<bool> {
        self.transaction(|txn| txn.delete_host_binding(router_id, agent_id))
    }
}

/// Handle to an open write transaction on the binding store.
pub struct BindingTxn<'a> {
    txn: &'a WriteTransaction,
}

impl BindingTxn<'_> {
    /// Get the SNAT binding for a router, including uncommitted changes.
    pub fn get_snat_binding(&self, router_id: &str) -> StateResult<Option<CentralizedSnatBinding>> {
        let table = self.txn.open_table(CSNAT_BINDINGS).map_err(map_err!(Table))?;
        get_row(&table, router_id)
    }

    /// Insert a SNAT binding.
    ///
    /// Fails with [`StateError::Duplicate`] if the router already has one.
    pub fn insert_snat_binding(&self, binding: &CentralizedSnatBinding) -> StateResult<()> {
        let key = binding.table_key();
        let value = serde_json::to_vec(binding).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(CSNAT_BINDINGS).map_err(map_err!(Table))?;
        if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
            return Err(StateError::Duplicate(format!(
                "router {key} already has a SNAT binding"
            )));
        }
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        debug!(router_id = %binding.router_id, agent_id = %binding.l3_agent_id, "SNAT binding stored");
        Ok(())
    }

    /// Delete a router's SNAT binding, optionally only if it names `agent_id`.
    ///
    /// Returns the deleted row, or `None` if nothing matched.
    pub fn delete_snat_binding(
        &self,
        router_id: &str,
        agent_id: Option<&str>,
    ) -> StateResult<Option<CentralizedSnatBinding>> {
        let mut table = self.txn.open_table(CSNAT_BINDINGS).map_err(map_err!(Table))?;
        let existing: Option<CentralizedSnatBinding> = get_row(&table, router_id)?;
        let Some(binding) = existing else {
            return Ok(None);
        };
        if agent_id.is_some_and(|id| id != binding.l3_agent_id) {
            return Ok(None);
        }
        table.remove(router_id).map_err(map_err!(Write))?;
        debug!(%router_id, agent_id = %binding.l3_agent_id, "SNAT binding deleted");
        Ok(Some(binding))
    }

    /// Whether the router is bound to the agent's host.
    pub fn has_host_binding(&self, router_id: &str, agent_id: &str) -> StateResult<bool> {
        let table = self.txn.open_table(HOST_BINDINGS).map_err(map_err!(Table))?;
        let row: Option<DistributedHostBinding> =
            get_row(&table, &host_binding_key(router_id, agent_id))?;
        Ok(row.is_some())
    }

    /// Insert a host binding. Returns false (and writes nothing) if the pair
    /// is already bound.
    pub fn insert_host_binding(&self, binding: &DistributedHostBinding) -> StateResult<bool> {
        let key = binding.table_key();
        let value = serde_json::to_vec(binding).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(HOST_BINDINGS).map_err(map_err!(Table))?;
        if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
            return Ok(false);
        }
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        debug!(%key, "host binding stored");
        Ok(true)
    }

    /// Delete a host binding. Returns true if it existed.
    pub fn delete_host_binding(&self, router_id: &str, agent_id: &str) -> StateResult<bool> {
        let key = host_binding_key(router_id, agent_id);
        let mut table = self.txn.open_table(HOST_BINDINGS).map_err(map_err!(Table))?;
        let existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        debug!(%key, existed, "host binding deleted");
        Ok(existed)
    }

    /// Delete every binding naming `agent_id`.
    ///
    /// Returns `(snat_rows, host_rows)` deleted.
    pub fn delete_agent_bindings(&self, agent_id: &str) -> StateResult<(u32, u32)> {
        let snat_keys: Vec<String> = {
            let table = self.txn.open_table(CSNAT_BINDINGS).map_err(map_err!(Table))?;
            scan_rows(&table, |_, b: &CentralizedSnatBinding| b.l3_agent_id == agent_id)?
                .into_iter()
                .map(|(key, _)| key)
                .collect()
        };
        let host_keys: Vec<String> = {
            let table = self.txn.open_table(HOST_BINDINGS).map_err(map_err!(Table))?;
            scan_rows(&table, |_, b: &DistributedHostBinding| b.l3_agent_id == agent_id)?
                .into_iter()
                .map(|(key, _)| key)
                .collect()
        };
        {
            let mut table = self.txn.open_table(CSNAT_BINDINGS).map_err(map_err!(Table))?;
            for key in &snat_keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = self.txn.open_table(HOST_BINDINGS).map_err(map_err!(Table))?;
            for key in &host_keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        Ok((snat_keys.len() as u32, host_keys.len() as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snat(router_id: &str, agent_id: &str) -> CentralizedSnatBinding {
        CentralizedSnatBinding {
            router_id: router_id.to_string(),
            l3_agent_id: agent_id.to_string(),
            host_id: format!("host-{agent_id}"),
            csnat_gw_port_id: Some(format!("gw-{router_id}")),
        }
    }

    // ── SNAT bindings ──────────────────────────────────────────────

    #[test]
    fn snat_insert_and_get() {
        let store = BindingStore::open_in_memory().unwrap();
        let binding = snat("r1", "a1");

        store
            .transaction(|txn| txn.insert_snat_binding(&binding))
            .unwrap();

        assert_eq!(store.get_snat_binding("r1").unwrap(), Some(binding));
        assert!(store.get_snat_binding("r2").unwrap().is_none());
    }

    #[test]
    fn snat_second_insert_is_duplicate() {
        let store = BindingStore::open_in_memory().unwrap();
        store
            .transaction(|txn| txn.insert_snat_binding(&snat("r1", "a1")))
            .unwrap();

        let err = store
            .transaction(|txn| txn.insert_snat_binding(&snat("r1", "a2")))
            .unwrap_err();
        assert!(err.is_duplicate());

        // The first binding is untouched.
        let kept = store.get_snat_binding("r1").unwrap().unwrap();
        assert_eq!(kept.l3_agent_id, "a1");
    }

    #[test]
    fn snat_delete_scoped_to_agent() {
        let store = BindingStore::open_in_memory().unwrap();
        store
            .transaction(|txn| txn.insert_snat_binding(&snat("r1", "a1")))
            .unwrap();

        let wrong_agent = store
            .transaction(|txn| txn.delete_snat_binding("r1", Some("a2")))
            .unwrap();
        assert!(wrong_agent.is_none());
        assert!(store.get_snat_binding("r1").unwrap().is_some());

        let deleted = store
            .transaction(|txn| txn.delete_snat_binding("r1", Some("a1")))
            .unwrap();
        assert_eq!(deleted, Some(snat("r1", "a1")));
        assert!(store.get_snat_binding("r1").unwrap().is_none());
    }

    #[test]
    fn snat_delete_missing_is_none() {
        let store = BindingStore::open_in_memory().unwrap();
        let deleted = store
            .transaction(|txn| txn.delete_snat_binding("r1", None))
            .unwrap();
        assert!(deleted.is_none());
    }

    #[test]
    fn get_snat_bindings_filters_routers() {
        let store = BindingStore::open_in_memory().unwrap();
        store
            .transaction(|txn| {
                txn.insert_snat_binding(&snat("r1", "a1"))?;
                txn.insert_snat_binding(&snat("r2", "a1"))?;
                txn.insert_snat_binding(&snat("r3", "a2"))
            })
            .unwrap();

        assert!(store.get_snat_bindings(&[]).unwrap().is_empty());
        let found = store
            .get_snat_bindings(&["r1".to_string(), "r3".to_string(), "r9".to_string()])
            .unwrap();
        let routers: Vec<_> = found.iter().map(|b| b.router_id.as_str()).collect();
        assert_eq!(routers, vec!["r1", "r3"]);
        assert_eq!(store.list_snat_bindings().unwrap().len(), 3);
    }

    // ── Host bindings ──────────────────────────────────────────────

    #[test]
    fn host_binding_insert_is_idempotent() {
        let store = BindingStore::open_in_memory().unwrap();

        assert!(store.insert_host_binding("r1", "a1").unwrap());
        assert!(!store.insert_host_binding("r1", "a1").unwrap());
        assert!(store.has_host_binding("r1", "a1").unwrap());
        assert_eq!(store.list_host_bindings_for_router("r1").unwrap().len(), 1);
    }

    #[test]
    fn host_bindings_per_router_and_agent() {
        let store = BindingStore::open_in_memory().unwrap();
        store.insert_host_binding("r1", "a1").unwrap();
        store.insert_host_binding("r1", "a2").unwrap();
        store.insert_host_binding("r2", "a1").unwrap();

        assert_eq!(store.list_host_bindings_for_router("r1").unwrap().len(), 2);
        assert_eq!(store.list_host_bindings_for_router("r2").unwrap().len(), 1);
        assert_eq!(store.list_host_bindings_for_agent("a1").unwrap().len(), 2);
        assert_eq!(store.list_host_bindings().unwrap().len(), 3);
    }

    #[test]
    fn host_binding_delete() {
        let store = BindingStore::open_in_memory().unwrap();
        store.insert_host_binding("r1", "a1").unwrap();

        assert!(store.delete_host_binding("r1", "a1").unwrap());
        assert!(!store.delete_host_binding("r1", "a1").unwrap());
        assert!(!store.has_host_binding("r1", "a1").unwrap());
    }

    #[test]
    fn host_binding_ids_containing_separator_stay_distinct() {
        let store = BindingStore::open_in_memory().unwrap();
        assert!(store.insert_host_binding("r:x", "a").unwrap());

        assert!(!store.has_host_binding("r", "x:a").unwrap());
        assert!(store.insert_host_binding("r", "x:a").unwrap());
        assert!(store.delete_host_binding("r", "x:a").unwrap());

        assert!(store.has_host_binding("r:x", "a").unwrap());
        assert_eq!(store.list_host_bindings_for_router("r:x").unwrap().len(), 1);
        assert!(store.list_host_bindings_for_router("r").unwrap().is_empty());
    }

    // ── Transactions ───────────────────────────────────────────────

    #[test]
    fn failed_transaction_rolls_back_every_row() {
        let store = BindingStore::open_in_memory().unwrap();
        store
            .transaction(|txn| txn.insert_snat_binding(&snat("r1", "a1")))
            .unwrap();

        // Host binding insert succeeds, then the SNAT insert hits the
        // uniqueness constraint: neither row may survive.
        let result: StateResult<()> = store.transaction(|txn| {
            txn.insert_host_binding(&DistributedHostBinding::new("r1", "a2"))?;
            txn.insert_snat_binding(&snat("r1", "a2"))
        });
        assert!(result.unwrap_err().is_duplicate());
        assert!(!store.has_host_binding("r1", "a2").unwrap());
    }

    #[test]
    fn transaction_sees_its_own_writes() {
        let store = BindingStore::open_in_memory().unwrap();
        store
            .transaction(|txn| {
                txn.insert_snat_binding(&snat("r1", "a1"))?;
                assert!(txn.get_snat_binding("r1")?.is_some());
                txn.insert_host_binding(&DistributedHostBinding::new("r1", "a1"))?;
                assert!(txn.has_host_binding("r1", "a1")?);
                Ok::<_, StateError>(())
            })
            .unwrap();
    }

    #[test]
    fn delete_agent_bindings_cascades() {
        let store = BindingStore::open_in_memory().unwrap();
        store
            .transaction(|txn| {
                txn.insert_snat_binding(&snat("r1", "a1"))?;
                txn.insert_snat_binding(&snat("r2", "a2"))?;
                txn.insert_host_binding(&DistributedHostBinding::new("r1", "a1"))?;
                txn.insert_host_binding(&DistributedHostBinding::new("r3", "a1"))?;
                txn.insert_host_binding(&DistributedHostBinding::new("r1", "a2"))?;
                Ok::<_, StateError>(())
            })
            .unwrap();

        let (snat_rows, host_rows) = store
            .transaction(|txn| txn.delete_agent_bindings("a1"))
            .unwrap();
        assert_eq!((snat_rows, host_rows), (1, 2));
        assert!(store.get_snat_binding("r1").unwrap().is_none());
        assert!(store.get_snat_binding("r2").unwrap().is_some());
        assert_eq!(store.list_host_bindings().unwrap().len(), 1);
    }

    #[test]
    fn racing_writers_resolve_to_first_committer() {
        let store = BindingStore::open_in_memory().unwrap();

        let outcomes: Vec<StateResult<()>> = std::thread::scope(|s| {
            let handles: Vec<_> = ["a1", "a2"]
                .into_iter()
                .map(|agent| {
                    let store = store.clone();
                    s.spawn(move || {
                        store.transaction(|txn| txn.insert_snat_binding(&snat("r1", agent)))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|r| r.as_ref().is_err_and(StateError::is_duplicate))
                .count(),
            1
        );
        assert_eq!(store.list_snat_bindings().unwrap().len(), 1);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("bindings.redb");

        {
            let store = BindingStore::open(&db_path).unwrap();
            store
                .transaction(|txn| txn.insert_snat_binding(&snat("r1", "a1")))
                .unwrap();
            store.insert_host_binding("r1", "a1").unwrap();
        }

        let store = BindingStore::open(&db_path).unwrap();
        assert_eq!(store.get_snat_binding("r1").unwrap(), Some(snat("r1", "a1")));
        assert!(store.has_host_binding("r1", "a1").unwrap());
    }

    #[test]
    fn empty_store_operations() {
        let store = BindingStore::open_in_memory().unwrap();

        assert!(store.list_snat_bindings().unwrap().is_empty());
        assert!(store.list_host_bindings().unwrap().is_empty());
        assert!(store.list_host_bindings_for_router("any").unwrap().is_empty());
        assert!(!store.delete_host_binding("r", "a").unwrap());
    }
}
