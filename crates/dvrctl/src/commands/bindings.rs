use std::fmt::Write as _;

use serde::Serialize;

use dvr_core::DvrConfig;
use dvrgrid_state::{BindingStore, CentralizedSnatBinding, DistributedHostBinding};

#[derive(Debug, Serialize)]
pub struct BindingReport {
    pub snat: Vec<CentralizedSnatBinding>,
    pub hosts: Vec<DistributedHostBinding>,
}

pub fn list(config: &DvrConfig, router: Option<&str>, json: bool) -> anyhow::Result<()> {
    let store = super::open_store(config)?;
    let report = collect(&store, router)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render(&report));
    }
    Ok(())
}

pub fn collect(store: &BindingStore, router: Option<&str>) -> anyhow::Result<BindingReport> {
    let (snat, hosts) = match router {
        Some(router_id) => (
            store.get_snat_binding(router_id)?.into_iter().collect(),
            store.list_host_bindings_for_router(router_id)?,
        ),
        None => (store.list_snat_bindings()?, store.list_host_bindings()?),
    };
    Ok(BindingReport { snat, hosts })
}

pub fn render(report: &BindingReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "SNAT bindings ({})", report.snat.len());
    for b in &report.snat {
        let _ = writeln!(
            out,
            "  {:<38} {:<38} {:<20} {}",
            b.router_id,
            b.l3_agent_id,
            b.host_id,
            b.csnat_gw_port_id.as_deref().unwrap_or("-"),
        );
    }
    let _ = writeln!(out, "Host bindings ({})", report.hosts.len());
    for b in &report.hosts {
        let _ = writeln!(out, "  {:<38} {}", b.router_id, b.l3_agent_id);
    }
    out
}
