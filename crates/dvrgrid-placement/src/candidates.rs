//! SNAT candidate filtering.
//!
//! An agent can host a distributed router's centralized SNAT when it:
//! - is administratively up
//! - runs in `dvr_snat` mode
//! - is not pinned to a different router
//! - accepts the router's gateway situation (internal-only routers, or a
//!   router whose gateway network matches the agent's fixed external network)

use std::fmt;

use tracing::debug;

use dvr_core::{Agent, AgentMode, Router};

/// Why an agent was rejected as a SNAT host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnatRejection {
    RouterNotDistributed,
    AdminDown,
    WrongMode(AgentMode),
    PinnedToRouter(String),
    /// Router has no gateway and the agent refuses internal-only routers.
    InternalOnlyRefused,
    /// Router gateway network differs from the agent's fixed external network.
    ExternalNetworkMismatch { router: String, agent: String },
}

impl fmt::Display for SnatRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnatRejection::RouterNotDistributed => f.write_str("router is not distributed"),
            SnatRejection::AdminDown => f.write_str("agent is administratively down"),
            SnatRejection::WrongMode(mode) => write!(f, "agent mode is {mode}"),
            SnatRejection::PinnedToRouter(id) => write!(f, "agent is pinned to router {id}"),
            SnatRejection::InternalOnlyRefused => {
                f.write_str("agent does not handle internal-only routers")
            }
            SnatRejection::ExternalNetworkMismatch { router, agent } => write!(
                f,
                "router gateway network {router} differs from agent network {agent}"
            ),
        }
    }
}

/// Check a single agent against the SNAT eligibility rules.
pub fn check_snat_candidate(router: &Router, agent: &Agent) -> Result<(), SnatRejection> {
    if !router.distributed {
        return Err(SnatRejection::RouterNotDistributed);
    }
    if !agent.admin_state_up {
        return Err(SnatRejection::AdminDown);
    }

    let conf = agent.configuration();
    if conf.agent_mode != AgentMode::DvrSnat {
        return Err(SnatRejection::WrongMode(conf.agent_mode));
    }

    if let Some(pinned) = conf.router_id {
        if pinned != router.id {
            return Err(SnatRejection::PinnedToRouter(pinned));
        }
    }

    match (router.gateway_network_id(), conf.gateway_external_network_id) {
        (None, _) if !conf.handle_internal_only_routers => {
            Err(SnatRejection::InternalOnlyRefused)
        }
        (Some(router_net), Some(agent_net)) if router_net != agent_net => {
            Err(SnatRejection::ExternalNetworkMismatch {
                router: router_net.to_string(),
                agent: agent_net,
            })
        }
        _ => Ok(()),
    }
}

/// Filter the agents able to host the router's SNAT.
///
/// Empty for non-distributed routers. Ordering carries no meaning.
pub fn snat_candidates<'a>(router: &Router, agents: &'a [Agent]) -> Vec<&'a Agent> {
    if !router.distributed {
        return Vec::new();
    }
    agents
        .iter()
        .filter(|agent| match check_snat_candidate(router, agent) {
            Ok(()) => true,
            Err(reason) => {
                debug!(
                    router_id = %router.id,
                    agent_id = %agent.id,
                    %reason,
                    "agent rejected for SNAT"
                );
                false
            }
        })
        .collect()
}
