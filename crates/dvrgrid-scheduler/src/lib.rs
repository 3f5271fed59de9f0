//! dvrgrid-scheduler — binding decisions for distributed virtual routers.
//!
//! Decides which L3 agents host which part of a distributed router and
//! keeps the binding store consistent as ports and gateways come and go.
//! The scheduler:
//!
//! - Binds a router's centralized SNAT to one `dvr_snat` agent
//! - Binds routers to the hosts of the VM ports on their subnets
//! - Tears host bindings down once the last serviced port leaves a host
//! - Overrides the generic router scheduler for distributed routers only
//!
//! # Architecture
//!
//! ```text
//! DvrScheduler
//!   ├── Services (port inventory, agent directory, router lookup, notifiers)
//!   ├── BindingStore (SNAT + host bindings, one transaction per mutation)
//!   ├── SnatSelector (uniform random choice over SNAT candidates)
//!   └── RouterScheduler (generic policy for non-distributed routers)
//! ```

pub mod error;
pub mod generic;
pub mod memory;
pub mod scheduler;
pub mod services;

pub use error::{SchedulerError, SchedulerResult};
pub use generic::{RouterScheduler, StoreRouterScheduler};
pub use scheduler::{DvrScheduler, RemovedRouter, ServiceNodeUnbind, SnatOutcome, SnatUnbind};
pub use services::{
    AgentDirectory, AgentFilter, ArpAction, ArpEntryUpdater, L3Notifier, PortFilter,
    PortInventory, RouterLookup, Services,
};
