//! dvrgrid-events — port lifecycle relay for distributed routers.
//!
//! Port mutations are published on a [`PortEventBus`]; subscribers run
//! inline, in registration order, on the thread that made the mutation.
//! [`DvrPortEventHandlers`] subscribes the distributed-router reactions:
//!
//! - after create: bring the port's routers to its host, refresh ARP
//! - after update: tear down on the old host, bind on the new one
//! - after delete: refresh ARP, remove routers no longer needed on the host

pub mod bus;
pub mod handlers;

pub use bus::{DispatchError, PortEvent, PortEventBus, PortEventHandler, PortEventKind};
pub use handlers::DvrPortEventHandlers;
