//! Typed port event bus.
//!
//! A fixed set of event kinds, subscribers keyed by kind, synchronous
//! delivery in registration order.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, error};

use dvr_core::{Port, RequestContext};
use dvrgrid_scheduler::{RemovedRouter, SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortEventKind {
    AfterCreate,
    AfterUpdate,
    AfterDelete,
}

impl fmt::Display for PortEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortEventKind::AfterCreate => "after_create",
            PortEventKind::AfterUpdate => "after_update",
            PortEventKind::AfterDelete => "after_delete",
        };
        f.write_str(s)
    }
}

/// A committed port mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    Created {
        port: Port,
    },
    Updated {
        original: Port,
        port: Port,
    },
    /// `removed_routers` is computed by the deleter before the port goes
    /// away, since the port can no longer be resolved afterwards.
    Deleted {
        port: Port,
        removed_routers: Vec<RemovedRouter>,
    },
}

impl PortEvent {
    pub fn kind(&self) -> PortEventKind {
        match self {
            PortEvent::Created { .. } => PortEventKind::AfterCreate,
            PortEvent::Updated { .. } => PortEventKind::AfterUpdate,
            PortEvent::Deleted { .. } => PortEventKind::AfterDelete,
        }
    }

    /// The port as it is after the mutation (or as it was, for a delete).
    pub fn port(&self) -> &Port {
        match self {
            PortEvent::Created { port }
            | PortEvent::Updated { port, .. }
            | PortEvent::Deleted { port, .. } => port,
        }
    }

    pub fn mac_address_updated(&self) -> bool {
        match self {
            PortEvent::Updated { original, port } => original.mac_address != port.mac_address,
            _ => false,
        }
    }
}

/// Subscriber callback.
pub type PortEventHandler =
    Arc<dyn Fn(&RequestContext, &PortEvent) -> SchedulerResult<()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("subscriber {subscriber} failed on {kind}: {source}")]
    SubscriberFailed {
        subscriber: String,
        kind: PortEventKind,
        #[source]
        source: SchedulerError,
    },
}

struct Subscription {
    kind: PortEventKind,
    name: String,
    handler: PortEventHandler,
}

#[derive(Default)]
pub struct PortEventBus {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl PortEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: PortEventKind, name: &str, handler: PortEventHandler) {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscriptions.push(Subscription {
            kind,
            name: name.to_string(),
            handler,
        });
        debug!(%kind, subscriber = %name, "port event subscriber registered");
    }

    pub fn subscriber_count(&self, kind: PortEventKind) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }

    /// Deliver `event` to every subscriber of its kind.
    ///
    /// A failing subscriber does not stop delivery to the rest; the first
    /// failure is returned once all have run.
    pub fn publish(&self, ctx: &RequestContext, event: &PortEvent) -> Result<(), DispatchError> {
        let kind = event.kind();
        // Clone out so subscribers may publish or subscribe re-entrantly.
        let handlers: Vec<(String, PortEventHandler)> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| (s.name.clone(), s.handler.clone()))
            .collect();

        let mut first_failure = None;
        for (name, handler) in handlers {
            debug!(%kind, subscriber = %name, port_id = %event.port().id, "dispatching port event");
            if let Err(e) = handler(ctx, event) {
                error!(%kind, subscriber = %name, error = %e, "port event subscriber failed");
                if first_failure.is_none() {
                    first_failure = Some(DispatchError::SubscriberFailed {
                        subscriber: name,
                        kind,
                        source: e,
                    });
                }
            }
        }

        first_failure.map_or(Ok(()), Err)
    }
}
