//! Single-owner event dispatcher.
//!
//! The plugin lives inside one task. Every producer holds an [`EventSender`]
//! and talks to that task over a bounded queue, so events are handled one at a
//! time in arrival order and the routing table is never shared.

use crate::error::{Result, RouterError};
use crate::model::{Endpoints, EventType, Route};
use crate::plugin::RouterPlugin;
use crate::table::RoutingTable;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

enum Command {
    Route {
        event: EventType,
        route: Route,
        reply: oneshot::Sender<Result<()>>,
    },
    Endpoints {
        event: EventType,
        endpoints: Endpoints,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<RoutingTable>,
    },
}

/// Handle used to submit events to the dispatcher
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Command>,
}

impl EventSender {
    /// Queue a route event and wait for its outcome
    pub async fn route(&self, event: EventType, route: Route) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Route { event, route, reply }).await?;
        rx.await.map_err(|_| RouterError::DispatcherClosed)?
    }

    /// Queue an endpoints event and wait for its outcome
    pub async fn endpoints(&self, event: EventType, endpoints: Endpoints) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Endpoints {
            event,
            endpoints,
            reply,
        })
        .await?;
        rx.await.map_err(|_| RouterError::DispatcherClosed)?
    }

    /// Copy of the routing table as of now
    pub async fn snapshot(&self) -> Result<RoutingTable> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| RouterError::DispatcherClosed)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| RouterError::DispatcherClosed)
    }
}

/// Start the dispatcher task for `plugin`
pub fn spawn(plugin: RouterPlugin, queue_depth: usize, shutdown_rx: watch::Receiver<bool>) -> (EventSender, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    let handle = tokio::spawn(run(plugin, rx, shutdown_rx));
    (EventSender { tx }, handle)
}

async fn run(mut plugin: RouterPlugin, mut rx: mpsc::Receiver<Command>, mut shutdown_rx: watch::Receiver<bool>) {
    info!(backend = plugin.backend_name(), "Event dispatcher started");

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    debug!("All event senders dropped");
                    break;
                };
                dispatch(&mut plugin, command).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Event dispatcher shutting down");
                    break;
                }
            }
        }
    }
}

async fn dispatch(plugin: &mut RouterPlugin, command: Command) {
    match command {
        Command::Route { event, route, reply } => {
            let result = plugin.handle_route(event, &route).await;
            if let Err(e) = &result {
                error!(%event, route = %route.id(), error = %e, "Failed to handle route event");
            }
            let _ = reply.send(result);
        }
        Command::Endpoints {
            event,
            endpoints,
            reply,
        } => {
            let result = plugin.handle_endpoints(event, &endpoints).await;
            if let Err(e) = &result {
                error!(%event, service = %endpoints.service_key(), error = %e, "Failed to handle endpoints event");
            }
            let _ = reply.send(result);
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(plugin.table().clone());
        }
    }
}
