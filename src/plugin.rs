//! Event handlers: turn route and endpoint events into table mutations,
//! backend operations and a commit.
//!
//! The plugin owns the routing table and the backend. It is not shared; the
//! dispatcher task in [`crate::events`] is its only caller.
//!
//! The table is updated before the backend is called. When a backend step or
//! the commit fails, the route or service is marked pending and the next
//! event for it is applied in full even if it matches the table.

use crate::backend::Backend;
use crate::error::Result;
use crate::model::{Endpoints, EventType, FrontingSet, Route, RouteBinding, RouteId};
use crate::table::RoutingTable;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Where a route's binding currently lives in the table
#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingLocation {
    service: String,
    routing_key: String,
}

pub struct RouterPlugin {
    table: RoutingTable,
    backend: Box<dyn Backend>,
    routes: HashMap<RouteId, BindingLocation>,
    /// Routes whose last event failed in the backend, with the bindings it
    /// still has to remove
    pending_routes: HashMap<RouteId, Vec<(String, RouteBinding)>>,
    /// Services whose last endpoints event failed in the backend
    pending_services: HashSet<String>,
}

impl RouterPlugin {
    /// Initialize the backend and load the table it hands back
    pub async fn start(mut backend: Box<dyn Backend>) -> Result<Self> {
        let table = backend.initialize().await?;

        let routes = table
            .bindings()
            .map(|(set, binding)| {
                (
                    binding.route.clone(),
                    BindingLocation {
                        service: set.name.clone(),
                        routing_key: binding.routing_key(),
                    },
                )
            })
            .collect();

        info!(
            backend = backend.name(),
            fronting_sets = table.len(),
            "Router plugin started"
        );

        Ok(Self {
            table,
            backend,
            routes,
            pending_routes: HashMap::new(),
            pending_services: HashSet::new(),
        })
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn handle_route(&mut self, event: EventType, route: &Route) -> Result<()> {
        debug!(%event, route = %route.id(), host = %route.host, path = %route.path, "Route event");
        match event {
            EventType::Added | EventType::Modified => self.install_route(route).await,
            EventType::Deleted => self.delete_route(route).await,
        }
    }

    pub async fn handle_endpoints(&mut self, event: EventType, endpoints: &Endpoints) -> Result<()> {
        let service = endpoints.service_key();
        debug!(%event, %service, "Endpoints event");

        self.table.create_fronting_set(&service);
        let incoming = match event {
            EventType::Added | EventType::Modified => endpoints.to_endpoints(),
            EventType::Deleted => Vec::new(),
        };

        let unchanged = self.table.find_fronting_set(&service).is_some_and(|set| {
            set.endpoints.len() == incoming.len()
                && incoming.iter().all(|e| set.endpoints.get(&e.id) == Some(e))
        });
        if unchanged && event != EventType::Deleted && !self.pending_services.contains(&service) {
            debug!(%service, "Endpoints unchanged; skipping commit");
            return Ok(());
        }

        self.table.delete_endpoints(&service);
        self.table.add_endpoints(&service, incoming);

        match self.apply_endpoints(event, &service).await {
            Ok(()) => {
                self.pending_services.remove(&service);
                Ok(())
            }
            Err(e) => {
                warn!(%service, error = %e, "Endpoints not applied; the next event for this service retries");
                self.pending_services.insert(service);
                Err(e)
            }
        }
    }

    async fn apply_endpoints(&mut self, event: EventType, service: &str) -> Result<()> {
        let set = self.fronting_set(service);

        if event == EventType::Deleted && set.bindings.is_empty() {
            self.backend.delete_frontend(&set).await?;
            self.table.delete_fronting_set(service);
            info!(%service, "Fronting set removed");
        } else {
            if !set.endpoints.is_empty() {
                self.backend.create_frontend(&set).await?;
            }
            self.backend.sync_endpoints(&set).await?;
        }

        info!(%service, endpoints = set.endpoints.len(), "Endpoints updated");
        self.backend.commit(&self.table).await
    }

    async fn install_route(&mut self, route: &Route) -> Result<()> {
        let id = route.id();
        let service = route.service_key();
        let binding = RouteBinding::from_route(route);
        let location = BindingLocation {
            service: service.clone(),
            routing_key: binding.routing_key(),
        };

        let pending = self.pending_routes.remove(&id);
        let current = self
            .table
            .find_fronting_set(&service)
            .and_then(|set| set.bindings.get(&location.routing_key));
        if pending.is_none() && self.routes.get(&id) == Some(&location) && current == Some(&binding) {
            debug!(route = %id, "Route unchanged; skipping commit");
            return Ok(());
        }
        let mut stale = pending.unwrap_or_default();

        self.table.create_fronting_set(&service);
        let replaced = self.table.add_route_binding(&service, binding.clone());

        // A binding of the same route under a different service or key is stale.
        let moved = match self.routes.insert(id.clone(), location.clone()) {
            Some(old) if old != location && self.owned_binding(&old, &id).is_some() => self
                .table
                .remove_route_binding(&old.service, &old.routing_key)
                .map(|b| (old.service, b)),
            _ => None,
        };
        stale.extend(moved);

        if let Some(previous) = &replaced {
            if previous.route != id {
                info!(
                    route = %id,
                    replaced = %previous.route,
                    key = %location.routing_key,
                    "Route binding overwrites another route with the same host and path"
                );
                self.routes.remove(&previous.route);
            }
        }

        let result = self
            .apply_route(&service, &binding, &stale, replaced.as_ref())
            .await;
        match result {
            Ok(()) => {
                info!(route = %id, %service, key = %location.routing_key, termination = binding.termination.as_str(), "Route installed");
                Ok(())
            }
            Err(e) => {
                warn!(route = %id, error = %e, "Route not applied; the next event for this route retries");
                self.pending_routes.insert(id, stale);
                Err(e)
            }
        }
    }

    async fn apply_route(
        &mut self,
        service: &str,
        binding: &RouteBinding,
        stale: &[(String, RouteBinding)],
        replaced: Option<&RouteBinding>,
    ) -> Result<()> {
        let set = self.fronting_set(service);
        self.backend.create_frontend(&set).await?;

        self.remove_stale(stale).await?;
        if let Some(previous) = replaced {
            self.backend.remove_route(&set, previous).await?;
        }
        self.backend.add_route(&set, binding).await?;
        self.backend.commit(&self.table).await
    }

    async fn delete_route(&mut self, route: &Route) -> Result<()> {
        let id = route.id();
        let mut stale = self.pending_routes.remove(&id).unwrap_or_default();
        let location = self.routes.remove(&id).unwrap_or_else(|| BindingLocation {
            service: route.service_key(),
            routing_key: RouteBinding::from_route(route).routing_key(),
        });

        if self.owned_binding(&location, &id).is_some() {
            stale.extend(
                self.table
                    .remove_route_binding(&location.service, &location.routing_key)
                    .map(|b| (location.service.clone(), b)),
            );
        }
        if stale.is_empty() {
            debug!(route = %id, "Route not present; nothing to delete");
            return Ok(());
        }

        let result = match self.remove_stale(&stale).await {
            Ok(()) => self.backend.commit(&self.table).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                info!(route = %id, service = %location.service, key = %location.routing_key, "Route removed");
                Ok(())
            }
            Err(e) => {
                warn!(route = %id, error = %e, "Route removal not applied; the next event for this route retries");
                self.pending_routes.insert(id, stale);
                Err(e)
            }
        }
    }

    /// Remove bindings the backend still serves but the table no longer holds
    async fn remove_stale(&mut self, stale: &[(String, RouteBinding)]) -> Result<()> {
        for (service, binding) in stale {
            let set = self.fronting_set(service);
            self.backend.remove_route(&set, binding).await?;
        }
        Ok(())
    }

    /// The binding at `location`, if it belongs to route `id`
    fn owned_binding(&self, location: &BindingLocation, id: &RouteId) -> Option<&RouteBinding> {
        self.table
            .find_fronting_set(&location.service)?
            .bindings
            .get(&location.routing_key)
            .filter(|b| &b.route == id)
    }

    /// Current copy of a fronting set, or an empty one if it is gone
    fn fronting_set(&self, service: &str) -> FrontingSet {
        self.table
            .find_fronting_set(service)
            .cloned()
            .unwrap_or_else(|| FrontingSet::new(service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouterError;
    use crate::model::{EndpointAddress, EndpointPort, EndpointSubset, Termination, TlsConfig};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Backend that records every call
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        initial: RoutingTable,
        /// Calls starting with this prefix fail
        failing: Arc<Mutex<Option<&'static str>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn fail(&self, prefix: &'static str) {
            *self.failing.lock().unwrap() = Some(prefix);
        }

        fn recover(&self) {
            *self.failing.lock().unwrap() = None;
        }

        fn push(&self, call: String) -> Result<()> {
            let fails = self
                .failing
                .lock()
                .unwrap()
                .is_some_and(|prefix| call.starts_with(prefix));
            self.calls.lock().unwrap().push(call.clone());
            if fails {
                return Err(RouterError::Reload {
                    status: "exit status: 1".to_string(),
                    output: call,
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Backend for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn initialize(&mut self) -> Result<RoutingTable> {
            Ok(self.initial.clone())
        }

        async fn create_frontend(&mut self, set: &FrontingSet) -> Result<()> {
            self.push(format!("create_frontend {}", set.name))
        }

        async fn delete_frontend(&mut self, set: &FrontingSet) -> Result<()> {
            self.push(format!("delete_frontend {}", set.name))
        }

        async fn sync_endpoints(&mut self, set: &FrontingSet) -> Result<()> {
            let ids: Vec<&str> = set.endpoints.keys().map(String::as_str).collect();
            self.push(format!("sync_endpoints {} [{}]", set.name, ids.join(",")))
        }

        async fn add_route(&mut self, set: &FrontingSet, binding: &RouteBinding) -> Result<()> {
            self.push(format!("add_route {} {}", set.name, binding.routing_key()))
        }

        async fn remove_route(&mut self, set: &FrontingSet, binding: &RouteBinding) -> Result<()> {
            self.push(format!("remove_route {} {}", set.name, binding.routing_key()))
        }

        async fn commit(&mut self, _table: &RoutingTable) -> Result<()> {
            self.push("commit".to_string())
        }
    }

    fn route(name: &str, host: &str, service: &str) -> Route {
        Route {
            namespace: "ns".to_string(),
            name: name.to_string(),
            host: host.to_string(),
            path: String::new(),
            service: service.to_string(),
            tls: None,
        }
    }

    fn endpoints(service: &str, ips: &[&str]) -> Endpoints {
        Endpoints {
            namespace: "ns".to_string(),
            name: service.to_string(),
            subsets: vec![EndpointSubset {
                addresses: ips
                    .iter()
                    .map(|ip| EndpointAddress { ip: ip.to_string() })
                    .collect(),
                ports: vec![EndpointPort { port: 8080, name: None }],
            }],
        }
    }

    async fn plugin(recorder: &Recorder) -> RouterPlugin {
        RouterPlugin::start(Box::new(recorder.clone())).await.unwrap()
    }

    fn endpoint_ids(p: &RouterPlugin, service: &str) -> Vec<String> {
        p.table()
            .find_fronting_set(service)
            .map(|s| s.endpoints.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_route_add_creates_set_and_commits() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        p.handle_route(EventType::Added, &route("web", "a.com", "svc"))
            .await
            .unwrap();

        assert_eq!(
            rec.calls(),
            vec!["create_frontend ns/svc", "add_route ns/svc a.com", "commit"]
        );
        assert!(p.table().find_fronting_set("ns/svc").unwrap().bindings.contains_key("a.com"));
    }

    #[tokio::test]
    async fn test_repeated_route_event_is_skipped() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        let r = route("web", "a.com", "svc");
        p.handle_route(EventType::Added, &r).await.unwrap();
        rec.clear();
        p.handle_route(EventType::Modified, &r).await.unwrap();
        assert!(rec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_modify_same_key_recreates_route() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        let mut r = route("web", "a.com", "svc");
        p.handle_route(EventType::Added, &r).await.unwrap();
        rec.clear();

        r.tls = Some(TlsConfig {
            termination: Termination::Edge,
            ..Default::default()
        });
        p.handle_route(EventType::Modified, &r).await.unwrap();
        assert_eq!(
            rec.calls(),
            vec![
                "create_frontend ns/svc",
                "remove_route ns/svc a.com",
                "add_route ns/svc a.com",
                "commit"
            ]
        );
    }

    #[tokio::test]
    async fn test_host_change_removes_old_binding() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        p.handle_route(EventType::Added, &route("web", "a.com", "svc"))
            .await
            .unwrap();
        rec.clear();

        p.handle_route(EventType::Modified, &route("web", "b.com", "other"))
            .await
            .unwrap();

        assert!(p.table().find_fronting_set("ns/svc").unwrap().bindings.is_empty());
        assert!(p.table().find_fronting_set("ns/other").unwrap().bindings.contains_key("b.com"));
        assert_eq!(
            rec.calls(),
            vec![
                "create_frontend ns/other",
                "remove_route ns/svc a.com",
                "add_route ns/other b.com",
                "commit"
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_unknown_route_is_noop() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        p.handle_route(EventType::Deleted, &route("web", "a.com", "svc"))
            .await
            .unwrap();
        assert!(rec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_does_not_remove_other_routes_binding() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        p.handle_route(EventType::Added, &route("first", "a.com", "svc"))
            .await
            .unwrap();
        p.handle_route(EventType::Added, &route("second", "a.com", "svc"))
            .await
            .unwrap();
        rec.clear();

        p.handle_route(EventType::Deleted, &route("first", "a.com", "svc"))
            .await
            .unwrap();
        assert!(rec.calls().is_empty());
        let set = p.table().find_fronting_set("ns/svc").unwrap();
        assert_eq!(set.bindings["a.com"].route.name, "second");
    }

    #[tokio::test]
    async fn test_endpoints_rebuild_replaces_set() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        p.handle_endpoints(EventType::Added, &endpoints("svc", &["10.0.0.1", "10.0.0.2"]))
            .await
            .unwrap();
        p.handle_endpoints(EventType::Modified, &endpoints("svc", &["10.0.0.2", "10.0.0.3"]))
            .await
            .unwrap();

        assert_eq!(endpoint_ids(&p, "ns/svc"), vec!["10.0.0.2:8080", "10.0.0.3:8080"]);
        assert_eq!(
            rec.calls().last().unwrap(),
            "commit"
        );
        assert!(rec
            .calls()
            .contains(&"sync_endpoints ns/svc [10.0.0.2:8080,10.0.0.3:8080]".to_string()));
    }

    #[tokio::test]
    async fn test_unchanged_endpoints_skip_commit() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        let e = endpoints("svc", &["10.0.0.1"]);
        p.handle_endpoints(EventType::Added, &e).await.unwrap();
        rec.clear();
        p.handle_endpoints(EventType::Modified, &e).await.unwrap();
        assert!(rec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_endpoints_deleted_without_routes_removes_set() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        let e = endpoints("svc", &["10.0.0.1"]);
        p.handle_endpoints(EventType::Added, &e).await.unwrap();
        rec.clear();

        p.handle_endpoints(EventType::Deleted, &e).await.unwrap();
        assert_eq!(rec.calls(), vec!["delete_frontend ns/svc", "commit"]);
        assert!(p.table().find_fronting_set("ns/svc").is_none());
    }

    #[tokio::test]
    async fn test_endpoints_deleted_with_routes_keeps_set() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        p.handle_route(EventType::Added, &route("web", "a.com", "svc"))
            .await
            .unwrap();
        let e = endpoints("svc", &["10.0.0.1"]);
        p.handle_endpoints(EventType::Added, &e).await.unwrap();
        rec.clear();

        p.handle_endpoints(EventType::Deleted, &e).await.unwrap();
        assert_eq!(rec.calls(), vec!["sync_endpoints ns/svc []", "commit"]);
        assert!(endpoint_ids(&p, "ns/svc").is_empty());
    }

    #[tokio::test]
    async fn test_index_is_rebuilt_from_initial_table() {
        let mut initial = RoutingTable::new();
        initial.add_route_binding("ns/svc", RouteBinding::from_route(&route("web", "a.com", "svc")));
        let rec = Recorder {
            initial,
            ..Default::default()
        };
        let mut p = plugin(&rec).await;

        p.handle_route(EventType::Deleted, &route("web", "a.com", "svc"))
            .await
            .unwrap();
        assert_eq!(rec.calls(), vec!["remove_route ns/svc a.com", "commit"]);
    }

    #[tokio::test]
    async fn test_failed_route_is_applied_on_redelivery() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        let r = route("web", "a.com", "svc");

        rec.fail("commit");
        assert!(p.handle_route(EventType::Added, &r).await.is_err());
        rec.recover();
        rec.clear();

        p.handle_route(EventType::Added, &r).await.unwrap();
        assert_eq!(
            rec.calls(),
            vec![
                "create_frontend ns/svc",
                "remove_route ns/svc a.com",
                "add_route ns/svc a.com",
                "commit"
            ]
        );

        // Converged: the next identical event is skipped again
        rec.clear();
        p.handle_route(EventType::Modified, &r).await.unwrap();
        assert!(rec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_move_still_removes_old_binding() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        p.handle_route(EventType::Added, &route("web", "a.com", "svc"))
            .await
            .unwrap();

        let moved = route("web", "b.com", "svc");
        rec.fail("remove_route");
        assert!(p.handle_route(EventType::Modified, &moved).await.is_err());
        rec.recover();
        rec.clear();

        p.handle_route(EventType::Modified, &moved).await.unwrap();
        assert_eq!(
            rec.calls(),
            vec![
                "create_frontend ns/svc",
                "remove_route ns/svc a.com",
                "remove_route ns/svc b.com",
                "add_route ns/svc b.com",
                "commit"
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_delete_is_retried() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        let r = route("web", "a.com", "svc");
        p.handle_route(EventType::Added, &r).await.unwrap();

        rec.fail("remove_route");
        assert!(p.handle_route(EventType::Deleted, &r).await.is_err());
        assert!(p.table().find_fronting_set("ns/svc").unwrap().bindings.is_empty());
        rec.recover();
        rec.clear();

        p.handle_route(EventType::Deleted, &r).await.unwrap();
        assert_eq!(rec.calls(), vec!["remove_route ns/svc a.com", "commit"]);

        rec.clear();
        p.handle_route(EventType::Deleted, &r).await.unwrap();
        assert!(rec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_endpoints_are_applied_on_redelivery() {
        let rec = Recorder::default();
        let mut p = plugin(&rec).await;
        let e = endpoints("svc", &["10.0.0.1"]);

        rec.fail("sync_endpoints");
        assert!(p.handle_endpoints(EventType::Added, &e).await.is_err());
        rec.recover();
        rec.clear();

        p.handle_endpoints(EventType::Added, &e).await.unwrap();
        assert_eq!(
            rec.calls(),
            vec![
                "create_frontend ns/svc",
                "sync_endpoints ns/svc [10.0.0.1:8080]",
                "commit"
            ]
        );

        rec.clear();
        p.handle_endpoints(EventType::Modified, &e).await.unwrap();
        assert!(rec.calls().is_empty());
    }
}
