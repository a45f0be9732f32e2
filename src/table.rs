//! The routing table: fronting sets keyed by service, owned in one map.
//!
//! Every mutation goes through a method on [`RoutingTable`] that borrows the
//! entry in place, so there is no fetch-copy-write-back step to forget.

use crate::model::{Endpoint, FrontingSet, RouteBinding};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingTable {
    sets: BTreeMap<String, FrontingSet>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty fronting set unless one already exists.
    ///
    /// Returns true when a new set was created.
    pub fn create_fronting_set(&mut self, id: &str) -> bool {
        if self.sets.contains_key(id) {
            return false;
        }
        debug!(fronting_set = %id, "Creating fronting set");
        self.sets.insert(id.to_string(), FrontingSet::new(id));
        true
    }

    pub fn find_fronting_set(&self, id: &str) -> Option<&FrontingSet> {
        self.sets.get(id)
    }

    pub fn delete_fronting_set(&mut self, id: &str) -> Option<FrontingSet> {
        self.sets.remove(id)
    }

    /// Remove every endpoint of a set. Returns true when any were removed.
    pub fn delete_endpoints(&mut self, id: &str) -> bool {
        match self.sets.get_mut(id) {
            Some(set) if !set.endpoints.is_empty() => {
                set.endpoints.clear();
                true
            }
            _ => false,
        }
    }

    /// Add endpoints to a set, creating the set if needed.
    ///
    /// Endpoints already present by id are left untouched. Returns true when
    /// at least one endpoint was inserted.
    pub fn add_endpoints(&mut self, id: &str, endpoints: impl IntoIterator<Item = Endpoint>) -> bool {
        let set = self.entry(id);
        let mut changed = false;
        for endpoint in endpoints {
            if !set.endpoints.contains_key(&endpoint.id) {
                set.endpoints.insert(endpoint.id.clone(), endpoint);
                changed = true;
            }
        }
        changed
    }

    /// Insert a binding keyed by host+path, replacing any previous one.
    ///
    /// Returns the replaced binding.
    pub fn add_route_binding(&mut self, id: &str, binding: RouteBinding) -> Option<RouteBinding> {
        self.entry(id).bindings.insert(binding.routing_key(), binding)
    }

    /// Remove the binding stored under `routing_key`. Missing sets and keys are no-ops.
    pub fn remove_route_binding(&mut self, id: &str, routing_key: &str) -> Option<RouteBinding> {
        self.sets.get_mut(id)?.bindings.remove(routing_key)
    }

    pub fn fronting_sets(&self) -> impl Iterator<Item = &FrontingSet> {
        self.sets.values()
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&FrontingSet, &RouteBinding)> {
        self.sets
            .values()
            .flat_map(|set| set.bindings.values().map(move |b| (set, b)))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Encode the table in the snapshot format
    pub fn to_snapshot(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_snapshot(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    fn entry(&mut self, id: &str) -> &mut FrontingSet {
        self.sets
            .entry(id.to_string())
            .or_insert_with(|| FrontingSet::new(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Route, Termination, TlsConfig};
    use std::net::IpAddr;

    fn endpoint(ip: &str, port: u16) -> Endpoint {
        Endpoint::new(ip.parse::<IpAddr>().unwrap(), port)
    }

    fn binding(name: &str, host: &str, path: &str) -> RouteBinding {
        RouteBinding::from_route(&Route {
            namespace: "ns".to_string(),
            name: name.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            service: "svc".to_string(),
            tls: None,
        })
    }

    #[test]
    fn test_create_is_idempotent() {
        let mut table = RoutingTable::new();
        assert!(table.create_fronting_set("ns/svc"));
        table.add_endpoints("ns/svc", vec![endpoint("10.0.0.1", 80)]);
        assert!(!table.create_fronting_set("ns/svc"));
        assert_eq!(table.find_fronting_set("ns/svc").unwrap().endpoints.len(), 1);
    }

    #[test]
    fn test_add_endpoints_skips_existing() {
        let mut table = RoutingTable::new();
        assert!(table.add_endpoints("ns/svc", vec![endpoint("10.0.0.1", 80)]));
        assert!(!table.add_endpoints("ns/svc", vec![endpoint("10.0.0.1", 80)]));
        assert!(table.add_endpoints("ns/svc", vec![endpoint("10.0.0.1", 80), endpoint("10.0.0.2", 80)]));
        assert_eq!(table.find_fronting_set("ns/svc").unwrap().endpoints.len(), 2);
    }

    #[test]
    fn test_delete_on_missing_set_is_noop() {
        let mut table = RoutingTable::new();
        assert!(!table.delete_endpoints("ns/missing"));
        assert!(table.remove_route_binding("ns/missing", "a.com").is_none());
        assert!(table.delete_fronting_set("ns/missing").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_same_routing_key_replaces_binding() {
        let mut table = RoutingTable::new();
        table.create_fronting_set("ns/svc");
        assert!(table.add_route_binding("ns/svc", binding("first", "a.com", "/x")).is_none());
        let previous = table.add_route_binding("ns/svc", binding("second", "a.com", "/x"));

        assert_eq!(previous.unwrap().route.name, "first");
        let set = table.find_fronting_set("ns/svc").unwrap();
        assert_eq!(set.bindings.len(), 1);
        assert_eq!(set.bindings["a.com/x"].route.name, "second");
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut table = RoutingTable::new();
        table.add_endpoints("ns/svc", vec![endpoint("10.0.0.1", 8080)]);
        table.add_route_binding("ns/svc", binding("web", "a.com", ""));
        table.add_route_binding(
            "ns/other",
            RouteBinding::from_route(&Route {
                namespace: "ns".to_string(),
                name: "secure".to_string(),
                host: "b.com".to_string(),
                path: String::new(),
                service: "other".to_string(),
                tls: Some(TlsConfig {
                    termination: Termination::Edge,
                    certificate: Some("CERT".to_string()),
                    key: Some("KEY".to_string()),
                    ..Default::default()
                }),
            }),
        );

        let snapshot = table.to_snapshot().unwrap();
        let restored = RoutingTable::from_snapshot(&snapshot).unwrap();
        assert_eq!(restored, table);

        let value: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
        assert!(value["ns/svc"]["endpoints"]["10.0.0.1:8080"].is_object());
        assert_eq!(
            value["ns/other"]["bindings"]["b.com"]["certificates"]["b.com"]["private_key"],
            "KEY"
        );
    }
}
