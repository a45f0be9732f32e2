//! Routing intents and the backend-facing state derived from them.
//!
//! `Route` and `Endpoints` are the inbound payloads delivered by the event
//! feed. `FrontingSet`, `RouteBinding`, `Endpoint` and `Certificate` are what
//! the routing table stores and what the backends consume.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

/// Suffix of the certificate id holding a route's CA certificate
pub const CA_CERT_SUFFIX: &str = "_ca";

/// Suffix of the certificate id holding a reencrypt route's destination CA
pub const DEST_CA_CERT_SUFFIX: &str = "_pod";

/// Kind of change carried by an inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Added => write!(f, "added"),
            EventType::Modified => write!(f, "modified"),
            EventType::Deleted => write!(f, "deleted"),
        }
    }
}

/// Where TLS is terminated for a route
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Termination {
    /// Plain HTTP
    #[default]
    None,
    /// Decrypted at the proxy
    Edge,
    /// Decrypted at the proxy and re-encrypted towards the pod
    Reencrypt,
    /// Forwarded by SNI without decryption
    Passthrough,
}

impl Termination {
    /// Whether the proxy holds a certificate for this route
    pub fn terminates_at_proxy(&self) -> bool {
        matches!(self, Termination::Edge | Termination::Reencrypt)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::None => "none",
            Termination::Edge => "edge",
            Termination::Reencrypt => "reencrypt",
            Termination::Passthrough => "passthrough",
        }
    }
}

/// Certificate material and termination mode of a route
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub termination: Termination,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub ca_certificate: Option<String>,
    #[serde(default)]
    pub destination_ca_certificate: Option<String>,
}

/// Stable identity of a route, independent of its host and path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteId {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A desired binding of a host and optional path to a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub namespace: String,
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub path: String,
    /// Target service name, in the route's namespace
    pub service: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Route {
    pub fn id(&self) -> RouteId {
        RouteId {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Key of the fronting set this route targets
    pub fn service_key(&self) -> String {
        service_key(&self.namespace, &self.service)
    }

    pub fn termination(&self) -> Termination {
        self.tls.as_ref().map(|t| t.termination).unwrap_or_default()
    }
}

/// Fronting set key for a service: `namespace/name`
pub fn service_key(namespace: &str, service: &str) -> String {
    format!("{}/{}", namespace, service)
}

/// Snapshot of the reachable addresses of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub namespace: String,
    /// Service name
    pub name: String,
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    pub port: u16,
    #[serde(default)]
    pub name: Option<String>,
}

impl Endpoints {
    pub fn service_key(&self) -> String {
        service_key(&self.namespace, &self.name)
    }

    /// Expand subsets into individual endpoints.
    ///
    /// Addresses that do not parse as IPs and ports equal to zero are logged
    /// and skipped; the rest of the payload is still used.
    pub fn to_endpoints(&self) -> Vec<Endpoint> {
        let mut out = Vec::new();
        for subset in &self.subsets {
            for address in &subset.addresses {
                let ip: IpAddr = match address.ip.parse() {
                    Ok(ip) => ip,
                    Err(_) => {
                        warn!(
                            service = %self.service_key(),
                            ip = %address.ip,
                            "Skipping endpoint with unparseable address"
                        );
                        continue;
                    }
                };
                for port in &subset.ports {
                    if port.port == 0 {
                        warn!(service = %self.service_key(), %ip, "Skipping endpoint with port 0");
                        continue;
                    }
                    out.push(Endpoint::new(ip, port.port));
                }
            }
        }
        out
    }
}

/// One reachable backend address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// `ip:port`, bracketed for IPv6
    pub id: String,
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            id: SocketAddr::new(ip, port).to_string(),
            ip: ip.to_string(),
            port,
        }
    }
}

/// Credential derived from a route's TLS configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: String,
    pub contents: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// Backend-facing form of a route, keyed by host and path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteBinding {
    pub route: RouteId,
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub termination: Termination,
    #[serde(default)]
    pub certificates: BTreeMap<String, Certificate>,
}

impl RouteBinding {
    /// Build the binding for a route, deriving its certificates.
    ///
    /// Only edge and reencrypt routes carry certificates. The host certificate
    /// needs both a certificate and a key; the destination CA is kept for
    /// reencrypt routes only.
    pub fn from_route(route: &Route) -> Self {
        let termination = route.termination();
        let mut certificates = BTreeMap::new();

        if let Some(tls) = route.tls.as_ref().filter(|_| termination.terminates_at_proxy()) {
            match (non_empty(&tls.certificate), non_empty(&tls.key)) {
                (Some(cert), Some(key)) => {
                    certificates.insert(
                        route.host.clone(),
                        Certificate {
                            id: route.host.clone(),
                            contents: cert.to_string(),
                            private_key: Some(key.to_string()),
                        },
                    );
                }
                (None, None) => {}
                _ => warn!(
                    route = %route.id(),
                    host = %route.host,
                    "Route has a certificate or key but not both; host certificate skipped"
                ),
            }

            if let Some(ca) = non_empty(&tls.ca_certificate) {
                let id = format!("{}{}", route.host, CA_CERT_SUFFIX);
                certificates.insert(
                    id.clone(),
                    Certificate {
                        id,
                        contents: ca.to_string(),
                        private_key: None,
                    },
                );
            }

            if termination == Termination::Reencrypt {
                if let Some(dest) = non_empty(&tls.destination_ca_certificate) {
                    let id = format!("{}{}", route.host, DEST_CA_CERT_SUFFIX);
                    certificates.insert(
                        id.clone(),
                        Certificate {
                            id,
                            contents: dest.to_string(),
                            private_key: None,
                        },
                    );
                }
            }
        }

        Self {
            route: route.id(),
            host: route.host.clone(),
            path: route.path.clone(),
            termination,
            certificates,
        }
    }

    /// Key of this binding within its fronting set
    pub fn routing_key(&self) -> String {
        routing_key(&self.host, &self.path)
    }

    pub fn host_certificate(&self) -> Option<&Certificate> {
        self.certificates
            .get(&self.host)
            .filter(|c| c.private_key.is_some())
    }

    pub fn ca_certificate(&self) -> Option<&Certificate> {
        self.certificates
            .get(&format!("{}{}", self.host, CA_CERT_SUFFIX))
    }

    pub fn destination_ca_certificate(&self) -> Option<&Certificate> {
        self.certificates
            .get(&format!("{}{}", self.host, DEST_CA_CERT_SUFFIX))
    }
}

pub fn routing_key(host: &str, path: &str) -> String {
    format!("{}{}", host, path)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// All backend state associated with one target service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontingSet {
    /// Service key, `namespace/name`
    pub name: String,
    #[serde(default)]
    pub endpoints: BTreeMap<String, Endpoint>,
    #[serde(default)]
    pub bindings: BTreeMap<String, RouteBinding>,
}

impl FrontingSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Namespace and service name encoded in the key
    pub fn namespace_and_service(&self) -> (&str, &str) {
        self.name.split_once('/').unwrap_or(("", &self.name))
    }

    /// In-cluster DNS name of the service
    pub fn hostname(&self) -> String {
        let (namespace, service) = self.namespace_and_service();
        format!("{}.{}.svc", service, namespace)
    }
}
