//! Deterministic names of every object the controller manages on the appliance.
//!
//! All names carry the `routegate` prefix so they never collide with objects
//! created by hand.

use crate::model::{Endpoint, RouteId};
use std::net::IpAddr;

pub const PREFIX: &str = "routegate";

pub const INSECURE_POLICY: &str = "routegate_insecure_routes";
pub const SECURE_POLICY: &str = "routegate_secure_routes";
pub const DEFAULT_RULE: &str = "default_noop";

pub const PASSTHROUGH_IRULE: &str = "routegate_passthrough_irule";
/// rule name -> hostname
pub const PASSTHROUGH_ROUTES_DATAGROUP: &str = "routegate_passthrough_route_dg";
/// hostname -> pool path, read by the passthrough iRule
pub const PASSTHROUGH_HOSTS_DATAGROUP: &str = "routegate_passthrough_servername_dg";

pub fn pool_name(namespace: &str, service: &str) -> String {
    format!("{}_{}_{}", PREFIX, namespace, service)
}

pub fn rule_name(route: &RouteId) -> String {
    format!("{}_route_{}_{}", PREFIX, route.namespace, route.name)
}

/// Pool member name: `ip:port` for IPv4, `ip.port` for IPv6
pub fn member_name(endpoint: &Endpoint) -> String {
    match endpoint.ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("{}.{}", ip, endpoint.port),
        _ => format!("{}:{}", endpoint.ip, endpoint.port),
    }
}

pub fn cert_name(rule: &str) -> String {
    format!("{}-https-cert", rule)
}

pub fn key_name(rule: &str) -> String {
    format!("{}-https-key", rule)
}

pub fn chain_name(rule: &str) -> String {
    format!("{}-https-chain", rule)
}

pub fn client_ssl_profile_name(rule: &str) -> String {
    format!("{}-client-ssl-profile", rule)
}

pub fn server_ssl_profile_name(rule: &str) -> String {
    format!("{}-server-ssl-profile", rule)
}

/// Full path of an object inside a partition, e.g. `/Common/name`
pub fn full_path(partition: &str, name: &str) -> String {
    format!("{}/{}", partition.trim_end_matches('/'), name)
}

/// URI form of an object's full path: `/Common/name` becomes `~Common~name`
pub fn resource_id(partition: &str, name: &str) -> String {
    full_path(partition, name).replace('/', "~")
}
