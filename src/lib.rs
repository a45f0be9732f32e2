//! Routegate - routing-state reconciliation for cluster reverse proxies
//!
//! This library turns route and endpoint events into backend configuration:
//! - Keeps an in-memory routing table of fronting sets, endpoints and route bindings
//! - Renders the table through templates into a proxy config, persists it, and reloads the proxy
//! - Or reconciles pools, policy rules, TLS profiles and SNI datagroups on a remote appliance
//! - Converges backend object sets with an add-then-delete diff
//! - Serializes all event handling through a single dispatcher task

pub mod admin;
pub mod appliance;
pub mod backend;
pub mod certs;
pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod model;
pub mod plugin;
pub mod table;
