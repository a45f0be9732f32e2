//! Remote load-balancer appliance backend.
//!
//! Maps the routing table onto appliance objects:
//! - one pool per fronting set, members keyed by `ip:port`
//! - one forwarding-policy rule per plain or TLS-terminated route, attached to
//!   the insecure or secure policy
//! - uploaded certificate/key files and client/server SSL profiles for edge
//!   and reencrypt routes, attached to the HTTPS virtual server
//! - datagroup entries for passthrough routes, read by an SNI-dispatch iRule
//!
//! Bootstrap checks before it creates and treats "already exists" as success.
//! Per-route creates treat "already exists" as a name collision. Deletes treat
//! "not found" as success. Nothing is retried here.

pub mod client;
pub mod naming;
pub mod payloads;

use crate::backend::Backend;
use crate::config::ApplianceConfig;
use crate::diff;
use crate::error::{ApplianceError, Result, RouterError};
use crate::model::{FrontingSet, RouteBinding, Termination};
use crate::table::RoutingTable;
use async_trait::async_trait;
use client::{Transport, Verb, UPLOAD_DIR};
use naming::*;
use payloads::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use client::HttpTransport;

const PASSTHROUGH_IRULE_CODE: &str = include_str!("passthrough.tcl");
const POOL_MONITOR: &str = "min 1 of /Common/http /Common/https";

/// Hostname and pool of a passthrough route
#[derive(Debug, Clone, PartialEq, Eq)]
struct PassthroughRoute {
    host: String,
    pool: String,
}

pub struct ApplianceBackend {
    transport: Arc<dyn Transport>,
    partition: String,
    http_vserver: Option<String>,
    https_vserver: Option<String>,
    /// Known pools and their members, filled lazily
    pool_members: HashMap<String, BTreeSet<String>>,
    /// Passthrough routes by rule name, loaded from the datagroups on first use
    passthrough_routes: Option<BTreeMap<String, PassthroughRoute>>,
}

impl ApplianceBackend {
    pub fn new(config: &ApplianceConfig, transport: Arc<dyn Transport>) -> Self {
        if config.http_vserver.is_none() {
            warn!("No virtual server configured for HTTP; plain routes will not be configured");
        }
        if config.https_vserver.is_none() {
            warn!("No virtual server configured for HTTPS; TLS routes will not be configured");
        }

        Self {
            transport,
            partition: config.partition_path.trim_end_matches('/').to_string(),
            http_vserver: config.http_vserver.clone(),
            https_vserver: config.https_vserver.clone(),
            pool_members: HashMap::new(),
            passthrough_routes: None,
        }
    }

    /// Backend talking HTTP(S) to the configured appliance
    pub fn connect(config: &ApplianceConfig) -> Result<Self> {
        let transport = HttpTransport::new(config)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    fn id(&self, name: &str) -> String {
        resource_id(&self.partition, name)
    }

    fn path(&self, name: &str) -> String {
        full_path(&self.partition, name)
    }

    async fn get(&self, path: &str) -> std::result::Result<Value, ApplianceError> {
        self.transport.request(Verb::Get, path, None).await
    }

    async fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.get(path).await?;
        serde_json::from_value(value).map_err(|e| {
            RouterError::Appliance(ApplianceError::new("GET", path, None, format!("unexpected response: {}", e)))
        })
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.get(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> std::result::Result<Value, ApplianceError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApplianceError::new("POST", path, None, format!("payload encoding: {}", e)))?;
        self.transport.request(Verb::Post, path, Some(body)).await
    }

    async fn patch<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApplianceError::new("PATCH", path, None, format!("payload encoding: {}", e)))?;
        self.transport.request(Verb::Patch, path, Some(body)).await?;
        Ok(())
    }

    /// Create during bootstrap; "already exists" counts as success
    async fn post_idempotent<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
        match self.post(path, body).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(path, "Object already exists; nothing to do");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create a per-route object; "already exists" is a name collision
    async fn post_unique<B: Serialize + Sync>(&self, path: &str, body: &B, kind: &'static str, name: &str) -> Result<()> {
        match self.post(path, body).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Err(RouterError::NameCollision {
                kind,
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete; "not found" counts as success
    async fn delete(&self, path: &str) -> Result<()> {
        match self.transport.request(Verb::Delete, path, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(path, "Object already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // --- bootstrap ---

    async fn ensure_partition_path(&self) -> Result<()> {
        let mut current = String::new();
        for component in self.partition.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            let id = current.replace('/', "~");
            if self.exists(&format!("/mgmt/tm/sys/folder/{}", id)).await? {
                continue;
            }
            info!(folder = %current, "Creating partition folder");
            self.post_idempotent("/mgmt/tm/sys/folder", &Folder { name: &current })
                .await?;
        }
        Ok(())
    }

    async fn ensure_policy(&self, policy: &str) -> Result<()> {
        let policy_url = format!("/mgmt/tm/ltm/policy/{}", self.id(policy));
        if self.exists(&policy_url).await? {
            debug!(policy, "Policy already exists");
            return Ok(());
        }

        info!(policy, "Creating forwarding policy");
        self.post_idempotent("/mgmt/tm/ltm/policy", &Policy::forwarding(policy, &self.partition))
            .await?;
        self.post_idempotent(&format!("{}/rules", policy_url), &Named { name: DEFAULT_RULE })
            .await
    }

    async fn ensure_policy_attached(&self, vserver: &str, policy: &str) -> Result<()> {
        let url = format!("/mgmt/tm/ltm/virtual/{}/policies", self.id(vserver));
        let attached: ItemList<NamedItem> = self.get_as(&url).await?;
        if attached.items.iter().any(|p| p.name == policy) {
            debug!(vserver, policy, "Policy already attached");
            return Ok(());
        }

        info!(vserver, policy, "Attaching policy to virtual server");
        self.post_idempotent(
            &url,
            &Attachment {
                name: policy,
                partition: &self.partition,
                context: None,
            },
        )
        .await
    }

    async fn ensure_datagroup(&self, name: &str) -> Result<()> {
        let url = format!("/mgmt/tm/ltm/data-group/internal/{}", self.id(name));
        if self.exists(&url).await? {
            return Ok(());
        }
        info!(datagroup = name, "Creating datagroup");
        self.post_idempotent(
            "/mgmt/tm/ltm/data-group/internal",
            &Datagroup {
                name,
                partition: &self.partition,
                kind: "string",
            },
        )
        .await
    }

    async fn ensure_irule(&self) -> Result<()> {
        let url = format!("/mgmt/tm/ltm/rule/{}", self.id(PASSTHROUGH_IRULE));
        if self.exists(&url).await? {
            return Ok(());
        }
        info!(irule = PASSTHROUGH_IRULE, "Creating passthrough iRule");
        self.post_idempotent(
            "/mgmt/tm/ltm/rule",
            &IRule {
                name: PASSTHROUGH_IRULE,
                partition: &self.partition,
                api_anonymous: PASSTHROUGH_IRULE_CODE,
            },
        )
        .await
    }

    async fn ensure_irule_attached(&self, vserver: &str) -> Result<()> {
        let url = format!("/mgmt/tm/ltm/virtual/{}", self.id(vserver));
        let mut current: VirtualServerRules = self.get_as(&url).await?;
        let irule = self.path(PASSTHROUGH_IRULE);
        if current.rules.contains(&irule) {
            debug!(vserver, "Passthrough iRule already attached");
            return Ok(());
        }

        info!(vserver, "Attaching passthrough iRule to virtual server");
        current.rules.push(irule);
        self.patch(&url, &current).await
    }

    // --- pools ---

    fn pool_name(&self, set: &FrontingSet) -> String {
        let (namespace, service) = set.namespace_and_service();
        pool_name(namespace, service)
    }

    fn pool_url(&self, pool: &str) -> String {
        format!("/mgmt/tm/ltm/pool/{}", self.id(pool))
    }

    async fn ensure_pool(&mut self, pool: &str) -> Result<()> {
        if self.pool_members.contains_key(pool) {
            return Ok(());
        }
        if self.exists(&self.pool_url(pool)).await? {
            debug!(pool, "Pool already exists");
        } else {
            info!(pool, "Creating pool");
            self.post_idempotent(
                "/mgmt/tm/ltm/pool",
                &Pool {
                    name: pool,
                    partition: &self.partition,
                    mode: "round-robin",
                    monitor: POOL_MONITOR,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Current members of a pool, `None` when the pool does not exist
    async fn members(&mut self, pool: &str) -> Result<Option<BTreeSet<String>>> {
        if let Some(members) = self.pool_members.get(pool) {
            return Ok(Some(members.clone()));
        }
        let url = format!("{}/members", self.pool_url(pool));
        let list: ItemList<NamedItem> = match self.get_as(&url).await {
            Ok(list) => list,
            Err(RouterError::Appliance(e)) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let members: BTreeSet<String> = list.items.into_iter().map(|m| m.name).collect();
        self.pool_members.insert(pool.to_string(), members.clone());
        Ok(Some(members))
    }

    async fn reconcile_members(&mut self, pool: &str, desired: Vec<String>) -> Result<()> {
        let actual = match self.members(pool).await? {
            Some(actual) => actual,
            None if desired.is_empty() => return Ok(()),
            None => {
                self.ensure_pool(pool).await?;
                BTreeSet::new()
            }
        };

        let plan = diff::plan(actual, desired);
        if plan.is_empty() {
            debug!(pool, "Pool members already converged");
            return Ok(());
        }

        let members_url = format!("{}/members", self.pool_url(pool));
        for member in &plan.create {
            self.post_idempotent(
                &members_url,
                &PoolMember {
                    name: member,
                    partition: &self.partition,
                },
            )
            .await?;
            self.pool_members
                .entry(pool.to_string())
                .or_default()
                .insert(member.clone());
            info!(pool, member = %member, "Pool member added");
        }
        for member in &plan.delete {
            self.delete(&format!("{}/{}", members_url, self.id(member)))
                .await?;
            if let Some(members) = self.pool_members.get_mut(pool) {
                members.remove(member);
            }
            info!(pool, member = %member, "Pool member removed");
        }
        Ok(())
    }

    async fn delete_pool(&mut self, pool: &str) -> Result<()> {
        self.delete(&self.pool_url(pool)).await?;
        self.pool_members.remove(pool);
        info!(pool, "Pool deleted");
        Ok(())
    }

    /// Drop the pool once nothing feeds or references it
    async fn delete_pool_if_unused(&mut self, set: &FrontingSet) -> Result<()> {
        if set.endpoints.is_empty() && set.bindings.is_empty() {
            let pool = self.pool_name(set);
            self.delete_pool(&pool).await?;
        }
        Ok(())
    }

    // --- policy rules ---

    fn rule_url(&self, policy: &str, rule: &str) -> String {
        format!("/mgmt/tm/ltm/policy/{}/rules/{}", self.id(policy), rule)
    }

    async fn add_rule(&self, policy: &str, rule: &str, binding: &RouteBinding, pool: &str) -> Result<()> {
        let rules_url = format!("/mgmt/tm/ltm/policy/{}/rules", self.id(policy));
        self.post_unique(&rules_url, &Named { name: rule }, "policy rule", rule)
            .await?;

        if let Err(e) = self.add_rule_details(policy, rule, binding, pool).await {
            warn!(rule, error = %e, "Rule creation failed; removing partial rule");
            if let Err(cleanup) = self.delete(&self.rule_url(policy, rule)).await {
                warn!(rule, error = %cleanup, "Failed to remove partial rule");
            }
            return Err(e);
        }

        info!(policy, rule, host = %binding.host, path = %binding.path, "Policy rule added");
        Ok(())
    }

    async fn add_rule_details(&self, policy: &str, rule: &str, binding: &RouteBinding, pool: &str) -> Result<()> {
        let rule_url = self.rule_url(policy, rule);
        let conditions_url = format!("{}/conditions", rule_url);

        self.post(&conditions_url, &RuleCondition::host(&binding.host))
            .await?;
        for (i, segment) in path_segments(&binding.path).enumerate() {
            self.post(&conditions_url, &RuleCondition::path_segment(i + 1, segment))
                .await?;
        }

        let pool_path = self.path(pool);
        self.post(&format!("{}/actions", rule_url), &ForwardAction::to_pool(&pool_path))
            .await?;
        Ok(())
    }

    /// Remove a rule left over from an earlier run so it can be recreated.
    ///
    /// Returns true when a rule was found and deleted.
    async fn clear_existing_rule(&self, policy: &str, rule: &str) -> Result<bool> {
        if !self.exists(&self.rule_url(policy, rule)).await? {
            return Ok(false);
        }
        info!(policy, rule, "Rule already present; deleting before recreating it");
        self.delete_rule(policy, rule).await?;
        Ok(true)
    }

    async fn delete_rule(&self, policy: &str, rule: &str) -> Result<()> {
        self.delete(&self.rule_url(policy, rule)).await?;
        info!(policy, rule, "Policy rule deleted");
        Ok(())
    }

    // --- TLS objects ---

    async fn install_file(&self, kind: &str, name: &str, contents: &str) -> Result<()> {
        self.transport.upload(name, contents.as_bytes()).await?;
        self.post_unique(
            &format!("/mgmt/tm/sys/crypto/{}", kind),
            &InstallFile {
                command: "install",
                name,
                from_local_file: format!("{}/{}", UPLOAD_DIR, name),
            },
            "certificate file",
            name,
        )
        .await
    }

    async fn attach_profile(&self, vserver: &str, profile: &str, context: &'static str) -> Result<()> {
        self.post_unique(
            &format!("/mgmt/tm/ltm/virtual/{}/profiles", self.id(vserver)),
            &Attachment {
                name: profile,
                partition: &self.partition,
                context: Some(context),
            },
            "virtual server profile",
            profile,
        )
        .await
    }

    async fn add_certificates(&self, vserver: &str, rule: &str, binding: &RouteBinding) -> Result<()> {
        if let Err(e) = self.add_certificates_inner(vserver, rule, binding).await {
            warn!(rule, error = %e, "TLS provisioning failed; removing partial objects");
            if let Err(cleanup) = self.delete_certificates(vserver, rule).await {
                warn!(rule, error = %cleanup, "Failed to remove partial TLS objects");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn add_certificates_inner(&self, vserver: &str, rule: &str, binding: &RouteBinding) -> Result<()> {
        match binding.host_certificate() {
            Some(cert) => {
                let cert_name = cert_name(rule);
                let key_name = key_name(rule);
                let profile = client_ssl_profile_name(rule);

                let mut contents = cert.contents.clone();
                if let Some(ca) = binding.ca_certificate() {
                    contents.push('\n');
                    contents.push_str(&ca.contents);
                }
                self.install_file("cert", &cert_name, &contents).await?;
                let key = cert.private_key.as_deref().unwrap_or_default();
                self.install_file("key", &key_name, key).await?;

                self.post_unique(
                    "/mgmt/tm/ltm/profile/client-ssl",
                    &ClientSslProfile {
                        name: &profile,
                        partition: &self.partition,
                        cert: self.path(&format!("{}.crt", cert_name)),
                        key: self.path(&format!("{}.key", key_name)),
                        chain: None,
                        server_name: &binding.host,
                    },
                    "client-ssl profile",
                    &profile,
                )
                .await?;
                self.attach_profile(vserver, &profile, "clientside").await?;
                info!(rule, host = %binding.host, "Client SSL profile installed");
            }
            None => warn!(rule, host = %binding.host, "No certificate and key for TLS route; using the virtual server default"),
        }

        if let Some(dest) = binding.destination_ca_certificate() {
            let chain = chain_name(rule);
            let profile = server_ssl_profile_name(rule);

            self.install_file("cert", &chain, &dest.contents).await?;
            self.post_unique(
                "/mgmt/tm/ltm/profile/server-ssl",
                &ServerSslProfile {
                    name: &profile,
                    partition: &self.partition,
                    chain: self.path(&format!("{}.crt", chain)),
                    server_name: &binding.host,
                },
                "server-ssl profile",
                &profile,
            )
            .await?;
            self.attach_profile(vserver, &profile, "serverside").await?;
            info!(rule, host = %binding.host, "Server SSL profile installed");
        }

        Ok(())
    }

    async fn delete_certificates(&self, vserver: &str, rule: &str) -> Result<()> {
        let client_profile = client_ssl_profile_name(rule);
        let server_profile = server_ssl_profile_name(rule);
        let profiles_url = format!("/mgmt/tm/ltm/virtual/{}/profiles", self.id(vserver));

        self.delete(&format!("{}/{}", profiles_url, self.id(&client_profile)))
            .await?;
        self.delete(&format!("{}/{}", profiles_url, self.id(&server_profile)))
            .await?;
        self.delete(&format!("/mgmt/tm/ltm/profile/client-ssl/{}", self.id(&client_profile)))
            .await?;
        self.delete(&format!("/mgmt/tm/ltm/profile/server-ssl/{}", self.id(&server_profile)))
            .await?;
        self.delete(&format!(
            "/mgmt/tm/sys/file/ssl-key/{}",
            self.id(&format!("{}.key", key_name(rule)))
        ))
        .await?;
        self.delete(&format!(
            "/mgmt/tm/sys/file/ssl-cert/{}",
            self.id(&format!("{}.crt", cert_name(rule)))
        ))
        .await?;
        self.delete(&format!(
            "/mgmt/tm/sys/file/ssl-cert/{}",
            self.id(&format!("{}.crt", chain_name(rule)))
        ))
        .await?;
        debug!(rule, "TLS objects deleted");
        Ok(())
    }

    // --- passthrough datagroups ---

    async fn datagroup_records(&self, name: &str) -> Result<Vec<DatagroupRecord>> {
        let url = format!("/mgmt/tm/ltm/data-group/internal/{}", self.id(name));
        let records: DatagroupRecords = self.get_as(&url).await?;
        Ok(records.records)
    }

    async fn passthrough_routes(&mut self) -> Result<&mut BTreeMap<String, PassthroughRoute>> {
        if self.passthrough_routes.is_none() {
            let hosts: HashMap<String, String> = self
                .datagroup_records(PASSTHROUGH_HOSTS_DATAGROUP)
                .await?
                .into_iter()
                .map(|r| (r.name, r.data))
                .collect();

            let mut routes = BTreeMap::new();
            for record in self.datagroup_records(PASSTHROUGH_ROUTES_DATAGROUP).await? {
                match hosts.get(&record.data) {
                    Some(pool) => {
                        routes.insert(
                            record.name,
                            PassthroughRoute {
                                host: record.data,
                                pool: pool.clone(),
                            },
                        );
                    }
                    None => warn!(
                        rule = %record.name,
                        host = %record.data,
                        "Passthrough route has no hostname entry; ignoring"
                    ),
                }
            }
            debug!(count = routes.len(), "Passthrough routes loaded");
            self.passthrough_routes = Some(routes);
        }
        Ok(self.passthrough_routes.get_or_insert_with(BTreeMap::new))
    }

    async fn write_passthrough_routes(&self) -> Result<()> {
        let routes = match &self.passthrough_routes {
            Some(routes) => routes,
            None => return Ok(()),
        };

        let route_records = DatagroupRecords {
            records: routes
                .iter()
                .map(|(rule, r)| DatagroupRecord {
                    name: rule.clone(),
                    data: r.host.clone(),
                })
                .collect(),
        };
        // The iRule looks up by hostname, so each host gets one record
        let mut hosts: BTreeMap<&str, (&str, &str)> = BTreeMap::new();
        for (rule, r) in routes {
            if let Some((first, pool)) = hosts.get(r.host.as_str()) {
                warn!(
                    host = %r.host,
                    rule = %rule,
                    kept = %first,
                    pool = %pool,
                    "Passthrough host already routed by another rule; keeping the first"
                );
                continue;
            }
            hosts.insert(r.host.as_str(), (rule.as_str(), r.pool.as_str()));
        }
        let host_records = DatagroupRecords {
            records: hosts
                .into_iter()
                .map(|(host, (_, pool))| DatagroupRecord {
                    name: host.to_string(),
                    data: pool.to_string(),
                })
                .collect(),
        };

        self.patch(
            &format!("/mgmt/tm/ltm/data-group/internal/{}", self.id(PASSTHROUGH_HOSTS_DATAGROUP)),
            &host_records,
        )
        .await?;
        self.patch(
            &format!("/mgmt/tm/ltm/data-group/internal/{}", self.id(PASSTHROUGH_ROUTES_DATAGROUP)),
            &route_records,
        )
        .await
    }

    async fn add_passthrough_route(&mut self, rule: &str, host: &str, pool: &str) -> Result<()> {
        let route = PassthroughRoute {
            host: host.to_string(),
            pool: self.path(pool),
        };
        let routes = self.passthrough_routes().await?;
        if routes.get(rule) == Some(&route) {
            debug!(rule, host, "Passthrough route already present");
            return Ok(());
        }
        routes.insert(rule.to_string(), route);
        self.save_passthrough_routes().await?;
        info!(rule, host, pool, "Passthrough route added");
        Ok(())
    }

    async fn delete_passthrough_route(&mut self, rule: &str) -> Result<()> {
        if self.passthrough_routes().await?.remove(rule).is_none() {
            debug!(rule, "Passthrough route already absent");
            return Ok(());
        }
        self.save_passthrough_routes().await?;
        info!(rule, "Passthrough route deleted");
        Ok(())
    }

    /// Write the datagroups; on failure the cache is dropped and reloaded next time
    async fn save_passthrough_routes(&mut self) -> Result<()> {
        let result = self.write_passthrough_routes().await;
        if result.is_err() {
            self.passthrough_routes = None;
        }
        result
    }
}

#[async_trait]
impl Backend for ApplianceBackend {
    fn name(&self) -> &'static str {
        "appliance"
    }

    async fn initialize(&mut self) -> Result<RoutingTable> {
        self.ensure_partition_path().await?;
        self.ensure_policy(INSECURE_POLICY).await?;
        self.ensure_policy(SECURE_POLICY).await?;
        if let Some(vserver) = self.http_vserver.clone() {
            self.ensure_policy_attached(&vserver, INSECURE_POLICY)
                .await?;
        }
        if let Some(vserver) = self.https_vserver.clone() {
            self.ensure_policy_attached(&vserver, SECURE_POLICY)
                .await?;
        }

        self.ensure_datagroup(PASSTHROUGH_ROUTES_DATAGROUP).await?;
        self.ensure_datagroup(PASSTHROUGH_HOSTS_DATAGROUP).await?;
        self.ensure_irule().await?;
        if let Some(vserver) = self.https_vserver.clone() {
            self.ensure_irule_attached(&vserver).await?;
        }

        info!(partition = %self.partition, "Appliance bootstrap complete");
        Ok(RoutingTable::new())
    }

    async fn create_frontend(&mut self, set: &FrontingSet) -> Result<()> {
        let pool = self.pool_name(set);
        self.ensure_pool(&pool).await
    }

    async fn delete_frontend(&mut self, set: &FrontingSet) -> Result<()> {
        let pool = self.pool_name(set);
        self.reconcile_members(&pool, Vec::new()).await?;
        self.delete_pool(&pool).await
    }

    async fn sync_endpoints(&mut self, set: &FrontingSet) -> Result<()> {
        let pool = self.pool_name(set);
        let desired: Vec<String> = set.endpoints.values().map(member_name).collect();
        self.reconcile_members(&pool, desired).await?;
        self.delete_pool_if_unused(set).await
    }

    async fn add_route(&mut self, set: &FrontingSet, binding: &RouteBinding) -> Result<()> {
        let pool = self.pool_name(set);
        let rule = rule_name(&binding.route);

        match binding.termination {
            Termination::None => {
                if self.http_vserver.is_none() {
                    warn!(rule, "Skipping plain route: no HTTP virtual server configured");
                    return Ok(());
                }
                self.clear_existing_rule(INSECURE_POLICY, &rule).await?;
                self.add_rule(INSECURE_POLICY, &rule, binding, &pool).await
            }
            Termination::Edge | Termination::Reencrypt => {
                let Some(vserver) = self.https_vserver.clone() else {
                    warn!(rule, "Skipping TLS route: no HTTPS virtual server configured");
                    return Ok(());
                };
                if self.clear_existing_rule(SECURE_POLICY, &rule).await? {
                    self.delete_certificates(&vserver, &rule).await?;
                }
                self.add_rule(SECURE_POLICY, &rule, binding, &pool).await?;
                if let Err(e) = self.add_certificates(&vserver, &rule, binding).await {
                    if let Err(cleanup) = self.delete_rule(SECURE_POLICY, &rule).await {
                        warn!(rule, error = %cleanup, "Failed to remove rule after TLS failure");
                    }
                    return Err(e);
                }
                Ok(())
            }
            Termination::Passthrough => {
                if self.https_vserver.is_none() {
                    warn!(rule, "Skipping passthrough route: no HTTPS virtual server configured");
                    return Ok(());
                }
                self.add_passthrough_route(&rule, &binding.host, &pool)
                    .await
            }
        }
    }

    async fn remove_route(&mut self, set: &FrontingSet, binding: &RouteBinding) -> Result<()> {
        let rule = rule_name(&binding.route);

        match binding.termination {
            Termination::None => {
                if self.http_vserver.is_some() {
                    self.delete_rule(INSECURE_POLICY, &rule).await?;
                }
            }
            Termination::Edge | Termination::Reencrypt => {
                if let Some(vserver) = self.https_vserver.clone() {
                    self.delete_rule(SECURE_POLICY, &rule).await?;
                    self.delete_certificates(&vserver, &rule).await?;
                }
            }
            Termination::Passthrough => {
                if self.https_vserver.is_some() {
                    self.delete_passthrough_route(&rule).await?;
                }
            }
        }

        self.delete_pool_if_unused(set).await
    }

    async fn commit(&mut self, _table: &RoutingTable) -> Result<()> {
        debug!("Appliance changes are applied per operation; nothing to commit");
        Ok(())
    }
}

/// Non-empty segments of a route path
fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_segments() {
        assert_eq!(path_segments("").count(), 0);
        assert_eq!(path_segments("/").count(), 0);
        assert_eq!(path_segments("/foo//bar/").collect::<Vec<_>>(), vec!["foo", "bar"]);
    }

    #[test]
    fn test_irule_references_hosts_datagroup() {
        assert!(PASSTHROUGH_IRULE_CODE.contains(PASSTHROUGH_HOSTS_DATAGROUP));
        assert!(PASSTHROUGH_IRULE_CODE.contains("when CLIENT_DATA"));
    }
}
