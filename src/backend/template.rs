//! Template backend: renders the routing table into a proxy's config files.
//!
//! A commit materializes certificates, persists the table to `routes.json`,
//! renders every configured template and replaces its output atomically, then
//! runs the reload script. The first failing step aborts the commit. A failed
//! reload leaves the freshly written config in place.
//!
//! File writes use blocking `std::fs` calls on the dispatcher task. Events are
//! handled one at a time on that task, and nothing else runs on it while a
//! commit is in progress. The admin server runs on other tasks.

use super::Backend;
use crate::certs::{write_atomic, CertificateMaterializer};
use crate::config::TemplateConfig;
use crate::error::{Result, RouterError};
use crate::model::{Endpoint, FrontingSet, RouteBinding, RouteId, Termination};
use crate::table::RoutingTable;
use async_trait::async_trait;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Snapshot file name inside the working directory
pub const SNAPSHOT_FILE: &str = "routes.json";

struct TemplateSource {
    name: String,
    source: String,
    output: PathBuf,
}

pub struct TemplateBackend {
    working_dir: PathBuf,
    materializer: CertificateMaterializer,
    env: Environment<'static>,
    templates: Vec<TemplateSource>,
    reload_script: Option<PathBuf>,
    default_certificate_source: Option<PathBuf>,
    default_certificate: Option<PathBuf>,
    default_destination_ca: Option<PathBuf>,
    stats: Stats,
}

#[derive(Debug, Clone, Serialize)]
struct Stats {
    user: Option<String>,
    password: Option<String>,
    port: u16,
}

#[derive(Serialize)]
struct TemplateData<'a> {
    working_dir: &'a Path,
    frontends: Vec<FrontendView<'a>>,
    default_certificate: Option<&'a Path>,
    default_destination_ca: Option<&'a Path>,
    stats: &'a Stats,
}

#[derive(Serialize)]
struct FrontendView<'a> {
    name: &'a str,
    hostname: String,
    endpoints: Vec<&'a Endpoint>,
    bindings: Vec<BindingView<'a>>,
}

#[derive(Serialize)]
struct BindingView<'a> {
    route: &'a RouteId,
    routing_key: String,
    host: &'a str,
    path: &'a str,
    termination: Termination,
    cert_path: Option<PathBuf>,
    destination_ca_path: Option<PathBuf>,
}

impl TemplateBackend {
    /// Build the backend, reading every template source up front
    pub fn new(config: &TemplateConfig) -> Result<Self> {
        let materializer = CertificateMaterializer::new(&config.dir);

        let mut templates = Vec::with_capacity(config.templates.len());
        for t in &config.templates {
            let source = std::fs::read_to_string(&t.source).map_err(|e| RouterError::io(&t.source, e))?;
            let name = t
                .source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| t.source.display().to_string());
            templates.push(TemplateSource {
                name,
                source,
                output: t.output.clone(),
            });
        }

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_function("route_regexp", route_regexp_fn);
        let cert_dir = materializer.cert_dir().to_path_buf();
        env.add_function("cert_path", move |host: String| -> String {
            cert_dir.join(format!("{}.pem", host)).display().to_string()
        });

        Ok(Self {
            working_dir: config.dir.clone(),
            materializer,
            env,
            templates,
            reload_script: config.reload_script.clone(),
            default_certificate_source: config.default_certificate.clone(),
            default_certificate: None,
            default_destination_ca: config.default_destination_ca.clone(),
            stats: Stats {
                user: config.stats_user.clone(),
                password: config.stats_password.clone(),
                port: config.stats_port,
            },
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.working_dir.join(SNAPSHOT_FILE)
    }

    fn read_snapshot(&self) -> RoutingTable {
        let path = self.snapshot_path();
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No routing snapshot found, starting empty");
                return RoutingTable::new();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read routing snapshot, starting empty");
                return RoutingTable::new();
            }
        };

        match RoutingTable::from_snapshot(&data) {
            Ok(table) => {
                info!(path = %path.display(), fronting_sets = table.len(), "Routing snapshot loaded");
                table
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Routing snapshot is unreadable, starting empty");
                RoutingTable::new()
            }
        }
    }

    fn write_certificates(&self, table: &RoutingTable) -> Result<()> {
        self.materializer.ensure_dirs()?;
        for (_, binding) in table.bindings() {
            self.materializer.materialize(binding)?;
        }
        Ok(())
    }

    fn write_snapshot(&self, table: &RoutingTable) -> Result<()> {
        let snapshot = table.to_snapshot()?;
        write_atomic(&self.snapshot_path(), snapshot.as_bytes(), false)
    }

    fn write_templates(&self, table: &RoutingTable) -> Result<()> {
        let data = self.template_data(table);
        for t in &self.templates {
            let rendered = self
                .env
                .render_named_str(&t.name, &t.source, &data)
                .map_err(|source| RouterError::Template {
                    name: t.name.clone(),
                    source,
                })?;
            write_atomic(&t.output, rendered.as_bytes(), false)?;
            debug!(template = %t.name, output = %t.output.display(), "Template rendered");
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let Some(script) = &self.reload_script else {
            debug!("No reload script configured");
            return Ok(());
        };

        let output = Command::new(script)
            .output()
            .await
            .map_err(|e| RouterError::io(script, e))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(RouterError::Reload {
                status: output.status.to_string(),
                output: combined,
            });
        }

        info!(script = %script.display(), output = %combined.trim_end(), "Router reloaded");
        Ok(())
    }

    fn template_data<'a>(&'a self, table: &'a RoutingTable) -> TemplateData<'a> {
        let frontends = table
            .fronting_sets()
            .map(|set| FrontendView {
                name: &set.name,
                hostname: set.hostname(),
                endpoints: set.endpoints.values().collect(),
                bindings: set
                    .bindings
                    .values()
                    .map(|b| BindingView {
                        route: &b.route,
                        routing_key: b.routing_key(),
                        host: &b.host,
                        path: &b.path,
                        termination: b.termination,
                        cert_path: b
                            .host_certificate()
                            .map(|_| self.materializer.cert_path(&b.host)),
                        destination_ca_path: b
                            .destination_ca_certificate()
                            .map(|_| self.materializer.destination_ca_path(&b.host)),
                    })
                    .collect(),
            })
            .collect();

        TemplateData {
            working_dir: &self.working_dir,
            frontends,
            default_certificate: self.default_certificate.as_deref(),
            default_destination_ca: self.default_destination_ca.as_deref(),
            stats: &self.stats,
        }
    }
}

#[async_trait]
impl Backend for TemplateBackend {
    fn name(&self) -> &'static str {
        "template"
    }

    async fn initialize(&mut self) -> Result<RoutingTable> {
        std::fs::create_dir_all(&self.working_dir).map_err(|e| RouterError::io(&self.working_dir, e))?;
        self.materializer.ensure_dirs()?;

        if let Some(source) = &self.default_certificate_source {
            let contents = std::fs::read(source).map_err(|e| RouterError::io(source, e))?;
            self.default_certificate = Some(self.materializer.write_default_certificate(&contents)?);
        }

        Ok(self.read_snapshot())
    }

    async fn create_frontend(&mut self, _set: &FrontingSet) -> Result<()> {
        Ok(())
    }

    async fn delete_frontend(&mut self, _set: &FrontingSet) -> Result<()> {
        Ok(())
    }

    async fn sync_endpoints(&mut self, _set: &FrontingSet) -> Result<()> {
        Ok(())
    }

    async fn add_route(&mut self, _set: &FrontingSet, _binding: &RouteBinding) -> Result<()> {
        Ok(())
    }

    async fn remove_route(&mut self, _set: &FrontingSet, binding: &RouteBinding) -> Result<()> {
        self.materializer.remove(binding);
        Ok(())
    }

    async fn commit(&mut self, table: &RoutingTable) -> Result<()> {
        self.write_certificates(table)?;
        self.write_snapshot(table)?;
        self.write_templates(table)?;
        self.reload().await
    }
}

/// Anchored regexp matching a host, an optional port, and the path with its subpaths
pub fn route_regexp(host: &str, path: &str) -> String {
    let host_re = regex::escape(host);
    let (path_re, subpath_re) = if path.trim_end_matches('/').is_empty() {
        (String::new(), "(/.*)?")
    } else if path.ends_with('/') {
        (regex::escape(path), "(.*)?")
    } else {
        (regex::escape(path), "(/.*)?")
    };
    format!("^{}(:[0-9]+)?{}{}$", host_re, path_re, subpath_re)
}

fn route_regexp_fn(host: String, path: Option<String>) -> String {
    route_regexp(&host, path.as_deref().unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplateFile;
    use crate::model::{Route, TlsConfig};
    use std::net::IpAddr;
    use tempfile::TempDir;

    const TEMPLATE: &str = "\
{% for fe in frontends %}backend {{ fe.name }}
{% for ep in fe.endpoints %}  server {{ ep.id }}
{% endfor %}{% for b in fe.bindings %}  acl {{ route_regexp(b.host, b.path) }}{% if b.cert_path %} crt {{ b.cert_path }}{% endif %}
{% endfor %}{% endfor %}";

    fn backend(dir: &Path, reload: Option<PathBuf>) -> TemplateBackend {
        let source = dir.join("proxy.cfg.j2");
        std::fs::write(&source, TEMPLATE).unwrap();
        let config = TemplateConfig {
            dir: dir.join("work"),
            reload_script: reload,
            templates: vec![TemplateFile {
                source,
                output: dir.join("proxy.cfg"),
            }],
            ..Default::default()
        };
        TemplateBackend::new(&config).unwrap()
    }

    fn table() -> RoutingTable {
        let mut table = RoutingTable::new();
        table.add_endpoints(
            "ns/svc",
            vec![Endpoint::new("10.0.0.1".parse::<IpAddr>().unwrap(), 8080)],
        );
        table.add_route_binding(
            "ns/svc",
            RouteBinding::from_route(&Route {
                namespace: "ns".to_string(),
                name: "web".to_string(),
                host: "www.example.com".to_string(),
                path: String::new(),
                service: "svc".to_string(),
                tls: Some(TlsConfig {
                    termination: Termination::Edge,
                    certificate: Some("CERT".to_string()),
                    key: Some("KEY".to_string()),
                    ..Default::default()
                }),
            }),
        );
        table
    }

    #[test]
    fn test_route_regexp_shapes() {
        assert_eq!(route_regexp("www.example.com", ""), r"^www\.example\.com(:[0-9]+)?(/.*)?$");
        assert_eq!(route_regexp("a.com", "/"), r"^a\.com(:[0-9]+)?(/.*)?$");
        assert_eq!(route_regexp("a.com", "/api/"), r"^a\.com(:[0-9]+)?/api/(.*)?$");
        assert_eq!(route_regexp("a.com", "/api"), r"^a\.com(:[0-9]+)?/api(/.*)?$");
    }

    #[test]
    fn test_route_regexp_matches() {
        let re = regex::Regex::new(&route_regexp("a.com", "/api")).unwrap();
        assert!(re.is_match("a.com/api"));
        assert!(re.is_match("a.com:8080/api/v1"));
        assert!(!re.is_match("a.com/apiv1"));
        assert!(!re.is_match("b.a.com/api"));
    }

    #[tokio::test]
    async fn test_missing_snapshot_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let mut b = backend(tmp.path(), None);
        assert!(b.initialize().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let mut b = backend(tmp.path(), None);
        std::fs::create_dir_all(tmp.path().join("work")).unwrap();
        std::fs::write(b.snapshot_path(), "{not json").unwrap();
        assert!(b.initialize().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_writes_snapshot_config_and_certs() {
        let tmp = TempDir::new().unwrap();
        let mut b = backend(tmp.path(), None);
        b.initialize().await.unwrap();

        let t = table();
        b.commit(&t).await.unwrap();

        let rendered = std::fs::read_to_string(tmp.path().join("proxy.cfg")).unwrap();
        let cert_path = tmp.path().join("work/certs/www.example.com.pem");
        assert!(rendered.contains("backend ns/svc"));
        assert!(rendered.contains("server 10.0.0.1:8080"));
        assert!(rendered.contains(&format!(
            r"acl ^www\.example\.com(:[0-9]+)?(/.*)?$ crt {}",
            cert_path.display()
        )));
        assert_eq!(std::fs::read_to_string(&cert_path).unwrap(), "KEY\nCERT");

        let restored = b.initialize().await.unwrap();
        assert_eq!(restored, t);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reload_failure_keeps_new_config() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("reload.sh");
        std::fs::write(&script, "#!/bin/sh\necho checking config\necho broken >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut b = backend(tmp.path(), Some(script));
        b.initialize().await.unwrap();
        let err = b.commit(&table()).await.unwrap_err();

        match err {
            RouterError::Reload { output, .. } => {
                assert!(output.contains("checking config"));
                assert!(output.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(tmp.path().join("proxy.cfg").exists());
    }

    #[tokio::test]
    async fn test_template_error_aborts_commit() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("bad.j2");
        std::fs::write(&source, "{{ no_such_variable }}").unwrap();
        let config = TemplateConfig {
            dir: tmp.path().join("work"),
            templates: vec![TemplateFile {
                source,
                output: tmp.path().join("bad.cfg"),
            }],
            ..Default::default()
        };
        let mut b = TemplateBackend::new(&config).unwrap();
        b.initialize().await.unwrap();

        let err = b.commit(&table()).await.unwrap_err();
        assert!(matches!(err, RouterError::Template { .. }));
        assert!(!tmp.path().join("bad.cfg").exists());
        assert!(b.snapshot_path().exists());
    }
}
