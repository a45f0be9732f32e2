//! In-memory stand-in for the appliance management API

#![allow(dead_code)]

use async_trait::async_trait;
use routegate::appliance::client::{Transport, Verb};
use routegate::config::ApplianceConfig;
use routegate::error::ApplianceError;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub const HTTP_VSERVER: &str = "http-vs";
pub const HTTPS_VSERVER: &str = "https-vs";

/// Everything stored on the fake appliance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplianceState {
    pub objects: BTreeMap<String, Value>,
    pub uploads: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    state: ApplianceState,
    requests: Vec<String>,
    failures: Vec<(Verb, String)>,
}

/// Objects are stored by URI path. POST to a collection stores the body
/// under `<collection>/<id>`, where the id is derived from `name` and
/// `partition` the way the real API does.
#[derive(Clone, Default)]
pub struct FakeAppliance {
    inner: Arc<Mutex<Inner>>,
}

impl FakeAppliance {
    /// Appliance with the `/Common` folder and both virtual servers
    pub fn new() -> Self {
        let fake = Self::default();
        fake.insert("/mgmt/tm/sys/folder/~Common", json!({"name": "/Common"}));
        for vs in [HTTP_VSERVER, HTTPS_VSERVER] {
            fake.insert(
                &format!("/mgmt/tm/ltm/virtual/~Common~{}", vs),
                json!({"name": vs, "partition": "/Common"}),
            );
        }
        fake
    }

    pub fn config() -> ApplianceConfig {
        ApplianceConfig {
            host: "lb.test".to_string(),
            username: "admin".to_string(),
            password: "pw".to_string(),
            http_vserver: Some(HTTP_VSERVER.to_string()),
            https_vserver: Some(HTTPS_VSERVER.to_string()),
            ..Default::default()
        }
    }

    pub fn insert(&self, path: &str, value: Value) {
        self.inner
            .lock()
            .unwrap()
            .state
            .objects
            .insert(path.to_string(), value);
    }

    pub fn state(&self) -> ApplianceState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn object(&self, path: &str) -> Option<Value> {
        self.inner.lock().unwrap().state.objects.get(path).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.object(path).is_some()
    }

    /// Ids of the direct children of a collection
    pub fn children(&self, collection: &str) -> Vec<String> {
        let prefix = format!("{}/", collection);
        self.inner
            .lock()
            .unwrap()
            .state
            .objects
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    pub fn requests(&self) -> Vec<String> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.inner.lock().unwrap().requests.clear();
    }

    /// Answer 500 to every `verb` request whose path contains `fragment`
    pub fn fail(&self, verb: Verb, fragment: &str) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .push((verb, fragment.to_string()));
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().failures.clear();
    }

    /// Records of an internal datagroup as (name, data) pairs
    pub fn datagroup(&self, name: &str) -> Vec<(String, String)> {
        self.object(&format!("/mgmt/tm/ltm/data-group/internal/~Common~{}", name))
            .and_then(|dg| dg.get("records").cloned())
            .and_then(|r| r.as_array().cloned())
            .unwrap_or_default()
            .into_iter()
            .map(|r| {
                (
                    r["name"].as_str().unwrap_or_default().to_string(),
                    r["data"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    fn handle(&self, verb: Verb, path: &str, body: Option<Value>) -> Result<Value, ApplianceError> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.requests.push(format!("{} {}", verb, path));

        let err = |status: u16, message: &str| ApplianceError::new(verb.as_str(), path, Some(status), message);

        if inner
            .failures
            .iter()
            .any(|(v, fragment)| *v == verb && path.contains(fragment.as_str()))
        {
            return Err(err(500, "injected failure"));
        }

        let objects = &mut inner.state.objects;
        match verb {
            Verb::Get => {
                if let Some(value) = objects.get(path) {
                    return Ok(value.clone());
                }
                let prefix = format!("{}/", path);
                let items: Vec<Value> = objects
                    .iter()
                    .filter(|(k, _)| k.strip_prefix(&prefix).is_some_and(|rest| !rest.contains('/')))
                    .map(|(_, v)| v.clone())
                    .collect();
                let parent_exists = path
                    .rsplit_once('/')
                    .is_some_and(|(parent, _)| objects.contains_key(parent));
                if items.is_empty() && !parent_exists {
                    return Err(err(404, "Object not found"));
                }
                Ok(json!({ "items": items }))
            }
            Verb::Post => {
                let body = body.ok_or_else(|| err(400, "missing body"))?;
                let key = if body.get("command").and_then(Value::as_str) == Some("install") {
                    let name = body["name"].as_str().unwrap_or_default();
                    let local = body["from-local-file"].as_str().unwrap_or_default();
                    let file = local.rsplit('/').next().unwrap_or_default();
                    if !inner.state.uploads.contains_key(file) {
                        return Err(err(400, "uploaded file not found"));
                    }
                    if path.ends_with("/key") {
                        format!("/mgmt/tm/sys/file/ssl-key/~Common~{}.key", name)
                    } else {
                        format!("/mgmt/tm/sys/file/ssl-cert/~Common~{}.crt", name)
                    }
                } else {
                    format!("{}/{}", path, object_id(&body))
                };

                if objects.contains_key(&key) {
                    return Err(err(409, "The requested object already exists"));
                }
                objects.insert(key, body.clone());
                Ok(body)
            }
            Verb::Patch => {
                let body = body.ok_or_else(|| err(400, "missing body"))?;
                let Some(existing) = objects.get_mut(path) else {
                    return Err(err(404, "Object not found"));
                };
                if let (Some(target), Some(fields)) = (existing.as_object_mut(), body.as_object()) {
                    for (k, v) in fields {
                        target.insert(k.clone(), v.clone());
                    }
                }
                Ok(existing.clone())
            }
            Verb::Delete => {
                if objects.remove(path).is_none() {
                    return Err(err(404, "Object not found"));
                }
                let prefix = format!("{}/", path);
                objects.retain(|k, _| !k.starts_with(&prefix));
                Ok(Value::Null)
            }
        }
    }
}

fn object_id(body: &Value) -> String {
    let name = body["name"].as_str().unwrap_or_default();
    match body.get("partition").and_then(Value::as_str) {
        Some(partition) => format!("{}/{}", partition, name).replace('/', "~"),
        None if name.starts_with('/') => name.replace('/', "~"),
        None => name.to_string(),
    }
}

#[async_trait]
impl Transport for FakeAppliance {
    async fn request(&self, verb: Verb, path: &str, body: Option<Value>) -> Result<Value, ApplianceError> {
        self.handle(verb, path, body)
    }

    async fn upload(&self, name: &str, contents: &[u8]) -> Result<(), ApplianceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.requests.push(format!("UPLOAD {}", name));
        inner.state.uploads.insert(name.to_string(), contents.to_vec());
        Ok(())
    }
}
