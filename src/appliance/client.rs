//! Transport to the appliance management REST API.

use crate::config::ApplianceConfig;
use crate::error::ApplianceError;
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::Client;
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

/// Directory where uploaded files land on the appliance
pub const UPLOAD_DIR: &str = "/var/config/rest/downloads";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Patch,
    Delete,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Verb> for reqwest::Method {
    fn from(verb: Verb) -> Self {
        match verb {
            Verb::Get => reqwest::Method::GET,
            Verb::Post => reqwest::Method::POST,
            Verb::Patch => reqwest::Method::PATCH,
            Verb::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A request/response channel to the management API.
///
/// Paths are absolute (`/mgmt/tm/...`). Successful responses decode to JSON,
/// with an empty body mapping to `Value::Null`. Non-2xx responses become an
/// [`ApplianceError`] carrying the status code.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, verb: Verb, path: &str, body: Option<Value>) -> Result<Value, ApplianceError>;

    /// Upload a file into [`UPLOAD_DIR`] under `name`
    async fn upload(&self, name: &str, contents: &[u8]) -> Result<(), ApplianceError>;
}

/// Transport over HTTPS with basic authentication
pub struct HttpTransport {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpTransport {
    pub fn new(config: &ApplianceConfig) -> Result<Self, ApplianceError> {
        if config.insecure {
            warn!(host = %config.host, "Certificate verification of the appliance is disabled");
        }

        let client = Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| ApplianceError::new("BUILD", config.base_url(), None, e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn finish(&self, verb: Verb, url: &str, response: reqwest::Response) -> Result<Value, ApplianceError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApplianceError::new(verb.as_str(), url, Some(status.as_u16()), e.to_string()))?;

        if !status.is_success() {
            return Err(ApplianceError::new(
                verb.as_str(),
                url,
                Some(status.as_u16()),
                error_message(&text),
            ));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ApplianceError::new(verb.as_str(), url, Some(status.as_u16()), format!("invalid JSON: {}", e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, verb: Verb, path: &str, body: Option<Value>) -> Result<Value, ApplianceError> {
        let url = self.url(path);
        debug!(%verb, %url, "Appliance request");

        let mut builder = self
            .client
            .request(verb.into(), &url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = &body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApplianceError::new(verb.as_str(), &url, None, e.to_string()))?;
        self.finish(verb, &url, response).await
    }

    async fn upload(&self, name: &str, contents: &[u8]) -> Result<(), ApplianceError> {
        let url = self.url(&format!("/mgmt/shared/file-transfer/uploads/{}", name));
        debug!(%url, bytes = contents.len(), "Appliance file upload");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))
            .header("Content-Range", content_range(contents.len()))
            .body(contents.to_vec())
            .send()
            .await
            .map_err(|e| ApplianceError::new("POST", &url, None, e.to_string()))?;
        self.finish(Verb::Post, &url, response).await.map(|_| ())
    }
}

fn content_range(len: usize) -> String {
    format!("0-{}/{}", len.saturating_sub(1), len)
}

/// Pull `message` out of an error body, falling back to the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
