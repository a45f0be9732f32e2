//! JSON bodies exchanged with the management API.

use serde::{Deserialize, Serialize};

/// Collection response: `{"items": [...]}`
#[derive(Debug, Deserialize)]
pub struct ItemList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct NamedItem {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct Folder<'a> {
    pub name: &'a str,
}

#[derive(Debug, Serialize)]
pub struct Policy<'a> {
    pub name: &'a str,
    pub partition: &'a str,
    pub controls: [&'static str; 1],
    pub requires: [&'static str; 1],
    pub strategy: &'static str,
}

impl<'a> Policy<'a> {
    pub fn forwarding(name: &'a str, partition: &'a str) -> Self {
        Self {
            name,
            partition,
            controls: ["forwarding"],
            requires: ["http"],
            strategy: "best-match",
        }
    }
}

/// Object referenced from a virtual server (policy or profile)
#[derive(Debug, Serialize)]
pub struct Attachment<'a> {
    pub name: &'a str,
    pub partition: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct Named<'a> {
    pub name: &'a str,
}

/// Match condition of a policy rule, on the host or on one path segment
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition<'a> {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_insensitive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_host: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_uri: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_segment: Option<bool>,
    pub index: usize,
    pub equals: bool,
    pub request: bool,
    pub values: [&'a str; 1],
}

impl<'a> RuleCondition<'a> {
    pub fn host(host: &'a str) -> Self {
        Self {
            name: "0".to_string(),
            case_insensitive: Some(true),
            http_host: Some(true),
            host: Some(true),
            http_uri: None,
            path_segment: None,
            index: 0,
            equals: true,
            request: true,
            values: [host],
        }
    }

    /// Condition on the `position`-th path segment (1-based)
    pub fn path_segment(position: usize, segment: &'a str) -> Self {
        Self {
            name: position.to_string(),
            case_insensitive: None,
            http_host: None,
            host: None,
            http_uri: Some(true),
            path_segment: Some(true),
            index: position,
            equals: true,
            request: true,
            values: [segment],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ForwardAction<'a> {
    pub name: &'static str,
    pub forward: bool,
    pub pool: &'a str,
    pub request: bool,
    pub select: bool,
}

impl<'a> ForwardAction<'a> {
    pub fn to_pool(pool: &'a str) -> Self {
        Self {
            name: "0",
            forward: true,
            pool,
            request: true,
            select: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Datagroup<'a> {
    pub name: &'a str,
    pub partition: &'a str,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatagroupRecord {
    pub name: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatagroupRecords {
    #[serde(default)]
    pub records: Vec<DatagroupRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IRule<'a> {
    pub name: &'a str,
    pub partition: &'a str,
    pub api_anonymous: &'a str,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VirtualServerRules {
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct Pool<'a> {
    pub name: &'a str,
    pub partition: &'a str,
    pub mode: &'static str,
    pub monitor: &'static str,
}

#[derive(Debug, Serialize)]
pub struct PoolMember<'a> {
    pub name: &'a str,
    pub partition: &'a str,
}

#[derive(Debug, Serialize)]
pub struct InstallFile<'a> {
    pub command: &'static str,
    pub name: &'a str,
    #[serde(rename = "from-local-file")]
    pub from_local_file: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSslProfile<'a> {
    pub name: &'a str,
    pub partition: &'a str,
    pub cert: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    pub server_name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSslProfile<'a> {
    pub name: &'a str,
    pub partition: &'a str,
    pub chain: String,
    pub server_name: &'a str,
}
