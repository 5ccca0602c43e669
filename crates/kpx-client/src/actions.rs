//! Typed requests and responses for proxy actions.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Accept `true`, `"true"` and friends; the proxy is not consistent.
fn loose_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .map(kpx_common::protocol::is_truthy)
        .unwrap_or(false))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetLoginsRequest {
    pub url: String,
    pub submit_url: Option<String>,
    /// Include entries restricted to HTTP basic auth.
    pub http_auth: bool,
}

impl GetLoginsRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub(crate) fn into_fields(self, keys: Vec<ConnectionKey>) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("url".into(), Value::from(self.url.clone()));
        fields.insert(
            "submitUrl".into(),
            Value::from(self.submit_url.unwrap_or(self.url)),
        );
        fields.insert("httpAuth".into(), Value::from(self.http_auth));
        fields.insert("keys".into(), keys_value(keys));
        fields
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginEntry {
    pub login: String,
    pub name: String,
    pub password: String,
    pub uuid: String,
    pub group: Option<String>,
    pub totp: Option<String>,
    #[serde(deserialize_with = "loose_bool")]
    pub expired: bool,
    #[serde(deserialize_with = "loose_bool")]
    pub skip_auto_submit: bool,
    pub string_fields: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetLoginRequest {
    pub url: String,
    pub submit_url: Option<String>,
    /// Association name; the dispatcher fills in the current one when empty.
    pub id: Option<String>,
    pub login: String,
    pub password: String,
    pub group: Option<String>,
    pub group_uuid: Option<String>,
    /// Entry to update. `None` creates a new entry.
    pub uuid: Option<String>,
}

impl SetLoginRequest {
    pub(crate) fn into_fields(self, id: String) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("url".into(), Value::from(self.url.clone()));
        fields.insert(
            "submitUrl".into(),
            Value::from(self.submit_url.unwrap_or(self.url)),
        );
        fields.insert("id".into(), Value::from(id));
        fields.insert("login".into(), Value::from(self.login));
        fields.insert("password".into(), Value::from(self.password));
        fields.insert("group".into(), Value::from(self.group.unwrap_or_default()));
        fields.insert(
            "groupUuid".into(),
            Value::from(self.group_uuid.unwrap_or_default()),
        );
        if let Some(uuid) = self.uuid {
            fields.insert("uuid".into(), Value::from(uuid));
        }
        fields
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    pub name: String,
    pub uuid: String,
    pub children: Vec<Group>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseGroups {
    pub groups: Vec<Group>,
}

impl DatabaseGroups {
    /// Map every group path (`Root/Parent/Child`) to its uuid.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        fn walk(prefix: &str, groups: &[Group], out: &mut BTreeMap<String, String>) {
            for group in groups {
                let path = if prefix.is_empty() {
                    group.name.clone()
                } else {
                    format!("{}/{}", prefix, group.name)
                };
                out.insert(path.clone(), group.uuid.clone());
                walk(&path, &group.children, out);
            }
        }

        let mut out = BTreeMap::new();
        walk("", &self.groups, &mut out);
        out
    }

    pub fn find_uuid(&self, path: &str) -> Option<String> {
        self.flatten().remove(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewGroup {
    pub name: String,
    pub uuid: String,
}

/// Whether a login with matching credentials exists for a url.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidLogin {
    pub found: bool,
    pub uuid: Option<String>,
}

/// `{id, key}` pair identifying an association to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub id: String,
    pub key: String,
}

pub(crate) fn keys_value(keys: Vec<ConnectionKey>) -> Value {
    serde_json::to_value(keys).unwrap_or(Value::Array(Vec::new()))
}

/// Pull `entries[0].password`, or a top-level `password`, out of a reply.
pub(crate) fn generated_password(reply: &Map<String, Value>) -> Option<String> {
    reply
        .get("entries")
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
        .and_then(|entry| entry.get("password"))
        .or_else(|| reply.get("password"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
