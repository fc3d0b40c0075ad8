use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use super::error::Result;

/// A named, versioned service and the nodes currently serving it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Registration TTL in seconds, used when the register call does not set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A remotely callable method of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Message shape descriptor: a name, a type and nested fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// A change observed by a watcher.
///
/// For `create` and `update` the service is the state after the change; for
/// `delete` it carries the last known state of the removed nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryResult {
    pub action: Action,
    pub service: Service,
    pub timestamp: DateTime<Utc>,
}

impl RegistryResult {
    pub fn new(action: Action, service: Service) -> Self {
        Self {
            action,
            service,
            timestamp: Utc::now(),
        }
    }
}

/// Identified form of a [`RegistryResult`], used on the proxy watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: Action,
    pub timestamp: DateTime<Utc>,
    pub service: Service,
}

impl From<RegistryResult> for Event {
    fn from(result: RegistryResult) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: result.action,
            timestamp: result.timestamp,
            service: result.service,
        }
    }
}

impl From<Event> for RegistryResult {
    fn from(event: Event) -> Self {
        Self {
            action: event.kind,
            service: event.service,
            timestamp: event.timestamp,
        }
    }
}

impl Service {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Copy of this service header carrying only the given nodes.
    pub fn with_nodes(&self, nodes: Vec<Node>) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            metadata: self.metadata.clone(),
            endpoints: self.endpoints.clone(),
            nodes,
            ttl: self.ttl,
        }
    }

    /// Canonical JSON encoding. Equal services always encode to equal bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Hex SHA-256 of the canonical encoding.
    pub fn content_hash(&self) -> Result<String> {
        Ok(hash_bytes(&self.encode()?))
    }
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            metadata: BTreeMap::new(),
        }
    }
}

pub(crate) fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Merge single-node records into one service per version.
///
/// The first record seen for a version provides the header; later records
/// only contribute nodes. Nodes within a version are sorted by id.
pub(crate) fn merge_by_version(records: impl IntoIterator<Item = Service>) -> Vec<Service> {
    let mut versions: BTreeMap<(String, String), Service> = BTreeMap::new();
    for record in records {
        let key = (record.name.clone(), record.version.clone());
        match versions.get_mut(&key) {
            Some(existing) => existing.nodes.extend(record.nodes),
            None => {
                versions.insert(key, record);
            }
        }
    }

    versions
        .into_values()
        .map(|mut service| {
            service.nodes.sort_by(|a, b| a.id.cmp(&b.id));
            service
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Service {
        let mut node = Node::new("foo-1", "10.0.0.1:9000");
        node.metadata.insert("transport".to_string(), "grpc".to_string());
        node.metadata.insert("broker".to_string(), "http".to_string());

        let mut service = Service::new("foo", "1.0.0").with_node(node);
        service.endpoints.push(Endpoint {
            name: "Foo.Call".to_string(),
            request: Some(Value {
                name: "Request".to_string(),
                kind: "Request".to_string(),
                values: vec![Value {
                    name: "name".to_string(),
                    kind: "string".to_string(),
                    values: vec![],
                }],
            }),
            response: None,
            metadata: BTreeMap::from([("stream".to_string(), "true".to_string())]),
        });
        service
    }

    #[test]
    fn test_encoding_is_canonical() {
        let a = sample();
        let mut b = sample();
        // insertion order of metadata must not matter
        b.nodes[0].metadata.clear();
        b.nodes[0].metadata.insert("broker".to_string(), "http".to_string());
        b.nodes[0].metadata.insert("transport".to_string(), "grpc".to_string());

        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());

        b.nodes[0].address = "10.0.0.2:9000".to_string();
        assert_ne!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["name"], "foo");
        assert_eq!(json["nodes"][0]["id"], "foo-1");
        assert_eq!(json["endpoints"][0]["request"]["type"], "Request");
        assert!(json.get("ttl").is_none());

        let decoded = Service::decode(br#"{"name":"bar","version":"2"}"#).unwrap();
        assert!(decoded.nodes.is_empty());
        assert!(decoded.metadata.is_empty());
    }

    #[test]
    fn test_action_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Action::Delete).unwrap(), "\"delete\"");
        assert_eq!(Action::Update.to_string(), "update");
    }

    #[test]
    fn test_merge_by_version() {
        let base = Service::new("foo", "1.0.0");
        let merged = merge_by_version(vec![
            base.with_nodes(vec![Node::new("foo-2", "b")]),
            Service::new("foo", "1.0.1").with_node(Node::new("foo-3", "c")),
            base.with_nodes(vec![Node::new("foo-1", "a")]),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].version, "1.0.0");
        let ids: Vec<_> = merged[0].nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["foo-1", "foo-2"]);
        assert_eq!(merged[1].nodes.len(), 1);
    }

    #[test]
    fn test_event_conversion_keeps_payload() {
        let result = RegistryResult::new(Action::Create, sample());
        let event = Event::from(result.clone());
        assert_eq!(event.kind, Action::Create);
        assert_eq!(RegistryResult::from(event), result);
    }
}
