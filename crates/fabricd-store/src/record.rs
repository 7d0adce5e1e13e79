//! Typed view of an object row.
//!
//! The engine decomposes wire dicts into an `ObjectRecord` using its
//! schema registry; the store maps records onto columns without knowing
//! per-type semantics.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A directed edge endpoint with an optional attribute payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefEdge {
    /// Type of the resource at the other end.
    pub type_name: String,
    /// UUID of the resource at the other end.
    pub uuid: String,
    /// Attribute payload carried on the edge (JSON, may be null).
    #[serde(default)]
    pub attr: Value,
}

impl RefEdge {
    /// Creates an edge with a null attribute.
    pub fn new(type_name: &str, uuid: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            uuid: uuid.to_string(),
            attr: Value::Null,
        }
    }

    /// Creates an edge carrying an attribute payload.
    pub fn with_attr(type_name: &str, uuid: &str, attr: Value) -> Self {
        Self {
            type_name: type_name.to_string(),
            uuid: uuid.to_string(),
            attr,
        }
    }
}

/// The writable portion of an object row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Resource type string as it appears on the wire.
    pub type_name: String,
    /// Object UUID.
    pub uuid: String,
    /// Fully-qualified name components.
    pub fq_name: Vec<String>,
    /// Parent `(type, uuid)`, None for root-parented resources.
    pub parent: Option<(String, String)>,
    /// Scalar properties, keyed by property name.
    pub props: BTreeMap<String, Value>,
    /// List properties, keyed by property name.
    pub prop_lists: BTreeMap<String, Vec<Value>>,
    /// Map properties, keyed by property name then map key.
    pub prop_maps: BTreeMap<String, BTreeMap<String, Value>>,
    /// Outgoing references.
    pub refs: Vec<RefEdge>,
}

impl ObjectRecord {
    /// Creates a record with the identifying fields set.
    pub fn new(type_name: &str, uuid: &str, fq_name: &[&str]) -> Self {
        Self {
            type_name: type_name.to_string(),
            uuid: uuid.to_string(),
            fq_name: fq_name.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Colon-joined fq_name, the form used in the FQN index and
    /// coordination-store paths.
    pub fn fq_name_str(&self) -> String {
        self.fq_name.join(":")
    }

    /// The leaf (last) name component.
    pub fn name(&self) -> &str {
        self.fq_name.last().map(String::as_str).unwrap_or("")
    }
}

/// A full row as read back from the store: the writable record plus
/// the implicitly-maintained inverse edges.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    /// The writable portion.
    pub record: ObjectRecord,
    /// Incoming references (`backref:` columns).
    pub backrefs: Vec<RefEdge>,
    /// Children `(type, uuid)` pairs.
    pub children: Vec<(String, String)>,
    /// Source UUIDs whose back-refs are relaxed for delete.
    pub relaxed_backrefs: BTreeSet<String>,
    /// RFC3339 timestamp of the latest column mutation.
    pub last_modified: String,
}

impl StoredObject {
    /// Back-refs that still block deletion (not relaxed).
    pub fn blocking_backrefs(&self) -> Vec<&RefEdge> {
        self.backrefs
            .iter()
            .filter(|b| !self.relaxed_backrefs.contains(&b.uuid))
            .collect()
    }
}
