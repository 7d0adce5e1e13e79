//! Resource type registry and wire-dict mapping.
//!
//! Type strings appear on the wire and must stay stable. Per-type
//! behavior is data held in the registry (prop validators, quota keys,
//! parentage), not subclassing; resource-specific imperative logic
//! lives in the hook tables.

use std::collections::HashMap;

use serde_json::{Map, Value};

use fabricd_store::{ObjectRecord, RefEdge, StoredObject};

use crate::error::ApiError;
use crate::validation::Validator;

/// Reserved name of the shadow parent for staged security policy.
pub const DRAFT_POLICY_NAME: &str = "draft-policy-management";

/// Security resource types that participate in the draft workspace,
/// ordered leaf-to-root for commit processing.
pub const SECURITY_DRAFT_TYPES: &[&str] = &[
    "address-group",
    "service-group",
    "firewall-rule",
    "firewall-policy",
    "application-policy-set",
];

/// Scopes that may enable draft mode.
pub const DRAFT_SCOPE_TYPES: &[&str] = &["global-system-config", "domain", "project"];

/// How a declared property is stored.
#[derive(Clone, Debug)]
pub enum PropKind {
    /// One column, validated.
    Scalar(Validator),
    /// One column per element position.
    List,
    /// One column per map key.
    Map,
}

/// One declared property.
#[derive(Clone, Debug)]
pub struct PropDef {
    /// Wire and column name.
    pub name: &'static str,
    /// Storage shape and validator.
    pub kind: PropKind,
}

/// Static description of one resource type.
#[derive(Clone, Debug)]
pub struct ResourceType {
    /// Wire type string, hyphenated.
    pub name: &'static str,
    /// Plural form used in collection URLs.
    pub plural: &'static str,
    /// Allowed parent types; empty for root-parented resources.
    pub parent_types: &'static [&'static str],
    /// Types this resource may reference.
    pub ref_types: &'static [&'static str],
    /// Declared properties beyond the common set.
    pub props: Vec<PropDef>,
    /// Quota key under the project's `quota` property, if quota-bound.
    pub quota_key: Option<&'static str>,
    /// Child types created by the system and deleted recursively.
    pub default_children: &'static [&'static str],
    /// True for types staged in the security draft workspace.
    pub security_draft: bool,
}

fn common_props() -> Vec<PropDef> {
    vec![
        PropDef {
            name: "id_perms",
            kind: PropKind::Scalar(Validator::Any),
        },
        PropDef {
            name: "perms2",
            kind: PropKind::Scalar(Validator::Any),
        },
        PropDef {
            name: "display_name",
            kind: PropKind::Scalar(Validator::Text),
        },
        PropDef {
            name: "annotations",
            kind: PropKind::Scalar(Validator::Any),
        },
        PropDef {
            name: "draft_mode_state",
            kind: PropKind::Scalar(Validator::StringEnum(&["created", "updated", "deleted"])),
        },
    ]
}

macro_rules! prop {
    ($name:literal, $kind:expr) => {
        PropDef {
            name: $name,
            kind: $kind,
        }
    };
}

fn builtin_types() -> Vec<ResourceType> {
    use PropKind::{List, Map, Scalar};
    use Validator::*;
    vec![
        ResourceType {
            name: "domain",
            plural: "domains",
            parent_types: &[],
            ref_types: &[],
            props: vec![
                prop!("domain_limits", Scalar(Any)),
                prop!("enable_security_policy_draft", Scalar(Boolean)),
            ],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "project",
            plural: "projects",
            parent_types: &["domain"],
            ref_types: &[],
            props: vec![
                prop!("quota", Scalar(Any)),
                prop!("enable_security_policy_draft", Scalar(Boolean)),
            ],
            quota_key: None,
            default_children: &["security-group"],
            security_draft: false,
        },
        ResourceType {
            name: "global-system-config",
            plural: "global-system-configs",
            parent_types: &[],
            ref_types: &[],
            props: vec![
                prop!("autonomous_system", Scalar(IntRange(1, (1 << 32) - 1))),
                prop!("enable_4byte_as", Scalar(Boolean)),
                prop!("enable_security_policy_draft", Scalar(Boolean)),
            ],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "policy-management",
            plural: "policy-managements",
            parent_types: &["global-system-config", "domain", "project"],
            ref_types: &[],
            props: vec![],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "virtual-network",
            plural: "virtual-networks",
            parent_types: &["project"],
            ref_types: &["network-ipam", "virtual-network", "route-target", "tag"],
            props: vec![
                prop!("virtual_network_network_id", Scalar(IntRange(1, 1 << 24))),
                prop!("is_shared", Scalar(Boolean)),
                prop!("router_external", Scalar(Boolean)),
                prop!("virtual_network_properties", Scalar(Any)),
                prop!("address_allocation_mode", Scalar(StringEnum(&[
                    "user-defined-subnet-only",
                    "user-defined-subnet-preferred",
                    "flat-subnet-only",
                    "flat-subnet-preferred",
                ]))),
                prop!("route_target_list", Scalar(Any)),
                prop!("fabric_snat", Scalar(Boolean)),
            ],
            quota_key: Some("virtual_network"),
            default_children: &["routing-instance"],
            security_draft: false,
        },
        ResourceType {
            name: "routing-instance",
            plural: "routing-instances",
            parent_types: &["virtual-network"],
            ref_types: &["route-target"],
            props: vec![prop!("routing_instance_is_default", Scalar(Boolean))],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "network-ipam",
            plural: "network-ipams",
            parent_types: &["project"],
            ref_types: &["virtual-DNS"],
            props: vec![
                prop!("network_ipam_mgmt", Scalar(Any)),
                prop!("ipam_subnet_method", Scalar(StringEnum(&[
                    "user-defined-subnet",
                    "flat-subnet",
                ]))),
                prop!("ipam_subnets", Scalar(Any)),
            ],
            quota_key: Some("network_ipam"),
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "virtual-DNS",
            plural: "virtual-DNSs",
            parent_types: &["domain"],
            ref_types: &[],
            props: vec![prop!("virtual_DNS_data", Scalar(Any))],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "security-group",
            plural: "security-groups",
            parent_types: &["project"],
            ref_types: &["tag"],
            props: vec![
                prop!("security_group_id", Scalar(IntRange(0, (1 << 32) - 1))),
                prop!("security_group_entries", Scalar(Any)),
                prop!("configured_security_group_id", Scalar(IntRange(0, (1 << 32) - 1))),
            ],
            quota_key: Some("security_group"),
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "route-target",
            plural: "route-targets",
            parent_types: &[],
            ref_types: &[],
            props: vec![],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "virtual-machine-interface",
            plural: "virtual-machine-interfaces",
            parent_types: &["project"],
            ref_types: &["virtual-network", "security-group", "tag", "virtual-machine"],
            props: vec![
                prop!(
                    "virtual_machine_interface_allowed_address_pairs",
                    Scalar(AllowedAddressPairs)
                ),
                prop!("virtual_machine_interface_mac_addresses", Scalar(Any)),
                prop!("virtual_machine_interface_bindings", Map),
                prop!("virtual_machine_interface_fat_flow_protocols", List),
                prop!(
                    "virtual_machine_interface_properties",
                    Scalar(Any)
                ),
            ],
            quota_key: Some("virtual_machine_interface"),
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "virtual-machine",
            plural: "virtual-machines",
            parent_types: &[],
            ref_types: &[],
            props: vec![],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "instance-ip",
            plural: "instance-ips",
            parent_types: &[],
            ref_types: &["virtual-network", "virtual-machine-interface"],
            props: vec![
                prop!("instance_ip_address", Scalar(Text)),
                prop!("subnet_uuid", Scalar(Text)),
                prop!("instance_ip_family", Scalar(StringEnum(&["v4", "v6"]))),
            ],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "floating-ip",
            plural: "floating-ips",
            parent_types: &["floating-ip-pool"],
            ref_types: &["project", "virtual-machine-interface"],
            props: vec![prop!("floating_ip_address", Scalar(Text))],
            quota_key: Some("floating_ip"),
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "floating-ip-pool",
            plural: "floating-ip-pools",
            parent_types: &["virtual-network"],
            ref_types: &[],
            props: vec![],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "tag-type",
            plural: "tag-types",
            parent_types: &[],
            ref_types: &[],
            props: vec![prop!("tag_type_id", Scalar(IntRange(0, (1 << 16) - 1)))],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "tag",
            plural: "tags",
            parent_types: &["project"],
            ref_types: &["tag-type"],
            props: vec![
                prop!("tag_type_name", Scalar(Text)),
                prop!("tag_value", Scalar(Text)),
                prop!("tag_id", Scalar(IntRange(0, i64::MAX))),
            ],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "physical-router",
            plural: "physical-routers",
            parent_types: &["global-system-config"],
            ref_types: &["virtual-network"],
            props: vec![
                prop!("physical_router_management_ip", Scalar(Text)),
                prop!("physical_router_user_credentials", Scalar(Any)),
                prop!("physical_router_vendor_name", Scalar(Text)),
            ],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "virtual-port-group",
            plural: "virtual-port-groups",
            parent_types: &["fabric"],
            ref_types: &["physical-interface"],
            props: vec![prop!("virtual_port_group_id", Scalar(IntRange(0, (1 << 16) - 1)))],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "fabric",
            plural: "fabrics",
            parent_types: &["global-system-config"],
            ref_types: &[],
            props: vec![],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "physical-interface",
            plural: "physical-interfaces",
            parent_types: &["physical-router"],
            ref_types: &["physical-interface"],
            props: vec![prop!("ethernet_segment_identifier", Scalar(Text))],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "sub-cluster",
            plural: "sub-clusters",
            parent_types: &[],
            ref_types: &[],
            props: vec![
                prop!("sub_cluster_asn", Scalar(IntRange(1, (1 << 32) - 1))),
                prop!("sub_cluster_id", Scalar(IntRange(1, (1 << 32) - 1))),
            ],
            quota_key: None,
            default_children: &[],
            security_draft: false,
        },
        ResourceType {
            name: "application-policy-set",
            plural: "application-policy-sets",
            parent_types: &["policy-management", "project"],
            ref_types: &["firewall-policy", "tag"],
            props: vec![prop!("all_applications", Scalar(Boolean))],
            quota_key: None,
            default_children: &[],
            security_draft: true,
        },
        ResourceType {
            name: "firewall-policy",
            plural: "firewall-policys",
            parent_types: &["policy-management", "project"],
            ref_types: &["firewall-rule", "tag"],
            props: vec![],
            quota_key: None,
            default_children: &[],
            security_draft: true,
        },
        ResourceType {
            name: "firewall-rule",
            plural: "firewall-rules",
            parent_types: &["policy-management", "project"],
            ref_types: &["service-group", "address-group", "tag", "virtual-network"],
            props: vec![
                prop!("action_list", Scalar(Any)),
                prop!("service", Scalar(Any)),
                prop!("endpoint_1", Scalar(Any)),
                prop!("endpoint_2", Scalar(Any)),
                prop!("direction", Scalar(StringEnum(&["<", ">", "<>"]))),
            ],
            quota_key: None,
            default_children: &[],
            security_draft: true,
        },
        ResourceType {
            name: "service-group",
            plural: "service-groups",
            parent_types: &["policy-management", "project"],
            ref_types: &[],
            props: vec![prop!("service_group_firewall_service_list", Scalar(Any))],
            quota_key: None,
            default_children: &[],
            security_draft: true,
        },
        ResourceType {
            name: "address-group",
            plural: "address-groups",
            parent_types: &["policy-management", "project"],
            ref_types: &[],
            props: vec![prop!("address_group_prefix", Scalar(Any))],
            quota_key: None,
            default_children: &[],
            security_draft: true,
        },
    ]
}

/// Ref wire field for a target type: `virtual-network` →
/// `virtual_network_refs`.
pub fn ref_field(target_type: &str) -> String {
    format!("{}_refs", target_type.replace('-', "_"))
}

/// String-keyed registry of resource types, built at start-up.
pub struct TypeRegistry {
    by_name: HashMap<&'static str, ResourceType>,
    plural_to_name: HashMap<&'static str, &'static str>,
    common: Vec<PropDef>,
}

impl TypeRegistry {
    /// Registry with the built-in types.
    pub fn new() -> Self {
        let mut by_name = HashMap::new();
        let mut plural_to_name = HashMap::new();
        for rt in builtin_types() {
            plural_to_name.insert(rt.plural, rt.name);
            by_name.insert(rt.name, rt);
        }
        Self {
            by_name,
            plural_to_name,
            common: common_props(),
        }
    }

    /// Looks up a type, failing with 404 for unknown strings.
    pub fn get(&self, type_name: &str) -> Result<&ResourceType, ApiError> {
        self.by_name
            .get(type_name)
            .ok_or_else(|| ApiError::NotFound(format!("unknown resource type {}", type_name)))
    }

    /// Resolves a plural collection name to the type name.
    pub fn resolve_plural(&self, plural: &str) -> Result<&ResourceType, ApiError> {
        let name = self
            .plural_to_name
            .get(plural)
            .ok_or_else(|| ApiError::NotFound(format!("unknown collection {}", plural)))?;
        self.get(name)
    }

    /// All registered type names.
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn prop_def<'a>(&'a self, rt: &'a ResourceType, name: &str) -> Option<&'a PropDef> {
        rt.props
            .iter()
            .find(|p| p.name == name)
            .or_else(|| self.common.iter().find(|p| p.name == name))
    }

    /// Decomposes a wire dict into a typed record, validating every
    /// declared property and rejecting unknown fields.
    pub fn decompose(&self, type_name: &str, body: &Value) -> Result<ObjectRecord, ApiError> {
        let rt = self.get(type_name)?;
        let obj = body
            .as_object()
            .ok_or_else(|| ApiError::MalformedRequest("body must be an object".to_string()))?;

        let fq_name: Vec<String> = obj
            .get("fq_name")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .ok_or_else(|| ApiError::MalformedRequest("fq_name is required".to_string()))?;
        if fq_name.is_empty() || fq_name.iter().any(String::is_empty) {
            return Err(ApiError::MalformedRequest(format!(
                "bad fq_name {:?}",
                fq_name
            )));
        }
        // Colons are the FQN join separator. Root-parented
        // single-component names (route-targets) legitimately carry
        // them; everything else must not.
        let single_root = rt.parent_types.is_empty() && fq_name.len() == 1;
        if !single_root && fq_name.iter().any(|c| c.contains(':')) {
            return Err(ApiError::MalformedRequest(format!(
                "bad fq_name {:?}",
                fq_name
            )));
        }

        let uuid = obj
            .get("uuid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut record = ObjectRecord {
            type_name: type_name.to_string(),
            uuid,
            fq_name,
            ..Default::default()
        };

        if let Some(ptype) = obj.get("parent_type").and_then(Value::as_str) {
            if !rt.parent_types.contains(&ptype) {
                return Err(ApiError::MalformedRequest(format!(
                    "{} cannot be a child of {}",
                    type_name, ptype
                )));
            }
            let puuid = obj
                .get("parent_uuid")
                .and_then(Value::as_str)
                .unwrap_or_default();
            record.parent = Some((ptype.to_string(), puuid.to_string()));
        } else if !rt.parent_types.is_empty() {
            return Err(ApiError::MalformedRequest(format!(
                "{} requires a parent of type {:?}",
                type_name, rt.parent_types
            )));
        }

        for (field, value) in obj {
            match field.as_str() {
                "fq_name" | "uuid" | "parent_type" | "parent_uuid" | "href" => continue,
                _ => {}
            }
            if let Some(target) = self.ref_target_for_field(rt, field) {
                record.refs.extend(parse_refs(&target, value)?);
                continue;
            }
            let def = self.prop_def(rt, field).ok_or_else(|| {
                ApiError::MalformedRequest(format!("unknown field {} for {}", field, type_name))
            })?;
            match &def.kind {
                PropKind::Scalar(validator) => {
                    validator.check(field, value)?;
                    record.props.insert(field.clone(), value.clone());
                }
                PropKind::List => {
                    let items = value.as_array().ok_or_else(|| {
                        ApiError::MalformedRequest(format!("{} must be a list", field))
                    })?;
                    record.prop_lists.insert(field.clone(), items.clone());
                }
                PropKind::Map => {
                    let entries = value.as_object().ok_or_else(|| {
                        ApiError::MalformedRequest(format!("{} must be a map", field))
                    })?;
                    record.prop_maps.insert(
                        field.clone(),
                        entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    );
                }
            }
        }
        Ok(record)
    }

    fn ref_target_for_field(&self, rt: &ResourceType, field: &str) -> Option<String> {
        rt.ref_types
            .iter()
            .find(|t| ref_field(t) == field)
            .map(|t| t.to_string())
    }

    /// Composes the wire dict for a stored object.
    pub fn compose(&self, obj: &StoredObject) -> Value {
        let mut out = Map::new();
        out.insert("uuid".to_string(), Value::String(obj.record.uuid.clone()));
        out.insert(
            "fq_name".to_string(),
            serde_json::to_value(&obj.record.fq_name).expect("fq_name serializes"),
        );
        if let Some((ptype, puuid)) = &obj.record.parent {
            out.insert("parent_type".to_string(), Value::String(ptype.clone()));
            out.insert("parent_uuid".to_string(), Value::String(puuid.clone()));
        }
        for (name, value) in &obj.record.props {
            out.insert(name.clone(), value.clone());
        }
        for (name, items) in &obj.record.prop_lists {
            out.insert(name.clone(), Value::Array(items.clone()));
        }
        for (name, entries) in &obj.record.prop_maps {
            out.insert(
                name.clone(),
                Value::Object(entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            );
        }
        let mut refs_by_type: HashMap<&str, Vec<Value>> = HashMap::new();
        for r in &obj.record.refs {
            refs_by_type
                .entry(r.type_name.as_str())
                .or_default()
                .push(serde_json::json!({"uuid": r.uuid, "attr": r.attr}));
        }
        for (t, refs) in refs_by_type {
            out.insert(ref_field(t), Value::Array(refs));
        }
        let mut backrefs_by_type: HashMap<&str, Vec<Value>> = HashMap::new();
        for b in &obj.backrefs {
            backrefs_by_type
                .entry(b.type_name.as_str())
                .or_default()
                .push(serde_json::json!({"uuid": b.uuid, "attr": b.attr}));
        }
        for (t, backrefs) in backrefs_by_type {
            out.insert(
                format!("{}_back_refs", t.replace('-', "_")),
                Value::Array(backrefs),
            );
        }
        if !obj.last_modified.is_empty() {
            out.insert(
                "last_modified".to_string(),
                Value::String(obj.last_modified.clone()),
            );
        }
        Value::Object(out)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_refs(target_type: &str, value: &Value) -> Result<Vec<RefEdge>, ApiError> {
    let entries = value.as_array().ok_or_else(|| {
        ApiError::MalformedRequest(format!("{} must be a list", ref_field(target_type)))
    })?;
    let mut refs = Vec::with_capacity(entries.len());
    for entry in entries {
        let uuid = entry
            .get("uuid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let to: Vec<String> = entry
            .get("to")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        if uuid.is_empty() && to.is_empty() {
            return Err(ApiError::MalformedRequest(format!(
                "ref to {} needs uuid or to",
                target_type
            )));
        }
        let attr = entry.get("attr").cloned().unwrap_or(Value::Null);
        let mut edge = RefEdge::with_attr(target_type, &uuid, attr);
        if edge.uuid.is_empty() {
            // Resolved later against the FQN index; carry the fq_name
            // in the uuid slot prefixed so the engine can spot it.
            edge.uuid = format!("fqn:{}", to.join(":"));
        }
        refs.push(edge);
    }
    Ok(refs)
}
