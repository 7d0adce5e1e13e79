//! Per-resource-type hook tables.
//!
//! The pipeline is generic; everything type-specific happens here. A
//! hook may mutate the record under construction, allocate IDs (pushing
//! the matching undo), or veto the operation with an `ApiError`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use fabricd_alloc::AllocError;
use fabricd_bus::{BusMessage, Oper};
use fabricd_store::{ObjectRecord, StoredObject};

use crate::context::RequestContext;
use crate::engine::Engine;
use crate::error::ApiError;

/// Resource-class-specific pipeline extensions. Default impls are
/// no-ops; types override only what they need.
#[allow(unused_variables)]
pub trait ResourceHooks: Send + Sync {
    /// Policy checks before any allocation.
    fn pre_alloc(&self, engine: &Engine, record: &ObjectRecord) -> Result<(), ApiError> {
        Ok(())
    }

    /// ID allocation and record fixup before persist.
    fn pre_create(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        record: &mut ObjectRecord,
    ) -> Result<(), ApiError> {
        Ok(())
    }

    /// Runs after the row is persisted.
    fn post_create(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        obj: &StoredObject,
    ) -> Result<(), ApiError> {
        Ok(())
    }

    /// Validation and fixup before an update persists.
    fn pre_update(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        prev: &StoredObject,
        record: &mut ObjectRecord,
    ) -> Result<(), ApiError> {
        Ok(())
    }

    /// Runs after an update persists.
    fn post_update(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        prev: &StoredObject,
        obj: &StoredObject,
    ) -> Result<(), ApiError> {
        Ok(())
    }

    /// Veto point before a delete proceeds.
    fn pre_delete(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        obj: &StoredObject,
    ) -> Result<(), ApiError> {
        Ok(())
    }

    /// Cleanup after the row is gone (ID frees live here).
    fn post_delete(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        obj: &StoredObject,
    ) -> Result<(), ApiError> {
        Ok(())
    }

    /// Reaction to a peer process's bus message for this type.
    fn on_notification(&self, engine: &Engine, msg: &BusMessage) {}
}

struct NoHooks;
impl ResourceHooks for NoHooks {}

/// Builds the hook table for every registered type.
pub fn build_hooks() -> HashMap<&'static str, Arc<dyn ResourceHooks>> {
    let mut map: HashMap<&'static str, Arc<dyn ResourceHooks>> = HashMap::new();
    map.insert("virtual-network", Arc::new(VirtualNetworkHooks));
    map.insert("security-group", Arc::new(SecurityGroupHooks));
    map.insert("route-target", Arc::new(RouteTargetHooks));
    map.insert("tag-type", Arc::new(TagTypeHooks));
    map.insert("tag", Arc::new(TagHooks));
    map.insert("sub-cluster", Arc::new(SubClusterHooks));
    map.insert("virtual-port-group", Arc::new(VirtualPortGroupHooks));
    map.insert("project", Arc::new(ProjectHooks));
    map
}

/// Fallback hooks for types without specific behavior.
pub fn no_hooks() -> Arc<dyn ResourceHooks> {
    Arc::new(NoHooks)
}

fn prop_u64(record: &ObjectRecord, name: &str) -> Option<u64> {
    record.props.get(name).and_then(Value::as_u64)
}

// ---------------------------------------------------------------------
// virtual-network
// ---------------------------------------------------------------------

pub(crate) struct VirtualNetworkHooks;

impl VirtualNetworkHooks {
    /// Subnet dicts carried on the ipam ref attr.
    fn subnets_of(record: &ObjectRecord) -> Vec<Value> {
        let mut out = Vec::new();
        for r in &record.refs {
            if r.type_name != "network-ipam" {
                continue;
            }
            if let Some(subnets) = r.attr.get("ipam_subnets").and_then(Value::as_array) {
                for entry in subnets {
                    if let Some(subnet) = entry.get("subnet") {
                        out.push(subnet.clone());
                    }
                }
            }
        }
        out
    }
}

impl ResourceHooks for VirtualNetworkHooks {
    fn pre_create(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        record: &mut ObjectRecord,
    ) -> Result<(), ApiError> {
        let fqn = record.fq_name_str();
        let id = match prop_u64(record, "virtual_network_network_id") {
            Some(requested) => engine.allocators().vn.reserve(requested, &fqn)?,
            None => engine.allocators().vn.alloc(&fqn)?,
        };
        record
            .props
            .insert("virtual_network_network_id".to_string(), Value::from(id));
        let engine_ref = engine.clone_handle();
        ctx.push_undo("free virtual-network id", move || {
            if let Err(e) = engine_ref.allocators().vn.free(id) {
                tracing::error!("undo failed: free vn id {}: {}", id, e);
            }
        });

        for mut subnet in Self::subnets_of(record) {
            let cidr = crate::validation::normalize_subnet(&mut subnet)?;
            let mut config = fabricd_alloc::SubnetConfig::new(&fqn, &cidr);
            if let Some(gw) = subnet.get("default_gateway").and_then(Value::as_str) {
                config.gateway = gw.parse().ok();
            }
            if let Some(dns) = subnet.get("dns_server_address").and_then(Value::as_str) {
                config.dns_server = dns.parse().ok();
            }
            engine.allocators().subnet(config)?;
            let engine_ref = engine.clone_handle();
            let fqn = fqn.clone();
            ctx.push_undo("drop subnet allocator", move || {
                engine_ref.allocators().subnet_evict(&fqn, &cidr);
            });
        }
        Ok(())
    }

    fn post_delete(
        &self,
        engine: &Engine,
        _ctx: &mut RequestContext,
        obj: &StoredObject,
    ) -> Result<(), ApiError> {
        if let Some(id) = prop_u64(&obj.record, "virtual_network_network_id") {
            engine.allocators().vn.free(id)?;
        }
        let fqn = obj.record.fq_name_str();
        for mut subnet in Self::subnets_of(&obj.record) {
            if let Ok(cidr) = crate::validation::normalize_subnet(&mut subnet) {
                if let Some(alloc) = engine.allocators().subnet_get(&fqn, &cidr) {
                    // Drop the per-subnet lock tree with the subnet.
                    let _ = engine.coord().delete(alloc.base_path(), true);
                }
                engine.allocators().subnet_evict(&fqn, &cidr);
            }
        }
        Ok(())
    }

    fn on_notification(&self, engine: &Engine, msg: &BusMessage) {
        let id = msg
            .obj_dict
            .get("virtual_network_network_id")
            .and_then(Value::as_u64);
        match (msg.oper, id) {
            (Oper::Create, Some(id)) => engine.allocators().vn.set_in_use(id),
            (Oper::Delete, Some(id)) => engine.allocators().vn.reset_in_use(id),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------
// security-group
// ---------------------------------------------------------------------

pub(crate) struct SecurityGroupHooks;

impl ResourceHooks for SecurityGroupHooks {
    fn pre_create(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        record: &mut ObjectRecord,
    ) -> Result<(), ApiError> {
        let fqn = record.fq_name_str();
        let id = engine.allocators().sg.alloc(&fqn)?;
        record
            .props
            .insert("security_group_id".to_string(), Value::from(id));
        let engine_ref = engine.clone_handle();
        ctx.push_undo("free security-group id", move || {
            if let Err(e) = engine_ref.allocators().sg.free(id) {
                tracing::error!("undo failed: free sg id {}: {}", id, e);
            }
        });
        Ok(())
    }

    fn post_delete(
        &self,
        engine: &Engine,
        _ctx: &mut RequestContext,
        obj: &StoredObject,
    ) -> Result<(), ApiError> {
        if let Some(id) = prop_u64(&obj.record, "security_group_id") {
            if id != 0 {
                engine.allocators().sg.free(id)?;
            }
        }
        Ok(())
    }

    fn on_notification(&self, engine: &Engine, msg: &BusMessage) {
        let id = msg.obj_dict.get("security_group_id").and_then(Value::as_u64);
        match (msg.oper, id) {
            (Oper::Create, Some(id)) => engine.allocators().sg.set_in_use(id),
            (Oper::Delete, Some(id)) if id != 0 => engine.allocators().sg.reset_in_use(id),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------
// route-target
// ---------------------------------------------------------------------

pub(crate) struct RouteTargetHooks;

impl RouteTargetHooks {
    /// Parses `target:<asn>:<id>`; returns the numeric id.
    fn parse_fq_name(fq_name: &str) -> Result<u64, ApiError> {
        let bad = || {
            ApiError::MalformedRequest(format!(
                "route target must be target:<asn>:<number>, got {}",
                fq_name
            ))
        };
        let mut parts = fq_name.split(':');
        if parts.next() != Some("target") {
            return Err(bad());
        }
        let _asn = parts.next().ok_or_else(bad)?;
        let id = parts
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(id)
    }
}

impl ResourceHooks for RouteTargetHooks {
    fn pre_alloc(&self, _engine: &Engine, record: &ObjectRecord) -> Result<(), ApiError> {
        Self::parse_fq_name(&record.fq_name_str()).map(|_| ())
    }

    fn pre_create(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        record: &mut ObjectRecord,
    ) -> Result<(), ApiError> {
        let fqn = record.fq_name_str();
        let id = Self::parse_fq_name(&fqn)?;
        // Values below the system minimum are user-defined and never
        // pass through the allocator.
        if id < engine.allocators().rt.start() {
            return Ok(());
        }
        match engine.allocators().rt.reserve(id, &fqn) {
            Ok(_) => {}
            Err(AllocError::ResourceExists { owner, .. }) => {
                return Err(ApiError::Conflict(format!(
                    "route target {} already allocated to {}",
                    fqn, owner
                )))
            }
            Err(e) => return Err(e.into()),
        }
        let engine_ref = engine.clone_handle();
        ctx.push_undo("free route-target id", move || {
            if let Err(e) = engine_ref.allocators().rt.free(id) {
                tracing::error!("undo failed: free rt id {}: {}", id, e);
            }
        });
        Ok(())
    }

    fn post_delete(
        &self,
        engine: &Engine,
        _ctx: &mut RequestContext,
        obj: &StoredObject,
    ) -> Result<(), ApiError> {
        let id = Self::parse_fq_name(&obj.record.fq_name_str())?;
        if id >= engine.allocators().rt.start() {
            engine.allocators().rt.free(id)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// tag-type / tag
// ---------------------------------------------------------------------

pub(crate) struct TagTypeHooks;

impl ResourceHooks for TagTypeHooks {
    fn pre_create(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        record: &mut ObjectRecord,
    ) -> Result<(), ApiError> {
        let fqn = record.fq_name_str();
        let id = engine.allocators().tag_type.alloc(&fqn)?;
        record.props.insert("tag_type_id".to_string(), Value::from(id));
        let engine_ref = engine.clone_handle();
        ctx.push_undo("free tag-type id", move || {
            if let Err(e) = engine_ref.allocators().tag_type.free(id) {
                tracing::error!("undo failed: free tag-type id {}: {}", id, e);
            }
        });
        Ok(())
    }

    fn post_delete(
        &self,
        engine: &Engine,
        _ctx: &mut RequestContext,
        obj: &StoredObject,
    ) -> Result<(), ApiError> {
        if let Some(id) = prop_u64(&obj.record, "tag_type_id") {
            engine.allocators().tag_type.free(id)?;
        }
        Ok(())
    }
}

pub(crate) struct TagHooks;

impl ResourceHooks for TagHooks {
    fn pre_alloc(&self, _engine: &Engine, record: &ObjectRecord) -> Result<(), ApiError> {
        if !record.name().contains('=') {
            return Err(ApiError::MalformedRequest(format!(
                "tag name must be <type>=<value>, got {}",
                record.name()
            )));
        }
        Ok(())
    }

    fn pre_create(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        record: &mut ObjectRecord,
    ) -> Result<(), ApiError> {
        let name = record.name().to_string();
        let (tag_type, tag_value) = name.split_once('=').ok_or_else(|| {
            ApiError::MalformedRequest(format!("tag name must be <type>=<value>, got {}", name))
        })?;
        record
            .props
            .insert("tag_type_name".to_string(), Value::String(tag_type.to_string()));
        record
            .props
            .insert("tag_value".to_string(), Value::String(tag_value.to_string()));
        let alloc = engine.allocators().tag_values(tag_type)?;
        let id = alloc.alloc(&record.fq_name_str())?;
        record.props.insert("tag_id".to_string(), Value::from(id));
        let tag_type = tag_type.to_string();
        let engine_ref = engine.clone_handle();
        ctx.push_undo("free tag-value id", move || {
            match engine_ref.allocators().tag_values(&tag_type) {
                Ok(alloc) => {
                    if let Err(e) = alloc.free(id) {
                        tracing::error!("undo failed: free tag value {}: {}", id, e);
                    }
                }
                Err(e) => tracing::error!("undo failed: tag-value allocator: {}", e),
            }
        });
        Ok(())
    }

    fn post_delete(
        &self,
        engine: &Engine,
        _ctx: &mut RequestContext,
        obj: &StoredObject,
    ) -> Result<(), ApiError> {
        let tag_type = obj
            .record
            .props
            .get("tag_type_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(id) = prop_u64(&obj.record, "tag_id") {
            if !tag_type.is_empty() {
                engine.allocators().tag_values(&tag_type)?.free(id)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// sub-cluster / virtual-port-group
// ---------------------------------------------------------------------

pub(crate) struct SubClusterHooks;

impl ResourceHooks for SubClusterHooks {
    fn pre_create(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        record: &mut ObjectRecord,
    ) -> Result<(), ApiError> {
        let fqn = record.fq_name_str();
        let id = match prop_u64(record, "sub_cluster_id") {
            Some(requested) => engine.allocators().sub_cluster.reserve(requested, &fqn)?,
            None => engine.allocators().sub_cluster.alloc(&fqn)?,
        };
        record.props.insert("sub_cluster_id".to_string(), Value::from(id));
        let engine_ref = engine.clone_handle();
        ctx.push_undo("free sub-cluster id", move || {
            if let Err(e) = engine_ref.allocators().sub_cluster.free(id) {
                tracing::error!("undo failed: free sub-cluster id {}: {}", id, e);
            }
        });
        Ok(())
    }

    fn pre_update(
        &self,
        _engine: &Engine,
        _ctx: &mut RequestContext,
        prev: &StoredObject,
        record: &mut ObjectRecord,
    ) -> Result<(), ApiError> {
        let old = prev.record.props.get("sub_cluster_asn");
        let new = record.props.get("sub_cluster_asn");
        if new.is_some() && new != old {
            return Err(ApiError::MalformedRequest(
                "sub_cluster_asn cannot be changed".to_string(),
            ));
        }
        Ok(())
    }

    fn post_delete(
        &self,
        engine: &Engine,
        _ctx: &mut RequestContext,
        obj: &StoredObject,
    ) -> Result<(), ApiError> {
        if let Some(id) = prop_u64(&obj.record, "sub_cluster_id") {
            engine.allocators().sub_cluster.free(id)?;
        }
        Ok(())
    }
}

pub(crate) struct VirtualPortGroupHooks;

impl VirtualPortGroupHooks {
    /// Physical router owning an interface: the interface FQN minus
    /// its leaf component.
    fn router_of(engine: &Engine, interface_uuid: &str) -> Option<String> {
        let (_, fqn) = engine.store().uuid_to_fq_name(interface_uuid).ok()?;
        (fqn.len() > 1).then(|| fqn[..fqn.len() - 1].join(":"))
    }
}

impl ResourceHooks for VirtualPortGroupHooks {
    fn pre_create(
        &self,
        engine: &Engine,
        ctx: &mut RequestContext,
        record: &mut ObjectRecord,
    ) -> Result<(), ApiError> {
        let fqn = record.fq_name_str();
        let id = engine.allocators().vpg.alloc(&fqn)?;
        record
            .props
            .insert("virtual_port_group_id".to_string(), Value::from(id));
        let engine_ref = engine.clone_handle();
        ctx.push_undo("free virtual-port-group id", move || {
            if let Err(e) = engine_ref.allocators().vpg.free(id) {
                tracing::error!("undo failed: free vpg id {}: {}", id, e);
            }
        });

        // One aggregated-ethernet unit per physical router spanned by
        // the group; interfaces on the same router share it. The id
        // rides on the interface ref attr.
        let mut per_router: HashMap<String, u64> = HashMap::new();
        for r in record.refs.iter_mut() {
            if r.type_name != "physical-interface" {
                continue;
            }
            let Some(router) = Self::router_of(engine, &r.uuid) else {
                continue;
            };
            let ae_id = match per_router.get(&router) {
                Some(id) => *id,
                None => {
                    let id = engine.allocators().aggregated_ethernet(&router)?.alloc(&fqn)?;
                    per_router.insert(router.clone(), id);
                    let engine_ref = engine.clone_handle();
                    let undo_router = router.clone();
                    ctx.push_undo("free aggregated-ethernet id", move || {
                        let freed = engine_ref
                            .allocators()
                            .aggregated_ethernet(&undo_router)
                            .and_then(|a| a.free(id));
                        if let Err(e) = freed {
                            tracing::error!(
                                "undo failed: free ae id {} on {}: {}",
                                id,
                                undo_router,
                                e
                            );
                        }
                    });
                    id
                }
            };
            if !r.attr.is_object() {
                r.attr = serde_json::json!({});
            }
            r.attr["ae_num"] = Value::from(ae_id);
        }
        Ok(())
    }

    fn post_delete(
        &self,
        engine: &Engine,
        _ctx: &mut RequestContext,
        obj: &StoredObject,
    ) -> Result<(), ApiError> {
        if let Some(id) = prop_u64(&obj.record, "virtual_port_group_id") {
            engine.allocators().vpg.free(id)?;
        }
        let mut freed: HashSet<(String, u64)> = HashSet::new();
        for r in &obj.record.refs {
            if r.type_name != "physical-interface" {
                continue;
            }
            let Some(ae_id) = r.attr.get("ae_num").and_then(Value::as_u64) else {
                continue;
            };
            let Some(router) = Self::router_of(engine, &r.uuid) else {
                continue;
            };
            if freed.insert((router.clone(), ae_id)) {
                engine.allocators().aggregated_ethernet(&router)?.free(ae_id)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// project
// ---------------------------------------------------------------------

pub(crate) struct ProjectHooks;

impl ResourceHooks for ProjectHooks {
    fn post_update(
        &self,
        engine: &Engine,
        _ctx: &mut RequestContext,
        prev: &StoredObject,
        obj: &StoredObject,
    ) -> Result<(), ApiError> {
        let old_quota = prev.record.props.get("quota");
        let new_quota = obj.record.props.get("quota");
        if new_quota != old_quota {
            if let Some(quota) = new_quota.and_then(Value::as_object) {
                engine.quota_reinitialize(&obj.record.uuid, quota)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use fabricd_bus::MemoryBus;
    use fabricd_coord::MemoryCoordStore;
    use fabricd_store::{CacheConfig, MemoryObjectTable};
    use serde_json::json;

    use crate::context::{UserContext, ADMIN_ROLE};
    use crate::engine::EngineConfig;

    fn test_engine() -> Engine {
        Engine::new(
            Arc::new(MemoryCoordStore::new()),
            Arc::new(MemoryObjectTable::new()),
            Arc::new(MemoryBus::new()),
            EngineConfig::default(),
            CacheConfig::default(),
        )
        .unwrap()
    }

    fn admin_ctx() -> RequestContext {
        let mut user = UserContext::default();
        user.roles.push(ADMIN_ROLE.to_string());
        user.project_id = "admin-project".to_string();
        RequestContext::new(user, &format!("req-{}", uuid::Uuid::new_v4()))
    }

    fn create(engine: &Engine, type_name: &str, body: Value) -> String {
        engine.create(&mut admin_ctx(), type_name, &body).unwrap().body[type_name]["uuid"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_vpg_shares_ae_id_per_router() {
        let engine = test_engine();
        let gsc = create(&engine, "global-system-config", json!({"fq_name": ["default-gsc"]}));
        let fabric = create(
            &engine,
            "fabric",
            json!({
                "fq_name": ["default-gsc", "fab1"],
                "parent_type": "global-system-config",
                "parent_uuid": gsc,
            }),
        );
        let mut interfaces = Vec::new();
        for (router, port) in [("qfx1", "xe-0-0-0"), ("qfx1", "xe-0-0-1"), ("qfx2", "xe-0-0-0")] {
            let router_uuid = match engine
                .store()
                .fq_name_to_uuid("physical-router", &["default-gsc".into(), router.into()])
            {
                Ok(u) => u,
                Err(_) => create(
                    &engine,
                    "physical-router",
                    json!({
                        "fq_name": ["default-gsc", router],
                        "parent_type": "global-system-config",
                        "parent_uuid": gsc,
                    }),
                ),
            };
            interfaces.push(create(
                &engine,
                "physical-interface",
                json!({
                    "fq_name": ["default-gsc", router, port],
                    "parent_type": "physical-router",
                    "parent_uuid": router_uuid,
                }),
            ));
        }

        let vpg = create(
            &engine,
            "virtual-port-group",
            json!({
                "fq_name": ["default-gsc", "fab1", "vpg1"],
                "parent_type": "fabric",
                "parent_uuid": fabric,
                "physical_interface_refs": [
                    {"uuid": interfaces[0]},
                    {"uuid": interfaces[1]},
                    {"uuid": interfaces[2]},
                ],
            }),
        );

        let obj = engine.store().object_read("virtual-port-group", &vpg).unwrap();
        let ae_of = |uuid: &str| {
            obj.record
                .refs
                .iter()
                .find(|r| r.uuid == uuid)
                .and_then(|r| r.attr.get("ae_num"))
                .and_then(Value::as_u64)
                .unwrap()
        };
        // Interfaces on the same router share one unit; the second
        // router gets its own namespace.
        assert_eq!(ae_of(&interfaces[0]), ae_of(&interfaces[1]));
        assert_eq!(ae_of(&interfaces[2]), 0);
        let qfx1 = engine.allocators().aggregated_ethernet("default-gsc:qfx1").unwrap();
        let qfx2 = engine.allocators().aggregated_ethernet("default-gsc:qfx2").unwrap();
        assert_eq!(qfx1.in_use_count(), 1);
        assert_eq!(qfx2.in_use_count(), 1);

        engine.delete(&mut admin_ctx(), "virtual-port-group", &vpg).unwrap();
        assert_eq!(qfx1.in_use_count(), 0);
        assert_eq!(qfx2.in_use_count(), 0);
    }

    #[test]
    fn test_route_target_fq_name_grammar() {
        assert_eq!(RouteTargetHooks::parse_fq_name("target:64512:8000001").unwrap(), 8_000_001);
        assert!(RouteTargetHooks::parse_fq_name("target:64512").is_err());
        assert!(RouteTargetHooks::parse_fq_name("import:64512:1").is_err());
        assert!(RouteTargetHooks::parse_fq_name("target:64512:abc").is_err());
        assert!(RouteTargetHooks::parse_fq_name("target:1:2:3").is_err());
    }
}
