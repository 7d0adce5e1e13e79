//! Draft workspace for security policy.
//!
//! When a scope (project, domain, or global-system-config) enables
//! draft mode, mutations to security resources land on shadow copies
//! under a reserved `draft-policy-management` child of the scope and
//! answer 202. A commit applies the staged set to the production tree
//! under a scope-wide lock; a discard drops it. Commits are monotonic:
//! a shadow that fails to apply stays staged while the rest land.

use std::time::Duration;

use serde_json::{json, Map, Value};

use fabricd_coord::{CoordError, LockRegistry};
use fabricd_store::{ListFilter, ObjectRecord, StoreError, StoredObject};

use crate::context::RequestContext;
use crate::engine::{ApiResponse, Engine};
use crate::error::ApiError;
use crate::schema::{DRAFT_POLICY_NAME, DRAFT_SCOPE_TYPES, SECURITY_DRAFT_TYPES};

/// Lock namespace for draft commits and discards.
const LOCK_PREFIX: &str = "/api-server";

/// How long a commit waits for a concurrent draft action.
const LOCK_WAIT: Duration = Duration::from_secs(1);

/// The scope object governing a security resource, if that scope has
/// draft mode enabled. None means the mutation proceeds directly.
fn draft_scope(
    engine: &Engine,
    parent: &Option<(String, String)>,
    fq_name: &[String],
) -> Result<Option<StoredObject>, ApiError> {
    // Shadows themselves are never redirected again.
    if fq_name.iter().any(|c| c == DRAFT_POLICY_NAME) {
        return Ok(None);
    }
    let Some((ptype, puuid)) = parent else {
        return Ok(None);
    };
    let scope = match ptype.as_str() {
        "project" => engine.store().object_read("project", puuid)?,
        "policy-management" => {
            let pm = engine.store().object_read("policy-management", puuid)?;
            match &pm.record.parent {
                Some((sptype, spuuid)) if DRAFT_SCOPE_TYPES.contains(&sptype.as_str()) => {
                    engine.store().object_read(sptype, spuuid)?
                }
                _ => return Ok(None),
            }
        }
        _ => return Ok(None),
    };
    let enabled = scope
        .record
        .props
        .get("enable_security_policy_draft")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(enabled.then_some(scope))
}

fn shadow_parent_fq_name(scope: &StoredObject) -> Vec<String> {
    let mut fqn = scope.record.fq_name.clone();
    fqn.push(DRAFT_POLICY_NAME.to_string());
    fqn
}

/// UUID of the scope's shadow parent, creating it on first stage.
fn shadow_parent_uuid(engine: &Engine, scope: &StoredObject) -> Result<String, ApiError> {
    let fqn = shadow_parent_fq_name(scope);
    match engine.store().fq_name_to_uuid("policy-management", &fqn) {
        Ok(uuid) => Ok(uuid),
        Err(StoreError::FqNameNotFound { .. }) => {
            let resp = engine.internal_create(
                "policy-management",
                &json!({
                    "fq_name": fqn,
                    "parent_type": scope.record.type_name,
                    "parent_uuid": scope.record.uuid,
                }),
            )?;
            Ok(resp.body["policy-management"]["uuid"]
                .as_str()
                .unwrap_or_default()
                .to_string())
        }
        Err(e) => Err(e.into()),
    }
}

/// Existing shadow parent, if any mutation was staged for the scope.
fn find_shadow_parent(engine: &Engine, scope: &StoredObject) -> Result<Option<String>, ApiError> {
    let fqn = shadow_parent_fq_name(scope);
    match engine.store().fq_name_to_uuid("policy-management", &fqn) {
        Ok(uuid) => Ok(Some(uuid)),
        Err(StoreError::FqNameNotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Production identity for a staged leaf name: under the project
/// itself for project scope, under the scope's default
/// policy-management otherwise.
fn production_fq_name(scope: &StoredObject, leaf: &str) -> Vec<String> {
    let mut fqn = scope.record.fq_name.clone();
    if scope.record.type_name != "project" {
        fqn.push("default-policy-management".to_string());
    }
    fqn.push(leaf.to_string());
    fqn
}

fn production_parent(
    engine: &Engine,
    scope: &StoredObject,
) -> Result<(String, String), ApiError> {
    if scope.record.type_name == "project" {
        return Ok(("project".to_string(), scope.record.uuid.clone()));
    }
    let mut fqn = scope.record.fq_name.clone();
    fqn.push("default-policy-management".to_string());
    let uuid = match engine.store().fq_name_to_uuid("policy-management", &fqn) {
        Ok(uuid) => uuid,
        Err(StoreError::FqNameNotFound { .. }) => {
            let resp = engine.internal_create(
                "policy-management",
                &json!({
                    "fq_name": fqn,
                    "parent_type": scope.record.type_name,
                    "parent_uuid": scope.record.uuid,
                }),
            )?;
            resp.body["policy-management"]["uuid"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        }
        Err(e) => return Err(e.into()),
    };
    Ok(("policy-management".to_string(), uuid))
}

/// Strips identity and derived keys from a composed dict so it can be
/// re-submitted as a create/update body.
fn strip_identity(body: &mut Map<String, Value>) {
    body.remove("uuid");
    body.remove("fq_name");
    body.remove("parent_type");
    body.remove("parent_uuid");
    body.remove("last_modified");
    let derived: Vec<String> = body
        .keys()
        .filter(|k| k.ends_with("_back_refs"))
        .cloned()
        .collect();
    for k in derived {
        body.remove(&k);
    }
}

fn staged_response(type_name: &str, uuid: &str, fq_name: &[String]) -> ApiResponse {
    ApiResponse::accepted(json!({
        type_name: {"uuid": uuid, "fq_name": fq_name}
    }))
}

/// Stages a create. Returns None when the scope has no draft mode.
pub(crate) fn stage_create(
    engine: &Engine,
    ctx: &RequestContext,
    record: &ObjectRecord,
) -> Result<Option<ApiResponse>, ApiError> {
    let Some(scope) = draft_scope(engine, &record.parent, &record.fq_name)? else {
        return Ok(None);
    };
    let pm_uuid = shadow_parent_uuid(engine, &scope)?;
    let mut shadow_fqn = shadow_parent_fq_name(&scope);
    shadow_fqn.push(record.name().to_string());

    let composed = engine.registry().compose(&StoredObject {
        record: record.clone(),
        ..Default::default()
    });
    let mut body = match composed {
        Value::Object(m) => m,
        _ => Map::new(),
    };
    strip_identity(&mut body);
    body.insert("fq_name".to_string(), json!(shadow_fqn));
    body.insert("parent_type".to_string(), json!("policy-management"));
    body.insert("parent_uuid".to_string(), json!(pm_uuid));
    body.insert("draft_mode_state".to_string(), json!("created"));

    let resp = engine.internal_create(&record.type_name, &Value::Object(body))?;
    let uuid = resp.body[&record.type_name]["uuid"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    tracing::info!(
        request_id = %ctx.request_id,
        "staged create of {} {} into draft",
        record.type_name,
        record.fq_name_str()
    );
    Ok(Some(staged_response(&record.type_name, &uuid, &shadow_fqn)))
}

/// Stages an update to a committed security resource.
pub(crate) fn stage_update(
    engine: &Engine,
    ctx: &RequestContext,
    prev: &StoredObject,
    update: &Value,
) -> Result<Option<ApiResponse>, ApiError> {
    let Some(scope) = draft_scope(engine, &prev.record.parent, &prev.record.fq_name)? else {
        return Ok(None);
    };
    let type_name = prev.record.type_name.clone();
    let mut shadow_fqn = shadow_parent_fq_name(&scope);
    shadow_fqn.push(prev.record.name().to_string());

    let shadow_uuid = match engine.store().fq_name_to_uuid(&type_name, &shadow_fqn) {
        Ok(uuid) => {
            // Re-staging: overlay onto the existing shadow. A shadow
            // still marked `created` stays a create.
            let shadow = engine.store().object_read(&type_name, &uuid)?;
            let state = match shadow
                .record
                .props
                .get("draft_mode_state")
                .and_then(Value::as_str)
            {
                Some("created") => "created",
                _ => "updated",
            };
            let mut body = update.as_object().cloned().ok_or_else(|| {
                ApiError::MalformedRequest("body must be an object".to_string())
            })?;
            strip_identity(&mut body);
            body.insert("draft_mode_state".to_string(), json!(state));
            engine.internal_update(&type_name, &uuid, &Value::Object(body))?;
            uuid
        }
        Err(StoreError::FqNameNotFound { .. }) => {
            let pm_uuid = shadow_parent_uuid(engine, &scope)?;
            let mut body = match engine.registry().compose(prev) {
                Value::Object(m) => m,
                _ => Map::new(),
            };
            strip_identity(&mut body);
            if let Some(overlay) = update.as_object() {
                for (k, v) in overlay {
                    match k.as_str() {
                        "uuid" | "fq_name" | "parent_type" | "parent_uuid" => continue,
                        _ => {
                            body.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
            body.insert("fq_name".to_string(), json!(shadow_fqn));
            body.insert("parent_type".to_string(), json!("policy-management"));
            body.insert("parent_uuid".to_string(), json!(pm_uuid));
            body.insert("draft_mode_state".to_string(), json!("updated"));
            let resp = engine.internal_create(&type_name, &Value::Object(body))?;
            resp.body[&type_name]["uuid"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(
        request_id = %ctx.request_id,
        "staged update of {} {} into draft",
        type_name,
        prev.record.fq_name_str()
    );
    Ok(Some(staged_response(&type_name, &shadow_uuid, &shadow_fqn)))
}

/// Stages a delete of a committed security resource.
pub(crate) fn stage_delete(
    engine: &Engine,
    ctx: &RequestContext,
    obj: &StoredObject,
) -> Result<Option<ApiResponse>, ApiError> {
    let Some(scope) = draft_scope(engine, &obj.record.parent, &obj.record.fq_name)? else {
        return Ok(None);
    };
    let type_name = obj.record.type_name.clone();
    let mut shadow_fqn = shadow_parent_fq_name(&scope);
    shadow_fqn.push(obj.record.name().to_string());

    let shadow_uuid = match engine.store().fq_name_to_uuid(&type_name, &shadow_fqn) {
        Ok(uuid) => {
            engine.internal_update(
                &type_name,
                &uuid,
                &json!({"draft_mode_state": "deleted"}),
            )?;
            uuid
        }
        Err(StoreError::FqNameNotFound { .. }) => {
            let pm_uuid = shadow_parent_uuid(engine, &scope)?;
            let mut body = match engine.registry().compose(obj) {
                Value::Object(m) => m,
                _ => Map::new(),
            };
            strip_identity(&mut body);
            body.insert("fq_name".to_string(), json!(shadow_fqn));
            body.insert("parent_type".to_string(), json!("policy-management"));
            body.insert("parent_uuid".to_string(), json!(pm_uuid));
            body.insert("draft_mode_state".to_string(), json!("deleted"));
            let resp = engine.internal_create(&type_name, &Value::Object(body))?;
            resp.body[&type_name]["uuid"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(
        request_id = %ctx.request_id,
        "staged delete of {} {} into draft",
        type_name,
        obj.record.fq_name_str()
    );
    Ok(Some(staged_response(&type_name, &shadow_uuid, &shadow_fqn)))
}

/// Rewrites refs and embedded FQN strings in a shadow's composed body
/// so they point at production identities after commit.
fn rewrite_for_commit(
    engine: &Engine,
    scope: &StoredObject,
    body: &mut Map<String, Value>,
) -> Result<(), ApiError> {
    let ref_keys: Vec<String> = body
        .keys()
        .filter(|k| k.ends_with("_refs"))
        .cloned()
        .collect();
    for key in ref_keys {
        let Some(entries) = body.get_mut(&key).and_then(Value::as_array_mut) else {
            continue;
        };
        for entry in entries {
            let Some(uuid) = entry.get("uuid").and_then(Value::as_str) else {
                continue;
            };
            let Ok((_, target_fqn)) = engine.store().uuid_to_fq_name(uuid) else {
                continue;
            };
            if !target_fqn.iter().any(|c| c == DRAFT_POLICY_NAME) {
                continue;
            }
            let leaf = target_fqn.last().cloned().unwrap_or_default();
            let attr = entry.get("attr").cloned().unwrap_or(Value::Null);
            *entry = json!({"to": production_fq_name(scope, &leaf), "attr": attr});
        }
    }
    // Firewall-rule endpoints carry address-group FQN strings.
    for key in ["endpoint_1", "endpoint_2"] {
        let Some(endpoint) = body.get_mut(key) else { continue };
        let Some(ag) = endpoint.get("address_group").and_then(Value::as_str) else {
            continue;
        };
        let components: Vec<&str> = ag.split(':').collect();
        if components.iter().any(|c| *c == DRAFT_POLICY_NAME) {
            let leaf = components.last().copied().unwrap_or_default();
            let rewritten = production_fq_name(scope, leaf).join(":");
            endpoint["address_group"] = Value::String(rewritten);
        }
    }
    Ok(())
}

fn shadows_of_type(
    engine: &Engine,
    type_name: &str,
    pm_uuid: &str,
) -> Result<Vec<String>, ApiError> {
    let filter = ListFilter {
        parent_uuids: Some(vec![pm_uuid.to_string()]),
        ..Default::default()
    };
    Ok(engine
        .store()
        .object_list(type_name, &filter)?
        .entries
        .into_iter()
        .map(|(_, uuid)| uuid)
        .collect())
}

/// A cross-scope reference detached from a shadow during commit, to be
/// re-attached to the production object once the commit pass is done.
struct HeldRef {
    from_type: String,
    from_uuid: String,
    to_type: String,
    to_fq_name: Vec<String>,
    attr: Value,
}

/// Detaches back-refs that reach a shadow from outside the draft tree
/// and queues them for re-attachment. Referrers inside the draft keep
/// their edges; UUID reuse keeps those valid through the commit.
fn hold_cross_refs(
    engine: &Engine,
    shadow: &StoredObject,
    prod_fqn: &[String],
    held: &mut Vec<HeldRef>,
) -> Result<(), ApiError> {
    for backref in &shadow.backrefs {
        let Ok((_, source_fqn)) = engine.store().uuid_to_fq_name(&backref.uuid) else {
            continue;
        };
        if source_fqn.iter().any(|c| c == DRAFT_POLICY_NAME) {
            continue;
        }
        engine.store().ref_update(
            &backref.type_name,
            &backref.uuid,
            &shadow.record.type_name,
            &shadow.record.uuid,
            false,
            &Value::Null,
        )?;
        held.push(HeldRef {
            from_type: backref.type_name.clone(),
            from_uuid: backref.uuid.clone(),
            to_type: shadow.record.type_name.clone(),
            to_fq_name: prod_fqn.to_vec(),
            attr: backref.attr.clone(),
        });
    }
    Ok(())
}

/// Applies one staged create or update to the production tree.
fn commit_one(
    engine: &Engine,
    scope: &StoredObject,
    type_name: &str,
    shadow_uuid: &str,
    held: &mut Vec<HeldRef>,
) -> Result<(), ApiError> {
    let shadow = engine.store().object_read(type_name, shadow_uuid)?;
    let state = shadow
        .record
        .props
        .get("draft_mode_state")
        .and_then(Value::as_str)
        .unwrap_or("created")
        .to_string();
    if state == "deleted" {
        return Ok(());
    }
    let leaf = shadow.record.name().to_string();
    let prod_fqn = production_fq_name(scope, &leaf);

    let mut body = match engine.registry().compose(&shadow) {
        Value::Object(m) => m,
        _ => Map::new(),
    };
    strip_identity(&mut body);
    body.remove("draft_mode_state");
    rewrite_for_commit(engine, scope, &mut body)?;

    match engine.store().fq_name_to_uuid(type_name, &prod_fqn) {
        Ok(prod_uuid) => {
            hold_cross_refs(engine, &shadow, &prod_fqn, held)?;
            engine.internal_update(type_name, &prod_uuid, &Value::Object(body))?;
        }
        Err(StoreError::FqNameNotFound { .. }) => {
            let (ptype, puuid) = production_parent(engine, scope)?;
            hold_cross_refs(engine, &shadow, &prod_fqn, held)?;
            // The production object takes over the shadow's UUID so
            // UUID-addressed edges stay valid. The shadow row goes
            // away below the pipeline, identity lock included.
            engine.store().object_delete(type_name, shadow_uuid)?;
            engine.drop_fqn_lock(type_name, &shadow.record.fq_name_str())?;
            body.insert("uuid".to_string(), json!(shadow_uuid));
            body.insert("fq_name".to_string(), json!(prod_fqn));
            body.insert("parent_type".to_string(), json!(ptype));
            body.insert("parent_uuid".to_string(), json!(puuid));
            engine.internal_create(type_name, &Value::Object(body))?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Applies one staged delete to the production tree.
fn commit_one_delete(
    engine: &Engine,
    scope: &StoredObject,
    type_name: &str,
    shadow_uuid: &str,
) -> Result<(), ApiError> {
    let shadow = engine.store().object_read(type_name, shadow_uuid)?;
    let state = shadow
        .record
        .props
        .get("draft_mode_state")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if state != "deleted" {
        return Ok(());
    }
    let prod_fqn = production_fq_name(scope, shadow.record.name());
    match engine.store().fq_name_to_uuid(type_name, &prod_fqn) {
        Ok(prod_uuid) => engine.internal_delete(type_name, &prod_uuid).map(|_| ()),
        // Already gone; the staged delete is moot.
        Err(StoreError::FqNameNotFound { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// `POST /security-policy-draft`: commits or discards the staged set
/// for a scope, under the scope-wide draft lock.
pub fn security_policy_draft(
    engine: &Engine,
    ctx: &RequestContext,
    scope_uuid: &str,
    action: &str,
) -> Result<ApiResponse, ApiError> {
    if action != "commit" && action != "discard" {
        return Err(ApiError::MalformedRequest(format!(
            "action must be commit or discard, got {}",
            action
        )));
    }
    let (scope_type, scope_fqn) = engine.store().uuid_to_fq_name(scope_uuid)?;
    if !DRAFT_SCOPE_TYPES.contains(&scope_type.as_str()) {
        return Err(ApiError::MalformedRequest(format!(
            "{} is not a draft scope",
            scope_type
        )));
    }
    let scope = engine.store().object_read(&scope_type, scope_uuid)?;

    let locks = LockRegistry::new(engine.coord().clone(), LOCK_PREFIX);
    let lock_name = format!("security/{}/{}", scope_type, scope_fqn.join(":"));
    let _lock = locks
        .acquire(&lock_name, action, LOCK_WAIT)
        .map_err(|e| match e {
            CoordError::LockTimeout { holder, .. } => ApiError::Conflict(format!(
                "draft {} already in progress for {}",
                holder,
                scope_fqn.join(":")
            )),
            other => other.into(),
        })?;

    let Some(pm_uuid) = find_shadow_parent(engine, &scope)? else {
        return Ok(ApiResponse::ok(json!({"status": "nothing staged"})));
    };

    let mut failures: Vec<String> = Vec::new();
    let mut held: Vec<HeldRef> = Vec::new();
    if action == "commit" {
        // Creates and updates land leaf-to-root so ref targets exist
        // before their referrers.
        for type_name in SECURITY_DRAFT_TYPES {
            for uuid in shadows_of_type(engine, type_name, &pm_uuid)? {
                if let Err(e) = commit_one(engine, &scope, type_name, &uuid, &mut held) {
                    tracing::warn!("draft commit of {} {} failed: {}", type_name, uuid, e);
                    failures.push(format!("{} {}: {}", type_name, uuid, e));
                }
            }
        }
        // Deletes go root-to-leaf so referrers drop before their
        // targets.
        for type_name in SECURITY_DRAFT_TYPES.iter().rev() {
            for uuid in shadows_of_type(engine, type_name, &pm_uuid)? {
                if let Err(e) = commit_one_delete(engine, &scope, type_name, &uuid) {
                    tracing::warn!("draft delete of {} {} failed: {}", type_name, uuid, e);
                    failures.push(format!("{} {}: {}", type_name, uuid, e));
                }
            }
        }
        // Cross-scope references held off their shadows re-land on the
        // production objects.
        for h in &held {
            let relinked = engine
                .store()
                .fq_name_to_uuid(&h.to_type, &h.to_fq_name)
                .and_then(|to_uuid| {
                    engine.store().ref_update(
                        &h.from_type,
                        &h.from_uuid,
                        &h.to_type,
                        &to_uuid,
                        true,
                        &h.attr,
                    )
                });
            if let Err(e) = relinked {
                tracing::warn!(
                    "re-attach of {} {} to {} failed: {}",
                    h.from_type,
                    h.from_uuid,
                    h.to_fq_name.join(":"),
                    e
                );
                failures.push(format!(
                    "ref {} -> {}: {}",
                    h.from_uuid,
                    h.to_fq_name.join(":"),
                    e
                ));
            }
        }
    }

    // Shadows clear root-to-leaf for both actions; on partial commit
    // failure the failed shadows stay staged.
    if failures.is_empty() {
        for type_name in SECURITY_DRAFT_TYPES.iter().rev() {
            for uuid in shadows_of_type(engine, type_name, &pm_uuid)? {
                if let Err(e) = engine.internal_delete(type_name, &uuid) {
                    tracing::warn!("draft cleanup of {} {} failed: {}", type_name, uuid, e);
                    failures.push(format!("{} {}: {}", type_name, uuid, e));
                }
            }
        }
    }
    if failures.is_empty() {
        if let Err(e) = engine.internal_delete("policy-management", &pm_uuid) {
            tracing::warn!("draft parent cleanup failed: {}", e);
        }
        tracing::info!(
            request_id = %ctx.request_id,
            "draft {} for {} complete",
            action,
            scope_fqn.join(":")
        );
        Ok(ApiResponse::ok(json!({"status": "success"})))
    } else {
        Err(ApiError::Conflict(format!(
            "draft {} partially applied; still staged: {}",
            action,
            failures.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fabricd_bus::MemoryBus;
    use fabricd_coord::{CoordStore, MemoryCoordStore};
    use fabricd_store::{CacheConfig, MemoryObjectTable};

    use crate::context::{UserContext, ADMIN_ROLE};
    use crate::engine::EngineConfig;

    fn admin_ctx() -> RequestContext {
        let mut user = UserContext::default();
        user.roles.push(ADMIN_ROLE.to_string());
        user.project_id = "admin-project".to_string();
        RequestContext::new(user, &format!("req-{}", uuid::Uuid::new_v4()))
    }

    fn setup() -> (Engine, Arc<dyn CoordStore>, String) {
        let coord: Arc<dyn CoordStore> = Arc::new(MemoryCoordStore::new());
        let engine = Engine::new(
            coord.clone(),
            Arc::new(MemoryObjectTable::new()),
            Arc::new(MemoryBus::new()),
            EngineConfig::default(),
            CacheConfig::default(),
        )
        .unwrap();
        engine
            .create(&mut admin_ctx(), "domain", &json!({"fq_name": ["default-domain"]}))
            .unwrap();
        let resp = engine
            .create(
                &mut admin_ctx(),
                "project",
                &json!({
                    "fq_name": ["default-domain", "p"],
                    "parent_type": "domain",
                    "enable_security_policy_draft": true,
                }),
            )
            .unwrap();
        let project = resp.body["project"]["uuid"].as_str().unwrap().to_string();
        (engine, coord, project)
    }

    fn stage_ag(engine: &Engine, project: &str, name: &str) -> (u16, String) {
        let resp = engine
            .create(
                &mut admin_ctx(),
                "address-group",
                &json!({
                    "fq_name": ["default-domain", "p", name],
                    "parent_type": "project",
                    "parent_uuid": project,
                    "address_group_prefix": {"subnet": [{"ip_prefix": "10.0.0.0", "ip_prefix_len": 24}]},
                }),
            )
            .unwrap();
        let uuid = resp.body["address-group"]["uuid"].as_str().unwrap().to_string();
        (resp.status, uuid)
    }

    #[test]
    fn test_create_staged_as_shadow() {
        let (engine, _coord, project) = setup();
        let (status, shadow_uuid) = stage_ag(&engine, &project, "ag1");
        assert_eq!(status, 202);
        let shadow = engine
            .store()
            .object_read("address-group", &shadow_uuid)
            .unwrap();
        assert_eq!(
            shadow.record.fq_name,
            vec!["default-domain", "p", DRAFT_POLICY_NAME, "ag1"]
        );
        assert_eq!(
            shadow.record.props.get("draft_mode_state"),
            Some(&json!("created"))
        );
        // Production object does not exist yet.
        assert!(engine
            .store()
            .fq_name_to_uuid(
                "address-group",
                &["default-domain".into(), "p".into(), "ag1".into()]
            )
            .is_err());
    }

    #[test]
    fn test_commit_materializes_production() {
        let (engine, _coord, project) = setup();
        let (_, shadow_uuid) = stage_ag(&engine, &project, "ag1");
        let resp = security_policy_draft(&engine, &admin_ctx(), &project, "commit").unwrap();
        assert_eq!(resp.status, 200);
        let prod = engine
            .store()
            .fq_name_to_uuid(
                "address-group",
                &["default-domain".into(), "p".into(), "ag1".into()],
            )
            .unwrap();
        // The production object keeps the identity it was staged under.
        assert_eq!(prod, shadow_uuid);
        let obj = engine.store().object_read("address-group", &prod).unwrap();
        assert!(obj.record.props.get("draft_mode_state").is_none());
        // Shadow tree is gone.
        assert!(engine
            .store()
            .fq_name_to_uuid(
                "policy-management",
                &["default-domain".into(), "p".into(), DRAFT_POLICY_NAME.into()],
            )
            .is_err());
    }

    #[test]
    fn test_discard_drops_staged_set() {
        let (engine, _coord, project) = setup();
        stage_ag(&engine, &project, "ag1");
        security_policy_draft(&engine, &admin_ctx(), &project, "discard").unwrap();
        assert!(engine
            .store()
            .fq_name_to_uuid(
                "address-group",
                &["default-domain".into(), "p".into(), "ag1".into()],
            )
            .is_err());
        assert!(engine
            .store()
            .fq_name_to_uuid(
                "policy-management",
                &["default-domain".into(), "p".into(), DRAFT_POLICY_NAME.into()],
            )
            .is_err());
    }

    #[test]
    fn test_update_of_committed_object_stages_shadow() {
        let (engine, _coord, project) = setup();
        stage_ag(&engine, &project, "ag1");
        security_policy_draft(&engine, &admin_ctx(), &project, "commit").unwrap();
        let prod = engine
            .store()
            .fq_name_to_uuid(
                "address-group",
                &["default-domain".into(), "p".into(), "ag1".into()],
            )
            .unwrap();
        let resp = engine
            .update(
                &mut admin_ctx(),
                "address-group",
                &prod,
                &json!({"display_name": "renamed"}),
            )
            .unwrap();
        assert_eq!(resp.status, 202);
        // Production untouched until commit.
        let obj = engine.store().object_read("address-group", &prod).unwrap();
        assert!(obj.record.props.get("display_name").is_none());

        security_policy_draft(&engine, &admin_ctx(), &project, "commit").unwrap();
        let obj = engine.store().object_read("address-group", &prod).unwrap();
        assert_eq!(obj.record.props.get("display_name"), Some(&json!("renamed")));
    }

    #[test]
    fn test_delete_staged_then_committed() {
        let (engine, _coord, project) = setup();
        stage_ag(&engine, &project, "ag1");
        security_policy_draft(&engine, &admin_ctx(), &project, "commit").unwrap();
        let prod = engine
            .store()
            .fq_name_to_uuid(
                "address-group",
                &["default-domain".into(), "p".into(), "ag1".into()],
            )
            .unwrap();
        let resp = engine
            .delete(&mut admin_ctx(), "address-group", &prod)
            .unwrap();
        assert_eq!(resp.status, 202);
        assert!(engine.store().object_read("address-group", &prod).is_ok());

        security_policy_draft(&engine, &admin_ctx(), &project, "commit").unwrap();
        assert!(engine.store().object_read("address-group", &prod).is_err());
    }

    #[test]
    fn test_commit_rewrites_refs_to_production() {
        let (engine, _coord, project) = setup();
        let (_, ag_shadow) = stage_ag(&engine, &project, "ag1");
        let resp = engine
            .create(
                &mut admin_ctx(),
                "firewall-rule",
                &json!({
                    "fq_name": ["default-domain", "p", "fr1"],
                    "parent_type": "project",
                    "parent_uuid": project,
                    "address_group_refs": [{"uuid": ag_shadow}],
                    "endpoint_1": {"address_group": format!("default-domain:p:{}:ag1", DRAFT_POLICY_NAME)},
                    "direction": ">",
                }),
            )
            .unwrap();
        assert_eq!(resp.status, 202);

        security_policy_draft(&engine, &admin_ctx(), &project, "commit").unwrap();
        let fr = engine
            .store()
            .fq_name_to_uuid(
                "firewall-rule",
                &["default-domain".into(), "p".into(), "fr1".into()],
            )
            .unwrap();
        let ag = engine
            .store()
            .fq_name_to_uuid(
                "address-group",
                &["default-domain".into(), "p".into(), "ag1".into()],
            )
            .unwrap();
        let obj = engine.store().object_read("firewall-rule", &fr).unwrap();
        assert!(obj.record.refs.iter().any(|r| r.uuid == ag));
        assert_eq!(
            obj.record.props.get("endpoint_1"),
            Some(&json!({"address_group": "default-domain:p:ag1"}))
        );
    }

    #[test]
    fn test_commit_relands_cross_scope_refs() {
        let (engine, _coord, project) = setup();
        let (_, ag_shadow) = stage_ag(&engine, &project, "ag1");

        // A referrer in a scope without draft mode points straight at
        // the shadow.
        let plain = engine
            .create(
                &mut admin_ctx(),
                "project",
                &json!({
                    "fq_name": ["default-domain", "plain"],
                    "parent_type": "domain",
                }),
            )
            .unwrap()
            .body["project"]["uuid"]
            .as_str()
            .unwrap()
            .to_string();
        let fr = engine
            .create(
                &mut admin_ctx(),
                "firewall-rule",
                &json!({
                    "fq_name": ["default-domain", "plain", "fr1"],
                    "parent_type": "project",
                    "parent_uuid": plain,
                    "address_group_refs": [{"uuid": ag_shadow}],
                    "direction": ">",
                }),
            )
            .unwrap()
            .body["firewall-rule"]["uuid"]
            .as_str()
            .unwrap()
            .to_string();

        security_policy_draft(&engine, &admin_ctx(), &project, "commit").unwrap();

        let prod = engine
            .store()
            .fq_name_to_uuid(
                "address-group",
                &["default-domain".into(), "p".into(), "ag1".into()],
            )
            .unwrap();
        assert_eq!(prod, ag_shadow);
        let fr_obj = engine.store().object_read("firewall-rule", &fr).unwrap();
        assert!(fr_obj.record.refs.iter().any(|r| r.uuid == prod));
        let ag_obj = engine.store().object_read("address-group", &prod).unwrap();
        assert!(ag_obj.backrefs.iter().any(|b| b.uuid == fr));
    }

    #[test]
    fn test_commit_blocked_by_concurrent_action() {
        let (engine, coord, project) = setup();
        stage_ag(&engine, &project, "ag1");
        let locks = LockRegistry::new(coord, LOCK_PREFIX);
        let held = locks
            .acquire(
                "security/project/default-domain:p",
                "commit",
                Duration::from_millis(10),
            )
            .unwrap();
        let err =
            security_policy_draft(&engine, &admin_ctx(), &project, "discard").unwrap_err();
        assert_eq!(err.http_status(), 409);
        held.release();
        security_policy_draft(&engine, &admin_ctx(), &project, "discard").unwrap();
    }

    #[test]
    fn test_scope_without_draft_mode_passes_through() {
        let (engine, _coord, _project) = setup();
        let resp = engine
            .create(
                &mut admin_ctx(),
                "project",
                &json!({
                    "fq_name": ["default-domain", "plain"],
                    "parent_type": "domain",
                }),
            )
            .unwrap();
        let plain = resp.body["project"]["uuid"].as_str().unwrap().to_string();
        let resp = engine
            .create(
                &mut admin_ctx(),
                "address-group",
                &json!({
                    "fq_name": ["default-domain", "plain", "ag1"],
                    "parent_type": "project",
                    "parent_uuid": plain,
                }),
            )
            .unwrap();
        assert_eq!(resp.status, 200);
    }
}
