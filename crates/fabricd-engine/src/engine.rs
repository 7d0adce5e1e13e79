//! The resource lifecycle pipeline.
//!
//! Every CRUD runs an explicit phase sequence; each mutating phase
//! pushes a compensation onto the request context, and a failure in any
//! later phase unwinds them in reverse order before the error is
//! returned.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};

use fabricd_alloc::QuotaCounter;
use fabricd_bus::{BusClient, BusMessage, Oper};
use fabricd_coord::{CoordError, CoordStore};
use fabricd_store::{
    CacheConfig, ListFilter, ObjectRecord, ObjectStore, ObjectTable, PropCollectionUpdate, PropOp,
    StoreError, StoredObject,
};

use crate::allocators::Allocators;
use crate::context::{Phase, RequestContext};
use crate::draft;
use crate::error::ApiError;
use crate::hooks::{build_hooks, no_hooks, ResourceHooks};
use crate::perms::{self, Perms2};
use crate::schema::TypeRegistry;

/// Engine tuning knobs.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Age in seconds after which an FQN lock with no matching row is
    /// considered stale and may be forcibly taken over.
    pub fqn_lock_stale_secs: u64,
    /// Configured route-target minimum (below the system minimum it
    /// has no effect).
    pub rt_configured_min: u64,
    /// True when the global ASN is 4-byte.
    pub four_byte_asn: bool,
    /// Default list page size when the caller gives none.
    pub page_limit_default: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fqn_lock_stale_secs: 300,
            rt_configured_min: 0,
            four_byte_asn: false,
            page_limit_default: 256,
        }
    }
}

/// Status plus JSON body, the result of every engine operation.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse {
    /// HTTP status to send.
    pub status: u16,
    /// Response body.
    pub body: Value,
}

impl ApiResponse {
    /// A 200 response.
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    /// A 202 response for draft-staged operations.
    pub fn accepted(body: Value) -> Self {
        Self { status: 202, body }
    }
}

/// List query parameters, already parsed from the query string.
#[derive(Clone, Debug, Default)]
pub struct ListParams {
    /// Restrict to children of these parent UUIDs.
    pub parent_uuids: Vec<String>,
    /// Alternative to `parent_uuids`: resolve this FQN string.
    pub parent_fq_name_str: Option<String>,
    /// Parent type for `parent_fq_name_str` resolution.
    pub parent_type: Option<String>,
    /// Restrict to objects referenced by these UUIDs.
    pub back_ref_uuids: Vec<String>,
    /// Restrict to these UUIDs.
    pub obj_uuids: Vec<String>,
    /// FQN-string prefixes to keep.
    pub fq_name_prefixes: Vec<String>,
    /// Exact FQN strings to keep.
    pub fq_names: Vec<String>,
    /// Extra property fields to attach to non-detail entries.
    pub fields: Vec<String>,
    /// Omit `href` from non-detail entries.
    pub exclude_hrefs: bool,
    /// Property equality filters.
    pub filters: BTreeMap<String, Value>,
    /// Tag names (`type=value`) the results must carry.
    pub tags: Vec<String>,
    /// Return full object dicts.
    pub detail: bool,
    /// Return only the cardinality.
    pub count: bool,
    /// After owned objects, include objects shared with the caller.
    pub shared: bool,
    /// Opaque pagination marker from the previous page.
    pub page_marker: Option<String>,
    /// Page size.
    pub page_limit: Option<usize>,
}

/// Marker prefix for the shared-objects phase of pagination.
const SHARED_MARKER: &str = "shared:";

struct EngineInner {
    coord: Arc<dyn CoordStore>,
    store: ObjectStore,
    bus: Arc<dyn BusClient>,
    allocators: Allocators,
    registry: TypeRegistry,
    hooks: std::collections::HashMap<&'static str, Arc<dyn ResourceHooks>>,
    config: EngineConfig,
    aaa_mode: RwLock<String>,
}

/// Cheap-clone handle to the engine; undo closures and the notifier
/// hold their own.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Builds an engine over the three backends.
    pub fn new(
        coord: Arc<dyn CoordStore>,
        table: Arc<dyn ObjectTable>,
        bus: Arc<dyn BusClient>,
        config: EngineConfig,
        cache_config: CacheConfig,
    ) -> Result<Self, ApiError> {
        let allocators =
            Allocators::new(coord.clone(), config.rt_configured_min, config.four_byte_asn)?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                coord,
                store: ObjectStore::new(table, cache_config),
                bus,
                allocators,
                registry: TypeRegistry::new(),
                hooks: build_hooks(),
                config,
                aaa_mode: RwLock::new("cloud-admin".to_string()),
            }),
        })
    }

    /// A clone of this handle, for undo closures and background tasks.
    pub fn clone_handle(&self) -> Engine {
        self.clone()
    }

    /// The allocator set.
    pub fn allocators(&self) -> &Allocators {
        &self.inner.allocators
    }

    /// The object store.
    pub fn store(&self) -> &ObjectStore {
        &self.inner.store
    }

    /// The coordination store.
    pub fn coord(&self) -> &Arc<dyn CoordStore> {
        &self.inner.coord
    }

    /// The bus client.
    pub fn bus(&self) -> &Arc<dyn BusClient> {
        &self.inner.bus
    }

    /// The type registry.
    pub fn registry(&self) -> &TypeRegistry {
        &self.inner.registry
    }

    /// The engine config.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn hooks_for(&self, type_name: &str) -> Arc<dyn ResourceHooks> {
        self.inner
            .hooks
            .get(type_name)
            .cloned()
            .unwrap_or_else(no_hooks)
    }

    // ------------------------------------------------------------------
    // CREATE
    // ------------------------------------------------------------------

    /// Creates a resource. Returns 200 with the object identity, or
    /// 202 with the shadow identity when staged in a draft workspace.
    pub fn create(
        &self,
        ctx: &mut RequestContext,
        type_name: &str,
        body: &Value,
    ) -> Result<ApiResponse, ApiError> {
        ctx.enter_phase(Phase::Init);
        let rt = self.inner.registry.get(type_name)?;
        let mut record = self.inner.registry.decompose(type_name, body)?;

        if !perms::is_user_visible(&record.props) && !ctx.user.is_admin() {
            return Err(ApiError::Forbidden(
                "user_visible=false requires admin".to_string(),
            ));
        }

        ctx.enter_phase(Phase::PreDbeAlloc);
        self.resolve_refs(&mut record)?;
        self.validate_refs(&record)?;
        let hooks = self.hooks_for(type_name);
        hooks.pre_alloc(self, &record)?;
        self.resolve_and_check_parent(ctx, &mut record)?;

        // Draft redirect happens before any allocation so staging a
        // resource has no side effects outside the shadow tree.
        if rt.security_draft && !ctx.is_internal {
            if let Some(staged) = draft::stage_create(self, ctx, &record)? {
                return Ok(staged);
            }
        }

        let result = self.create_phases(ctx, &mut record, &hooks);
        match result {
            Ok(response) => {
                ctx.commit();
                Ok(response)
            }
            Err(e) => {
                ctx.run_undos();
                Err(e)
            }
        }
    }

    fn create_phases(
        &self,
        ctx: &mut RequestContext,
        record: &mut ObjectRecord,
        hooks: &Arc<dyn ResourceHooks>,
    ) -> Result<ApiResponse, ApiError> {
        ctx.enter_phase(Phase::DbeAlloc);
        if record.uuid.is_empty() {
            record.uuid = uuid::Uuid::new_v4().to_string();
        }
        self.take_fqn_lock(ctx, record)?;

        let user_visible = perms::is_user_visible(&record.props);
        record
            .props
            .entry("id_perms".to_string())
            .or_insert_with(|| perms::new_id_perms(&record.uuid, user_visible));
        let owner = self.owner_project(ctx, record);
        record.props.entry("perms2".to_string()).or_insert_with(|| {
            serde_json::to_value(Perms2::owned_by(&owner)).expect("perms2 serializes")
        });

        ctx.enter_phase(Phase::PreDbeCreate);
        hooks.pre_create(self, ctx, record)?;
        self.charge_quota(ctx, record)?;

        ctx.enter_phase(Phase::DbeCreate);
        let impacted = self.inner.store.object_create(record)?;
        {
            let engine = self.clone_handle();
            let type_name = record.type_name.clone();
            let uuid = record.uuid.clone();
            ctx.push_undo("remove persisted row", move || {
                if let Err(e) = engine.store().object_delete(&type_name, &uuid) {
                    tracing::error!("undo failed: delete {}: {}", uuid, e);
                }
            });
        }

        ctx.enter_phase(Phase::PostDbeCreate);
        let stored = self.inner.store.object_read(&record.type_name, &record.uuid)?;
        hooks.post_create(self, ctx, &stored)?;

        let msg = BusMessage::new(
            &ctx.request_id,
            Oper::Create,
            &record.type_name,
            &record.uuid,
            &record.fq_name,
        )
        .with_obj_dict(self.inner.registry.compose(&stored));
        self.inner.bus.publish(msg)?;
        self.publish_implicits(ctx, &impacted);

        Ok(ApiResponse::ok(serde_json::json!({
            record.type_name.clone(): {
                "uuid": record.uuid,
                "fq_name": record.fq_name,
                "parent_uuid": record.parent.as_ref().map(|(_, u)| u.clone()),
            }
        })))
    }

    fn take_fqn_lock(
        &self,
        ctx: &mut RequestContext,
        record: &ObjectRecord,
    ) -> Result<(), ApiError> {
        let path = self.fqn_lock_path(&record.type_name, &record.fq_name_str());
        match self.inner.coord.create(&path, &record.uuid, true) {
            Ok(()) => {}
            Err(CoordError::NodeExists(_)) => {
                let (held_uuid, stat) = self.inner.coord.get(&path)?;
                // Clock skew can make the age negative; a negative age
                // is simply not stale.
                let age_ms =
                    chrono::Utc::now().timestamp_millis().saturating_sub(stat.ctime_ms as i64);
                let stale = age_ms > (self.inner.config.fqn_lock_stale_secs as i64) * 1000;
                let row_exists = self.inner.store.object_exists(&held_uuid)?;
                if stale && !row_exists {
                    tracing::warn!("taking over stale fq_name lock {}", path);
                    self.inner.coord.delete(&path, false)?;
                    self.inner.coord.create(&path, &record.uuid, true)?;
                } else {
                    return Err(ApiError::Conflict(format!(
                        "{} {} already exists",
                        record.type_name,
                        record.fq_name_str()
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }
        let engine = self.clone_handle();
        let undo_path = path.clone();
        ctx.push_undo("release fq_name lock", move || {
            if let Err(e) = engine.coord().delete(&undo_path, false) {
                tracing::error!("undo failed: release {}: {}", undo_path, e);
            }
        });
        Ok(())
    }

    fn fqn_lock_path(&self, type_name: &str, fq_name_str: &str) -> String {
        format!("/fq-name-to-uuid/{}:{}", type_name, fq_name_str)
    }

    /// Releases an FQN lock outside the usual delete pipeline, for
    /// callers that remove rows at the store layer. Missing nodes are
    /// fine.
    pub(crate) fn drop_fqn_lock(&self, type_name: &str, fq_name_str: &str) -> Result<(), ApiError> {
        let path = self.fqn_lock_path(type_name, fq_name_str);
        match self.inner.coord.delete(&path, false) {
            Ok(()) | Err(CoordError::NodeNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn owner_project(&self, ctx: &RequestContext, record: &ObjectRecord) -> String {
        match &record.parent {
            Some((ptype, puuid)) if ptype == "project" => puuid.clone(),
            _ => ctx.user.project_id.clone(),
        }
    }

    fn charge_quota(&self, ctx: &mut RequestContext, record: &ObjectRecord) -> Result<(), ApiError> {
        let rt = self.inner.registry.get(&record.type_name)?;
        let Some(quota_key) = rt.quota_key else {
            return Ok(());
        };
        let Some((ptype, puuid)) = &record.parent else {
            return Ok(());
        };
        if ptype != "project" {
            return Ok(());
        }
        let Some(counter) = self.quota_counter(puuid, quota_key, &record.type_name)? else {
            return Ok(());
        };
        counter.charge(1)?;
        let engine = self.clone_handle();
        let puuid = puuid.clone();
        let type_name = record.type_name.clone();
        ctx.push_undo("release quota", move || {
            match engine.quota_counter(&puuid, quota_key, &type_name) {
                Ok(Some(counter)) => {
                    if let Err(e) = counter.release(1) {
                        tracing::error!("undo failed: quota release: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!("undo failed: quota counter: {}", e),
            }
        });
        Ok(())
    }

    /// Builds the quota counter for a (project, type) pair; None when
    /// the project sets no limit.
    pub fn quota_counter(
        &self,
        project_uuid: &str,
        quota_key: &'static str,
        type_name: &str,
    ) -> Result<Option<QuotaCounter>, ApiError> {
        let project = match self.inner.store.object_read("project", project_uuid) {
            Ok(p) => p,
            Err(StoreError::ObjectNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let limit = project
            .record
            .props
            .get("quota")
            .and_then(|q| q.get(quota_key))
            .and_then(Value::as_i64);
        let Some(limit) = limit else {
            return Ok(None);
        };
        // Seed with the live count so quota starts correct on first
        // use of a pre-existing project.
        let seed = self.count_children(type_name, project_uuid)?;
        Ok(Some(QuotaCounter::new(
            self.inner.coord.clone(),
            project_uuid,
            quota_key,
            limit,
            seed as u64,
        )?))
    }

    fn count_children(&self, type_name: &str, parent_uuid: &str) -> Result<usize, ApiError> {
        let filter = ListFilter {
            parent_uuids: Some(vec![parent_uuid.to_string()]),
            ..Default::default()
        };
        Ok(self.inner.store.object_list(type_name, &filter)?.entries.len())
    }

    /// Re-seeds quota counters after a project's quota map changed.
    pub fn quota_reinitialize(
        &self,
        project_uuid: &str,
        quota: &Map<String, Value>,
    ) -> Result<(), ApiError> {
        for type_name in self.inner.registry.type_names() {
            let rt = self.inner.registry.get(type_name)?;
            let Some(key) = rt.quota_key else { continue };
            if !quota.contains_key(key) {
                continue;
            }
            let Some(limit) = quota.get(key).and_then(Value::as_i64) else {
                continue;
            };
            let count = self.count_children(type_name, project_uuid)? as u64;
            let counter = QuotaCounter::new(
                self.inner.coord.clone(),
                project_uuid,
                key,
                limit,
                count,
            )?;
            counter.reinitialize(count)?;
            tracing::info!(
                "reinitialized quota {}/{} to {} (limit {})",
                project_uuid,
                key,
                count,
                limit
            );
        }
        Ok(())
    }

    fn resolve_refs(&self, record: &mut ObjectRecord) -> Result<(), ApiError> {
        for r in &mut record.refs {
            if let Some(fqn) = r.uuid.strip_prefix("fqn:") {
                let components: Vec<String> = fqn.split(':').map(str::to_string).collect();
                r.uuid = self.inner.store.fq_name_to_uuid(&r.type_name, &components)?;
            }
        }
        Ok(())
    }

    /// Every ref target must exist and not be pending delete in a
    /// draft workspace.
    fn validate_refs(&self, record: &ObjectRecord) -> Result<(), ApiError> {
        for r in &record.refs {
            let target = self.inner.store.object_read(&r.type_name, &r.uuid)?;
            let pending = target
                .record
                .props
                .get("draft_mode_state")
                .and_then(Value::as_str)
                == Some("deleted");
            if pending {
                return Err(ApiError::MalformedRequest(format!(
                    "cannot reference {} {}: pending delete",
                    r.type_name, r.uuid
                )));
            }
        }
        Ok(())
    }

    fn resolve_and_check_parent(
        &self,
        ctx: &RequestContext,
        record: &mut ObjectRecord,
    ) -> Result<(), ApiError> {
        let Some((ptype, puuid)) = record.parent.clone() else {
            return Ok(());
        };
        let puuid = if puuid.is_empty() {
            if record.fq_name.len() < 2 {
                return Err(ApiError::MalformedRequest(
                    "cannot derive parent from fq_name".to_string(),
                ));
            }
            let parent_fqn = record.fq_name[..record.fq_name.len() - 1].to_vec();
            self.inner.store.fq_name_to_uuid(&ptype, &parent_fqn)?
        } else {
            puuid
        };
        let parent = self.inner.store.object_read(&ptype, &puuid)?;
        if !ctx.is_internal {
            let p2 = perms::perms2_of(parent.record.props.get("perms2"));
            if !p2.write_allowed(&ctx.user) {
                return Err(ApiError::Forbidden(format!(
                    "no write permission on parent {}",
                    puuid
                )));
            }
        }
        record.parent = Some((ptype, puuid));
        Ok(())
    }

    fn publish_implicits(&self, ctx: &RequestContext, impacted: &[String]) {
        for uuid in impacted {
            match self.inner.store.uuid_to_fq_name(uuid) {
                Ok((type_name, fq_name)) => {
                    let msg = BusMessage::new(
                        &ctx.request_id,
                        Oper::UpdateImplicit,
                        &type_name,
                        uuid,
                        &fq_name,
                    );
                    if let Err(e) = self.inner.bus.publish(msg) {
                        tracing::error!("implicit publish for {} failed: {}", uuid, e);
                    }
                }
                // Deleted in the interim; nothing to invalidate.
                Err(StoreError::ObjectNotFound(_)) => {}
                Err(e) => tracing::error!("implicit publish for {} failed: {}", uuid, e),
            }
        }
    }

    // ------------------------------------------------------------------
    // READ
    // ------------------------------------------------------------------

    /// Reads a resource; honors `If-None-Match` with a 304.
    pub fn read(
        &self,
        ctx: &RequestContext,
        type_name: &str,
        uuid: &str,
        if_none_match: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        self.inner.registry.get(type_name)?;
        let obj = self.inner.store.object_read(type_name, uuid)?;
        if !ctx.user.is_admin() {
            let p2 = perms::perms2_of(obj.record.props.get("perms2"));
            if !p2.read_allowed(&ctx.user) {
                return Err(ApiError::Forbidden(format!("no read access to {}", uuid)));
            }
        }
        let etag = format!("\"{}\"", obj.last_modified);
        if if_none_match == Some(etag.as_str()) {
            return Ok(ApiResponse {
                status: 304,
                body: Value::Null,
            });
        }
        Ok(ApiResponse::ok(serde_json::json!({
            type_name: self.inner.registry.compose(&obj)
        })))
    }

    // ------------------------------------------------------------------
    // UPDATE
    // ------------------------------------------------------------------

    /// Updates a resource with partial-merge semantics.
    pub fn update(
        &self,
        ctx: &mut RequestContext,
        type_name: &str,
        uuid: &str,
        body: &Value,
    ) -> Result<ApiResponse, ApiError> {
        ctx.enter_phase(Phase::PendingDbeUpdate);
        let rt = self.inner.registry.get(type_name)?;
        let prev = self.inner.store.object_read(type_name, uuid)?;

        if !ctx.is_internal && !ctx.user.is_admin() {
            let p2 = perms::perms2_of(prev.record.props.get("perms2"));
            if !p2.write_allowed(&ctx.user) {
                return Err(ApiError::Forbidden(format!("no write access to {}", uuid)));
            }
        }

        // Draft redirect: updates to a committed security resource in a
        // draft-enabled scope land on its shadow instead.
        if rt.security_draft && !ctx.is_internal {
            if let Some(staged) = draft::stage_update(self, ctx, &prev, body)? {
                return Ok(staged);
            }
        }

        ctx.enter_phase(Phase::PreDbeUpdate);
        let mut record = self.merge_for_update(&prev, body)?;
        self.resolve_refs(&mut record)?;
        self.validate_refs(&record)?;
        let hooks = self.hooks_for(type_name);
        hooks.pre_update(self, ctx, &prev, &mut record)?;

        let result = (|| -> Result<ApiResponse, ApiError> {
            ctx.enter_phase(Phase::DbeUpdate);
            let impacted = self.inner.store.object_update(&record)?;

            ctx.enter_phase(Phase::PostDbeUpdate);
            let stored = self.inner.store.object_read(type_name, uuid)?;
            hooks.post_update(self, ctx, &prev, &stored)?;

            let msg = BusMessage::new(&ctx.request_id, Oper::Update, type_name, uuid, &record.fq_name);
            self.inner.bus.publish(msg)?;
            self.publish_implicits(ctx, &impacted);
            Ok(ApiResponse::ok(serde_json::json!({
                type_name: {"uuid": uuid, "fq_name": record.fq_name}
            })))
        })();

        match result {
            Ok(r) => {
                ctx.commit();
                Ok(r)
            }
            Err(e) => {
                ctx.run_undos();
                Err(e)
            }
        }
    }

    /// Overlays the request body on the stored object and re-runs
    /// decomposition so validation covers the merged state.
    fn merge_for_update(
        &self,
        prev: &StoredObject,
        body: &Value,
    ) -> Result<ObjectRecord, ApiError> {
        let mut merged = match self.inner.registry.compose(prev) {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        // Derived fields never round-trip through decompose.
        merged.remove("last_modified");
        let keys: Vec<String> = merged
            .keys()
            .filter(|k| k.ends_with("_back_refs"))
            .cloned()
            .collect();
        for k in keys {
            merged.remove(&k);
        }
        let overlay = body
            .as_object()
            .ok_or_else(|| ApiError::MalformedRequest("body must be an object".to_string()))?;
        for (k, v) in overlay {
            match k.as_str() {
                "uuid" | "fq_name" | "parent_type" | "parent_uuid" => continue,
                _ => {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        let mut record = self
            .inner
            .registry
            .decompose(&prev.record.type_name, &Value::Object(merged))?;
        record.uuid = prev.record.uuid.clone();
        record.fq_name = prev.record.fq_name.clone();
        record.parent = prev.record.parent.clone();
        Ok(record)
    }

    // ------------------------------------------------------------------
    // DELETE
    // ------------------------------------------------------------------

    /// Deletes a resource after its preconditions hold.
    pub fn delete(
        &self,
        ctx: &mut RequestContext,
        type_name: &str,
        uuid: &str,
    ) -> Result<ApiResponse, ApiError> {
        ctx.enter_phase(Phase::PendingDbeDelete);
        let rt = self.inner.registry.get(type_name)?;
        let obj = self.inner.store.object_read(type_name, uuid)?;

        if let Some((ptype, puuid)) = &obj.record.parent {
            if !ctx.is_internal && !ctx.user.is_admin() {
                let parent = self.inner.store.object_read(ptype, puuid)?;
                let p2 = perms::perms2_of(parent.record.props.get("perms2"));
                if !p2.write_allowed(&ctx.user) {
                    return Err(ApiError::Forbidden(format!(
                        "no delete permission under parent {}",
                        puuid
                    )));
                }
            }
        }

        let default_children = rt.default_children;
        let non_default: Vec<&(String, String)> = obj
            .children
            .iter()
            .filter(|(ctype, _)| !default_children.contains(&ctype.as_str()))
            .collect();
        if !non_default.is_empty() {
            return Err(ApiError::Conflict(format!(
                "cannot delete {}: children {:?} exist",
                uuid,
                non_default
                    .iter()
                    .map(|(t, u)| format!("{}:{}", t, u))
                    .collect::<Vec<_>>()
            )));
        }
        let blocking = obj.blocking_backrefs();
        if !blocking.is_empty() {
            return Err(ApiError::Conflict(format!(
                "cannot delete {}: back-refs from {:?} exist",
                uuid,
                blocking.iter().map(|b| b.uuid.clone()).collect::<Vec<_>>()
            )));
        }

        if rt.security_draft && !ctx.is_internal {
            if let Some(staged) = draft::stage_delete(self, ctx, &obj)? {
                return Ok(staged);
            }
        }

        ctx.enter_phase(Phase::PreDbeDelete);
        let hooks = self.hooks_for(type_name);
        hooks.pre_delete(self, ctx, &obj)?;

        // Default children go first, depth-first through the same
        // pipeline under the service account.
        for (ctype, cuuid) in &obj.children {
            if default_children.contains(&ctype.as_str()) {
                let mut inner_ctx = RequestContext::internal(&ctx.request_id);
                self.delete(&mut inner_ctx, ctype, cuuid)?;
            }
        }

        ctx.enter_phase(Phase::DbeDelete);
        let impacted = self.inner.store.object_delete(type_name, uuid)?;

        ctx.enter_phase(Phase::PostDbeDelete);
        if let Some((ptype, puuid)) = &obj.record.parent {
            if ptype == "project" {
                if let Some(quota_key) = rt.quota_key {
                    if let Some(counter) = self.quota_counter(puuid, quota_key, type_name)? {
                        counter.release(1)?;
                    }
                }
            }
        }
        hooks.post_delete(self, ctx, &obj)?;

        let msg = BusMessage::new(&ctx.request_id, Oper::Delete, type_name, uuid, &obj.record.fq_name)
            .with_obj_dict(self.inner.registry.compose(&obj));
        self.inner.bus.publish(msg)?;
        self.publish_implicits(ctx, &impacted);

        let lock = self.fqn_lock_path(type_name, &obj.record.fq_name_str());
        match self.inner.coord.delete(&lock, false) {
            Ok(()) | Err(CoordError::NodeNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        ctx.commit();
        Ok(ApiResponse::ok(Value::Null))
    }

    // ------------------------------------------------------------------
    // LIST
    // ------------------------------------------------------------------

    /// Lists resources of a type per the query parameters.
    pub fn list(
        &self,
        ctx: &RequestContext,
        type_name: &str,
        params: &ListParams,
    ) -> Result<ApiResponse, ApiError> {
        let rt = self.inner.registry.get(type_name)?;

        let mut parent_uuids = params.parent_uuids.clone();
        if let Some(pfqn) = &params.parent_fq_name_str {
            let ptype = params.parent_type.as_deref().ok_or_else(|| {
                ApiError::MalformedRequest(
                    "parent_fq_name_str requires parent_type".to_string(),
                )
            })?;
            let components: Vec<String> = pfqn.split(':').map(str::to_string).collect();
            parent_uuids.push(self.inner.store.fq_name_to_uuid(ptype, &components)?);
        }

        let (marker_shared, start) = match &params.page_marker {
            Some(m) => match m.strip_prefix(SHARED_MARKER) {
                Some(rest) => (true, Some(rest.to_string())),
                None => (false, Some(m.clone())),
            },
            None => (false, None),
        };
        let limit = if params.count {
            None
        } else {
            Some(params.page_limit.unwrap_or(self.inner.config.page_limit_default))
        };

        let filter = ListFilter {
            parent_uuids: (!parent_uuids.is_empty()).then_some(parent_uuids),
            back_ref_uuids: (!params.back_ref_uuids.is_empty())
                .then(|| params.back_ref_uuids.clone()),
            obj_uuids: (!params.obj_uuids.is_empty()).then(|| params.obj_uuids.clone()),
            prop_filters: params.filters.clone(),
            paginate_start: if marker_shared { None } else { start.clone() },
            paginate_count: None,
        };

        let mut owned = Vec::new();
        let mut shared = Vec::new();
        let listed = self.inner.store.object_list(type_name, &filter)?;
        for (fq_name, uuid) in listed.entries {
            let Ok(obj) = self.inner.store.object_read(type_name, &uuid) else {
                continue;
            };
            if !self.list_match(&obj, params) {
                continue;
            }
            let visible = perms::is_user_visible(&obj.record.props);
            if ctx.user.is_admin() {
                owned.push((fq_name, uuid, obj));
                continue;
            }
            if !visible {
                continue;
            }
            let p2 = perms::perms2_of(obj.record.props.get("perms2"));
            if p2.owner == ctx.user.project_id {
                if p2.read_allowed(&ctx.user) {
                    owned.push((fq_name, uuid, obj));
                }
            } else if params.shared && p2.read_allowed(&ctx.user) {
                shared.push((fq_name, uuid, obj));
            }
        }

        if params.count {
            return Ok(ApiResponse::ok(serde_json::json!({
                rt.plural: {"count": owned.len() + shared.len()}
            })));
        }

        // Owned objects paginate first; a shared-prefixed marker
        // resumes within the shared set.
        let mut entries: Vec<(bool, (Vec<String>, String, StoredObject))> = Vec::new();
        if !marker_shared {
            entries.extend(owned.into_iter().map(|e| (false, e)));
        }
        for e in shared {
            if let Some(s) = &start {
                if marker_shared && e.1.as_str() <= s.as_str() {
                    continue;
                }
            }
            entries.push((true, e));
        }

        let limit = limit.unwrap_or(usize::MAX);
        let mut next_marker = None;
        if entries.len() > limit {
            let (is_shared, (_, last_uuid, _)) = &entries[limit - 1];
            next_marker = Some(if *is_shared {
                format!("{}{}", SHARED_MARKER, last_uuid)
            } else {
                last_uuid.clone()
            });
            entries.truncate(limit);
        }

        let rendered: Vec<Value> = entries
            .iter()
            .map(|(_, (fq_name, uuid, obj))| {
                if params.detail {
                    return self.inner.registry.compose(obj);
                }
                let mut entry = serde_json::json!({"fq_name": fq_name, "uuid": uuid});
                if !params.exclude_hrefs {
                    entry["href"] = Value::String(format!("/{}/{}", type_name, uuid));
                }
                for field in &params.fields {
                    if let Some(v) = obj.record.props.get(field) {
                        entry[field] = v.clone();
                    }
                }
                entry
            })
            .collect();
        let mut body = serde_json::json!({ rt.plural: rendered });
        if let Some(marker) = next_marker {
            body["marker"] = Value::String(marker);
        }
        Ok(ApiResponse::ok(body))
    }

    fn list_match(&self, obj: &StoredObject, params: &ListParams) -> bool {
        if !params.fq_name_prefixes.is_empty() {
            let fqn = obj.record.fq_name_str();
            if !params.fq_name_prefixes.iter().any(|p| fqn.starts_with(p.as_str())) {
                return false;
            }
        }
        if !params.fq_names.is_empty() {
            let fqn = obj.record.fq_name_str();
            if !params.fq_names.iter().any(|f| f == &fqn) {
                return false;
            }
        }
        if !params.tags.is_empty() {
            let tags_of: Vec<String> = obj
                .record
                .refs
                .iter()
                .filter(|r| r.type_name == "tag")
                .filter_map(|r| {
                    self.inner
                        .store
                        .uuid_to_fq_name(&r.uuid)
                        .ok()
                        .and_then(|(_, f)| f.last().cloned())
                })
                .collect();
            if !params.tags.iter().all(|t| tags_of.contains(t)) {
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Name/ID actions
    // ------------------------------------------------------------------

    /// `/fqname-to-id` action.
    pub fn fq_name_to_id(
        &self,
        type_name: &str,
        fq_name: &[String],
    ) -> Result<ApiResponse, ApiError> {
        self.inner.registry.get(type_name)?;
        let uuid = self.inner.store.fq_name_to_uuid(type_name, fq_name)?;
        Ok(ApiResponse::ok(serde_json::json!({"uuid": uuid})))
    }

    /// `/id-to-fqname` action.
    pub fn id_to_fq_name(&self, uuid: &str) -> Result<ApiResponse, ApiError> {
        let (type_name, fq_name) = self.inner.store.uuid_to_fq_name(uuid)?;
        Ok(ApiResponse::ok(
            serde_json::json!({"type": type_name, "fq_name": fq_name}),
        ))
    }

    // ------------------------------------------------------------------
    // Ref actions
    // ------------------------------------------------------------------

    /// `/ref-update` action: atomic add/delete of one reference.
    #[allow(clippy::too_many_arguments)]
    pub fn ref_update(
        &self,
        ctx: &RequestContext,
        type_name: &str,
        uuid: &str,
        ref_type: &str,
        ref_uuid: Option<&str>,
        ref_fq_name: Option<&[String]>,
        operation: &str,
        attr: &Value,
    ) -> Result<ApiResponse, ApiError> {
        let rt = self.inner.registry.get(type_name)?;
        self.inner.registry.get(ref_type)?;
        if !rt.ref_types.contains(&ref_type) {
            return Err(ApiError::MalformedRequest(format!(
                "{} cannot reference {}",
                type_name, ref_type
            )));
        }
        let add = match operation {
            "ADD" => true,
            "DELETE" => false,
            other => {
                return Err(ApiError::MalformedRequest(format!(
                    "operation must be ADD or DELETE, got {}",
                    other
                )))
            }
        };
        let obj = self.inner.store.object_read(type_name, uuid)?;
        if !ctx.user.is_admin() {
            let p2 = perms::perms2_of(obj.record.props.get("perms2"));
            if !p2.write_allowed(&ctx.user) {
                return Err(ApiError::Forbidden(format!("no write access to {}", uuid)));
            }
        }
        let target_uuid = match ref_uuid {
            Some(u) => u.to_string(),
            None => {
                let fqn = ref_fq_name.ok_or_else(|| {
                    ApiError::MalformedRequest("ref-uuid or ref-fq-name required".to_string())
                })?;
                self.inner.store.fq_name_to_uuid(ref_type, fqn)?
            }
        };
        self.inner
            .store
            .ref_update(type_name, uuid, ref_type, &target_uuid, add, attr)?;

        let msg = BusMessage::new(&ctx.request_id, Oper::Update, type_name, uuid, &obj.record.fq_name);
        self.inner.bus.publish(msg)?;
        self.publish_implicits(ctx, std::slice::from_ref(&target_uuid));
        Ok(ApiResponse::ok(serde_json::json!({"uuid": uuid})))
    }

    /// `/ref-relax-for-delete` action: lets `ref_uuid` be deleted even
    /// though `uuid` still references it.
    pub fn ref_relax_for_delete(
        &self,
        ctx: &RequestContext,
        uuid: &str,
        ref_uuid: &str,
    ) -> Result<ApiResponse, ApiError> {
        let _ = ctx;
        self.inner.store.relax_backref(uuid, ref_uuid)?;
        Ok(ApiResponse::ok(serde_json::json!({"uuid": uuid})))
    }

    // ------------------------------------------------------------------
    // Prop collections
    // ------------------------------------------------------------------

    /// `/prop-collection-get` action.
    pub fn prop_collection_get(
        &self,
        uuid: &str,
        fields: &[String],
    ) -> Result<ApiResponse, ApiError> {
        let (type_name, _) = self.inner.store.uuid_to_fq_name(uuid)?;
        let values = self.inner.store.prop_collection_read(&type_name, uuid, fields)?;
        Ok(ApiResponse::ok(serde_json::to_value(values).expect("map serializes")))
    }

    /// `/prop-collection-update` action.
    pub fn prop_collection_update(
        &self,
        ctx: &RequestContext,
        uuid: &str,
        updates: &Value,
    ) -> Result<ApiResponse, ApiError> {
        let (type_name, fq_name) = self.inner.store.uuid_to_fq_name(uuid)?;
        let obj = self.inner.store.object_read(&type_name, uuid)?;
        if !ctx.user.is_admin() {
            let p2 = perms::perms2_of(obj.record.props.get("perms2"));
            if !p2.write_allowed(&ctx.user) {
                return Err(ApiError::Forbidden(format!("no write access to {}", uuid)));
            }
        }
        let entries = updates.as_array().ok_or_else(|| {
            ApiError::MalformedRequest("updates must be a list".to_string())
        })?;
        let mut parsed = Vec::with_capacity(entries.len());
        for entry in entries {
            parsed.push(parse_prop_update(entry)?);
        }
        self.inner
            .store
            .prop_collection_update(&type_name, uuid, &parsed)?;
        let msg = BusMessage::new(&ctx.request_id, Oper::Update, &type_name, uuid, &fq_name);
        self.inner.bus.publish(msg)?;
        Ok(ApiResponse::ok(serde_json::json!({"uuid": uuid})))
    }

    // ------------------------------------------------------------------
    // User-agent K/V
    // ------------------------------------------------------------------

    /// `/useragent-kv` action.
    pub fn useragent_kv(
        &self,
        operation: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        match operation {
            "STORE" => {
                self.inner
                    .store
                    .useragent_kv_store(key, value.unwrap_or_default())?;
                Ok(ApiResponse::ok(Value::Null))
            }
            "RETRIEVE" => {
                let value = self
                    .inner
                    .store
                    .useragent_kv_retrieve(key)?
                    .ok_or_else(|| ApiError::NotFound(format!("key {} not found", key)))?;
                Ok(ApiResponse::ok(serde_json::json!({"value": value})))
            }
            "DELETE" => {
                self.inner.store.useragent_kv_delete(key)?;
                Ok(ApiResponse::ok(Value::Null))
            }
            other => Err(ApiError::MalformedRequest(format!(
                "bad useragent-kv operation {}",
                other
            ))),
        }
    }

    // ------------------------------------------------------------------
    // IP alloc/free actions
    // ------------------------------------------------------------------

    /// `POST /virtual-network/<uuid>/ip-alloc`.
    pub fn ip_alloc(
        &self,
        vn_uuid: &str,
        subnet: &str,
        count: usize,
    ) -> Result<ApiResponse, ApiError> {
        let vn = self.inner.store.object_read("virtual-network", vn_uuid)?;
        let fqn = vn.record.fq_name_str();
        let alloc = match self.inner.allocators.subnet_get(&fqn, subnet) {
            Some(a) => a,
            None => self
                .inner
                .allocators
                .subnet(fabricd_alloc::SubnetConfig::new(&fqn, subnet))?,
        };
        let mut addrs = Vec::with_capacity(count);
        for _ in 0..count {
            match alloc.alloc_from_pools(&fqn, None, None) {
                Ok(a) => addrs.push(a.to_string()),
                Err(e) => {
                    // Partial allocation rolls back.
                    for a in &addrs {
                        if let Ok(ip) = a.parse() {
                            let _ = alloc.free(ip);
                        }
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(ApiResponse::ok(serde_json::json!({"ip_addr": addrs})))
    }

    /// `POST /virtual-network/<uuid>/ip-free`.
    pub fn ip_free(
        &self,
        vn_uuid: &str,
        subnet: &str,
        addrs: &[String],
    ) -> Result<ApiResponse, ApiError> {
        let vn = self.inner.store.object_read("virtual-network", vn_uuid)?;
        let fqn = vn.record.fq_name_str();
        let alloc = self
            .inner
            .allocators
            .subnet_get(&fqn, subnet)
            .ok_or_else(|| ApiError::NotFound(format!("subnet {} not found", subnet)))?;
        for addr in addrs {
            let ip = addr
                .parse()
                .map_err(|_| ApiError::MalformedRequest(format!("bad address {}", addr)))?;
            alloc.free(ip)?;
        }
        Ok(ApiResponse::ok(Value::Null))
    }

    // ------------------------------------------------------------------
    // Ownership and mode actions
    // ------------------------------------------------------------------

    /// `/chown` action.
    pub fn chown(
        &self,
        ctx: &RequestContext,
        uuid: &str,
        owner: &str,
    ) -> Result<ApiResponse, ApiError> {
        let (type_name, _) = self.inner.store.uuid_to_fq_name(uuid)?;
        let obj = self.inner.store.object_read(&type_name, uuid)?;
        let mut p2 = perms::perms2_of(obj.record.props.get("perms2"));
        if !ctx.user.is_admin() && !p2.write_allowed(&ctx.user) {
            return Err(ApiError::Forbidden(format!("no write access to {}", uuid)));
        }
        p2.owner = owner.to_string();
        let mut record = obj.record.clone();
        record.props.insert(
            "perms2".to_string(),
            serde_json::to_value(&p2).expect("perms2 serializes"),
        );
        self.inner.store.object_update(&record)?;
        Ok(ApiResponse::ok(Value::Null))
    }

    /// `/chmod` action: rewrites access bits and shares.
    pub fn chmod(
        &self,
        ctx: &RequestContext,
        uuid: &str,
        changes: &Value,
    ) -> Result<ApiResponse, ApiError> {
        let (type_name, _) = self.inner.store.uuid_to_fq_name(uuid)?;
        let obj = self.inner.store.object_read(&type_name, uuid)?;
        let mut p2 = perms::perms2_of(obj.record.props.get("perms2"));
        if !ctx.user.is_admin() && !p2.write_allowed(&ctx.user) {
            return Err(ApiError::Forbidden(format!("no write access to {}", uuid)));
        }
        if let Some(v) = changes.get("owner_access").and_then(Value::as_u64) {
            p2.owner_access = v as u8;
        }
        if let Some(v) = changes.get("global_access").and_then(Value::as_u64) {
            p2.global_access = v as u8;
        }
        if let Some(share) = changes.get("share") {
            p2.share = serde_json::from_value(share.clone())
                .map_err(|e| ApiError::MalformedRequest(format!("bad share list: {}", e)))?;
        }
        let mut record = obj.record.clone();
        record.props.insert(
            "perms2".to_string(),
            serde_json::to_value(&p2).expect("perms2 serializes"),
        );
        self.inner.store.object_update(&record)?;
        Ok(ApiResponse::ok(Value::Null))
    }

    /// `/obj-perms` action: the caller's effective access to an object.
    pub fn obj_perms(&self, ctx: &RequestContext, uuid: &str) -> Result<ApiResponse, ApiError> {
        let (type_name, _) = self.inner.store.uuid_to_fq_name(uuid)?;
        let obj = self.inner.store.object_read(&type_name, uuid)?;
        let p2 = perms::perms2_of(obj.record.props.get("perms2"));
        let mut rights = String::new();
        if p2.read_allowed(&ctx.user) {
            rights.push('R');
        }
        if p2.write_allowed(&ctx.user) {
            rights.push('W');
        }
        Ok(ApiResponse::ok(serde_json::json!({"permissions": rights})))
    }

    /// `/aaa-mode` read.
    pub fn aaa_mode(&self) -> String {
        self.inner.aaa_mode.read().expect("lock poisoned").clone()
    }

    /// `/aaa-mode` update; admin only.
    pub fn set_aaa_mode(&self, ctx: &RequestContext, mode: &str) -> Result<ApiResponse, ApiError> {
        if !ctx.user.is_admin() {
            return Err(ApiError::Forbidden("aaa-mode change requires admin".to_string()));
        }
        if !["no-auth", "cloud-admin", "rbac"].contains(&mode) {
            return Err(ApiError::MalformedRequest(format!("bad aaa-mode {}", mode)));
        }
        *self.inner.aaa_mode.write().expect("lock poisoned") = mode.to_string();
        Ok(ApiResponse::ok(serde_json::json!({"aaa-mode": mode})))
    }

    // ------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------

    /// `/set-tag` action: points the object's tag refs of each given
    /// type at the named tag, replacing previous refs of that type.
    pub fn set_tag(
        &self,
        ctx: &RequestContext,
        type_name: &str,
        uuid: &str,
        tags: &Map<String, Value>,
    ) -> Result<ApiResponse, ApiError> {
        let obj = self.inner.store.object_read(type_name, uuid)?;
        for (tag_type, spec) in tags {
            let value = spec
                .get("value")
                .and_then(Value::as_str)
                .ok_or_else(|| ApiError::MalformedRequest(format!("tag {} needs value", tag_type)))?;
            let tag_name = format!("{}={}", tag_type, value);
            let is_global = spec.get("is_global").and_then(Value::as_bool).unwrap_or(false);
            let tag_fqn: Vec<String> = if is_global || obj.record.fq_name.len() < 2 {
                vec![tag_name.clone()]
            } else {
                let mut f = obj.record.fq_name[..obj.record.fq_name.len() - 1].to_vec();
                f.push(tag_name.clone());
                f
            };
            let tag_uuid = self.inner.store.fq_name_to_uuid("tag", &tag_fqn)?;

            // Drop previous tag of the same type, then attach the new
            // one.
            for r in &obj.record.refs {
                if r.type_name != "tag" {
                    continue;
                }
                if let Ok((_, f)) = self.inner.store.uuid_to_fq_name(&r.uuid) {
                    let is_same_type = f
                        .last()
                        .map(|n| n.starts_with(&format!("{}=", tag_type)))
                        .unwrap_or(false);
                    if is_same_type && r.uuid != tag_uuid {
                        self.ref_update(
                            ctx,
                            type_name,
                            uuid,
                            "tag",
                            Some(&r.uuid),
                            None,
                            "DELETE",
                            &Value::Null,
                        )?;
                    }
                }
            }
            self.ref_update(
                ctx,
                type_name,
                uuid,
                "tag",
                Some(&tag_uuid),
                None,
                "ADD",
                &Value::Null,
            )?;
        }
        Ok(ApiResponse::ok(serde_json::json!({"uuid": uuid})))
    }

    // ------------------------------------------------------------------
    // Internal requests
    // ------------------------------------------------------------------

    /// Creates a resource on behalf of the engine itself.
    pub fn internal_create(&self, type_name: &str, body: &Value) -> Result<ApiResponse, ApiError> {
        let mut ctx = RequestContext::internal(&format!("int-{}", uuid::Uuid::new_v4()));
        self.create(&mut ctx, type_name, body)
    }

    /// Updates a resource on behalf of the engine itself.
    pub fn internal_update(
        &self,
        type_name: &str,
        uuid: &str,
        body: &Value,
    ) -> Result<ApiResponse, ApiError> {
        let mut ctx = RequestContext::internal(&format!("int-{}", uuid::Uuid::new_v4()));
        self.update(&mut ctx, type_name, uuid, body)
    }

    /// Deletes a resource on behalf of the engine itself.
    pub fn internal_delete(&self, type_name: &str, uuid: &str) -> Result<ApiResponse, ApiError> {
        let mut ctx = RequestContext::internal(&format!("int-{}", uuid::Uuid::new_v4()));
        self.delete(&mut ctx, type_name, uuid)
    }

    /// Dispatches a bus message to the per-type notification handler.
    /// A missing subject is logged and ignored (re-deleted interim).
    pub fn dispatch_notification(&self, msg: &BusMessage) {
        self.inner.store.evict(&msg.uuid);
        let hooks = self.hooks_for(&msg.type_name);
        hooks.on_notification(self, msg);
    }
}

fn parse_prop_update(entry: &Value) -> Result<PropCollectionUpdate, ApiError> {
    let field = entry
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::MalformedRequest("update needs field".to_string()))?
        .to_string();
    let operation = entry
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::MalformedRequest("update needs operation".to_string()))?;
    let value = entry.get("value").cloned().unwrap_or(Value::Null);
    let position = entry.get("position").and_then(Value::as_u64).map(|p| p as u32);
    let key = entry.get("key").and_then(Value::as_str).map(str::to_string);
    let op = match (operation, key) {
        ("add", None) => PropOp::ListAdd { position, value },
        ("modify", None) => PropOp::ListModify {
            position: position.ok_or_else(|| {
                ApiError::MalformedRequest("modify needs position".to_string())
            })?,
            value,
        },
        ("delete", None) => PropOp::ListDelete {
            position: position.ok_or_else(|| {
                ApiError::MalformedRequest("delete needs position".to_string())
            })?,
        },
        ("set", Some(key)) => PropOp::MapSet { key, value },
        ("delete", Some(key)) => PropOp::MapDelete { key },
        (other, _) => {
            return Err(ApiError::MalformedRequest(format!(
                "bad prop-collection operation {}",
                other
            )))
        }
    };
    Ok(PropCollectionUpdate { field, op })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UserContext;
    use fabricd_bus::MemoryBus;
    use fabricd_coord::MemoryCoordStore;
    use fabricd_store::MemoryObjectTable;
    use serde_json::json;

    pub(crate) fn test_engine() -> Engine {
        Engine::new(
            Arc::new(MemoryCoordStore::new()),
            Arc::new(MemoryObjectTable::new()),
            Arc::new(MemoryBus::new()),
            EngineConfig::default(),
            CacheConfig::default(),
        )
        .unwrap()
    }

    pub(crate) fn admin_ctx() -> RequestContext {
        let mut user = UserContext::default();
        user.roles.push(crate::context::ADMIN_ROLE.to_string());
        user.project_id = "admin-project".to_string();
        RequestContext::new(user, &format!("req-{}", uuid::Uuid::new_v4()))
    }

    pub(crate) fn create_project(engine: &Engine, name: &str) -> String {
        let mut ctx = admin_ctx();
        let resp = engine
            .create(
                &mut ctx,
                "project",
                &json!({
                    "fq_name": ["default-domain", name],
                    "parent_type": "domain",
                }),
            )
            .unwrap();
        resp.body["project"]["uuid"].as_str().unwrap().to_string()
    }

    pub(crate) fn setup_domain(engine: &Engine) {
        let mut ctx = admin_ctx();
        engine
            .create(&mut ctx, "domain", &json!({"fq_name": ["default-domain"]}))
            .unwrap();
    }

    #[test]
    fn test_create_read_delete_cycle() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        let mut ctx = admin_ctx();
        let resp = engine
            .create(
                &mut ctx,
                "virtual-network",
                &json!({
                    "fq_name": ["default-domain", "p", "vn1"],
                    "parent_type": "project",
                    "parent_uuid": project,
                }),
            )
            .unwrap();
        assert_eq!(resp.status, 200);
        let uuid = resp.body["virtual-network"]["uuid"].as_str().unwrap().to_string();

        let read = engine.read(&admin_ctx(), "virtual-network", &uuid, None).unwrap();
        assert_eq!(read.body["virtual-network"]["fq_name"][2], json!("vn1"));
        // VN hook allocated an id.
        assert_eq!(
            read.body["virtual-network"]["virtual_network_network_id"],
            json!(1)
        );

        let mut ctx = admin_ctx();
        engine.delete(&mut ctx, "virtual-network", &uuid).unwrap();
        assert!(engine.read(&admin_ctx(), "virtual-network", &uuid, None).is_err());
    }

    #[test]
    fn test_duplicate_fqn_conflict() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        let body = json!({
            "fq_name": ["default-domain", "p", "vn1"],
            "parent_type": "project",
            "parent_uuid": project,
        });
        engine.create(&mut admin_ctx(), "virtual-network", &body).unwrap();
        let err = engine
            .create(&mut admin_ctx(), "virtual-network", &body)
            .unwrap_err();
        assert_eq!(err.http_status(), 409);
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_undo_frees_id_on_late_failure() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        // Force a late failure with a ref to a nonexistent ipam.
        let err = engine
            .create(
                &mut admin_ctx(),
                "virtual-network",
                &json!({
                    "fq_name": ["default-domain", "p", "vn1"],
                    "parent_type": "project",
                    "parent_uuid": project,
                    "network_ipam_refs": [{"uuid": "missing-ipam"}],
                }),
            )
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
        // Create failed before allocation; id 1 must still be free.
        let ok = engine
            .create(
                &mut admin_ctx(),
                "virtual-network",
                &json!({
                    "fq_name": ["default-domain", "p", "vn2"],
                    "parent_type": "project",
                    "parent_uuid": project,
                }),
            )
            .unwrap();
        let uuid = ok.body["virtual-network"]["uuid"].as_str().unwrap();
        let read = engine.read(&admin_ctx(), "virtual-network", uuid, None).unwrap();
        assert_eq!(read.body["virtual-network"]["virtual_network_network_id"], json!(1));
    }

    #[test]
    fn test_quota_enforced() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        engine
            .internal_update(
                "project",
                &project,
                &json!({"quota": {"virtual_network": 2}}),
            )
            .unwrap();
        for i in 0..2 {
            engine
                .create(
                    &mut admin_ctx(),
                    "virtual-network",
                    &json!({
                        "fq_name": ["default-domain", "p", format!("vn{}", i)],
                        "parent_type": "project",
                        "parent_uuid": project,
                    }),
                )
                .unwrap();
        }
        let err = engine
            .create(
                &mut admin_ctx(),
                "virtual-network",
                &json!({
                    "fq_name": ["default-domain", "p", "vn-over"],
                    "parent_type": "project",
                    "parent_uuid": project,
                }),
            )
            .unwrap_err();
        assert_eq!(err.http_status(), 412);
        assert!(err
            .to_string()
            .contains("quota limit (2) exceeded for resource virtual_network"));
    }

    #[test]
    fn test_update_merges_props() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        let resp = engine
            .create(
                &mut admin_ctx(),
                "virtual-network",
                &json!({
                    "fq_name": ["default-domain", "p", "vn1"],
                    "parent_type": "project",
                    "parent_uuid": project,
                    "display_name": "before",
                    "is_shared": false,
                }),
            )
            .unwrap();
        let uuid = resp.body["virtual-network"]["uuid"].as_str().unwrap().to_string();
        engine
            .update(
                &mut admin_ctx(),
                "virtual-network",
                &uuid,
                &json!({"display_name": "after"}),
            )
            .unwrap();
        let read = engine.read(&admin_ctx(), "virtual-network", &uuid, None).unwrap();
        assert_eq!(read.body["virtual-network"]["display_name"], json!("after"));
        // Untouched fields survive the merge.
        assert_eq!(read.body["virtual-network"]["is_shared"], json!(false));
    }

    #[test]
    fn test_delete_blocked_by_backref() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        let mk = |name: &str| {
            engine
                .create(
                    &mut admin_ctx(),
                    "virtual-network",
                    &json!({
                        "fq_name": ["default-domain", "p", name],
                        "parent_type": "project",
                        "parent_uuid": project,
                    }),
                )
                .unwrap()
                .body["virtual-network"]["uuid"]
                .as_str()
                .unwrap()
                .to_string()
        };
        let u1 = mk("vn1");
        let u2 = mk("vn2");
        engine
            .ref_update(
                &admin_ctx(),
                "virtual-network",
                &u1,
                "virtual-network",
                Some(&u2),
                None,
                "ADD",
                &Value::Null,
            )
            .unwrap();
        let err = engine.delete(&mut admin_ctx(), "virtual-network", &u2).unwrap_err();
        assert_eq!(err.http_status(), 409);
        // Relax the back-ref; delete now passes.
        engine.ref_relax_for_delete(&admin_ctx(), &u1, &u2).unwrap();
        engine.delete(&mut admin_ctx(), "virtual-network", &u2).unwrap();
    }

    #[test]
    fn test_read_etag_304() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        let resp = engine
            .create(
                &mut admin_ctx(),
                "virtual-network",
                &json!({
                    "fq_name": ["default-domain", "p", "vn1"],
                    "parent_type": "project",
                    "parent_uuid": project,
                }),
            )
            .unwrap();
        let uuid = resp.body["virtual-network"]["uuid"].as_str().unwrap().to_string();
        let first = engine.read(&admin_ctx(), "virtual-network", &uuid, None).unwrap();
        let etag = format!(
            "\"{}\"",
            first.body["virtual-network"]["last_modified"].as_str().unwrap()
        );
        let second = engine
            .read(&admin_ctx(), "virtual-network", &uuid, Some(&etag))
            .unwrap();
        assert_eq!(second.status, 304);
    }

    #[test]
    fn test_list_with_count_and_pagination() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        for i in 0..3 {
            engine
                .create(
                    &mut admin_ctx(),
                    "virtual-network",
                    &json!({
                        "fq_name": ["default-domain", "p", format!("vn{}", i)],
                        "parent_type": "project",
                        "parent_uuid": project,
                    }),
                )
                .unwrap();
        }
        let count = engine
            .list(
                &admin_ctx(),
                "virtual-network",
                &ListParams {
                    count: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(count.body["virtual-networks"]["count"], json!(3));

        let page = engine
            .list(
                &admin_ctx(),
                "virtual-network",
                &ListParams {
                    page_limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.body["virtual-networks"].as_array().unwrap().len(), 2);
        let marker = page.body["marker"].as_str().unwrap().to_string();
        let rest = engine
            .list(
                &admin_ctx(),
                "virtual-network",
                &ListParams {
                    page_marker: Some(marker),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(rest.body["virtual-networks"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_list_fq_names_fields_and_href() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        for name in ["vn1", "vn2"] {
            engine
                .create(
                    &mut admin_ctx(),
                    "virtual-network",
                    &json!({
                        "fq_name": ["default-domain", "p", name],
                        "parent_type": "project",
                        "parent_uuid": project,
                    }),
                )
                .unwrap();
        }

        let exact = engine
            .list(
                &admin_ctx(),
                "virtual-network",
                &ListParams {
                    fq_names: vec!["default-domain:p:vn2".to_string()],
                    fields: vec!["virtual_network_network_id".to_string()],
                    ..Default::default()
                },
            )
            .unwrap();
        let entries = exact.body["virtual-networks"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["fq_name"][2], json!("vn2"));
        assert_eq!(entries[0]["virtual_network_network_id"], json!(2));
        let uuid = entries[0]["uuid"].as_str().unwrap();
        assert_eq!(
            entries[0]["href"],
            json!(format!("/virtual-network/{}", uuid))
        );

        let bare = engine
            .list(
                &admin_ctx(),
                "virtual-network",
                &ListParams {
                    exclude_hrefs: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(bare.body["virtual-networks"][0].get("href").is_none());
    }

    #[test]
    fn test_stale_fqn_lock_taken_over() {
        let coord = Arc::new(MemoryCoordStore::new());
        let engine = Engine::new(
            coord.clone(),
            Arc::new(MemoryObjectTable::new()),
            Arc::new(MemoryBus::new()),
            EngineConfig::default(),
            CacheConfig::default(),
        )
        .unwrap();
        setup_domain(&engine);
        let project = create_project(&engine, "p");

        // A lock left behind by a crashed writer: old, and no row for
        // the UUID it holds.
        let path = "/fq-name-to-uuid/virtual-network:default-domain:p:vn1";
        coord.create(path, "dead-writer-uuid", true).unwrap();
        coord.backdate(path, 1_000).unwrap();

        let resp = engine
            .create(
                &mut admin_ctx(),
                "virtual-network",
                &json!({
                    "fq_name": ["default-domain", "p", "vn1"],
                    "parent_type": "project",
                    "parent_uuid": project,
                }),
            )
            .unwrap();
        assert_eq!(resp.status, 200);
        let (held, _) = coord.get(path).unwrap();
        assert_eq!(held, resp.body["virtual-network"]["uuid"].as_str().unwrap());
    }

    #[test]
    fn test_fqname_id_round_trip() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        let fqn: Vec<String> = vec!["default-domain".into(), "p".into()];
        let resp = engine.fq_name_to_id("project", &fqn).unwrap();
        assert_eq!(resp.body["uuid"], json!(project));
        let back = engine.id_to_fq_name(&project).unwrap();
        assert_eq!(back.body["type"], json!("project"));
        assert_eq!(back.body["fq_name"], json!(["default-domain", "p"]));
    }

    #[test]
    fn test_unknown_type_404() {
        let engine = test_engine();
        let err = engine
            .create(&mut admin_ctx(), "no-such-type", &json!({"fq_name": ["x"]}))
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn test_non_admin_cannot_write_foreign_parent() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        let mut user = UserContext::default();
        user.project_id = "someone-else".to_string();
        let mut ctx = RequestContext::new(user, "req-x");
        let err = engine
            .create(
                &mut ctx,
                "virtual-network",
                &json!({
                    "fq_name": ["default-domain", "p", "vn1"],
                    "parent_type": "project",
                    "parent_uuid": project,
                }),
            )
            .unwrap_err();
        assert_eq!(err.http_status(), 403);
    }

    #[test]
    fn test_ip_alloc_free_cycle() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        let resp = engine
            .create(
                &mut admin_ctx(),
                "virtual-network",
                &json!({
                    "fq_name": ["default-domain", "p", "vn1"],
                    "parent_type": "project",
                    "parent_uuid": project,
                }),
            )
            .unwrap();
        let uuid = resp.body["virtual-network"]["uuid"].as_str().unwrap().to_string();
        let alloc = engine.ip_alloc(&uuid, "10.0.0.0/24", 2).unwrap();
        let addrs: Vec<String> =
            serde_json::from_value(alloc.body["ip_addr"].clone()).unwrap();
        assert_eq!(addrs, vec!["10.0.0.3", "10.0.0.4"]);
        engine.ip_free(&uuid, "10.0.0.0/24", &addrs).unwrap();
        let again = engine.ip_alloc(&uuid, "10.0.0.0/24", 1).unwrap();
        assert_eq!(again.body["ip_addr"][0], json!("10.0.0.3"));
    }

    #[test]
    fn test_prop_collection_update_via_engine() {
        let engine = test_engine();
        setup_domain(&engine);
        let project = create_project(&engine, "p");
        let resp = engine
            .create(
                &mut admin_ctx(),
                "virtual-machine-interface",
                &json!({
                    "fq_name": ["default-domain", "p", "vmi1"],
                    "parent_type": "project",
                    "parent_uuid": project,
                }),
            )
            .unwrap();
        let uuid = resp.body["virtual-machine-interface"]["uuid"]
            .as_str()
            .unwrap()
            .to_string();
        engine
            .prop_collection_update(
                &admin_ctx(),
                &uuid,
                &json!([{
                    "field": "virtual_machine_interface_bindings",
                    "operation": "set",
                    "key": "vif_type",
                    "value": "vrouter",
                }]),
            )
            .unwrap();
        let got = engine
            .prop_collection_get(&uuid, &["virtual_machine_interface_bindings".to_string()])
            .unwrap();
        assert_eq!(
            got.body["virtual_machine_interface_bindings"]["vif_type"],
            json!("vrouter")
        );
    }
}
