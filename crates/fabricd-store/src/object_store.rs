//! Object store CRUD over the wide-column tables.
//!
//! Every mutation is a single atomic batch covering the object's own
//! row, the FQN index, the parent's `children:` column, and the
//! `backref:` columns of referenced rows. The returned impacted-UUID
//! sets drive implicit-update notifications upstream.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::cache::{CacheConfig, ObjectCache};
use crate::columns::{ColumnName, LATEST_COL_TS};
use crate::error::StoreError;
use crate::record::{ObjectRecord, RefEdge, StoredObject};
use crate::table::{ObjectTable, RowOp, TableId};

/// Candidate selection and post-filters for a list operation.
#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    /// Restrict to children of these parents.
    pub parent_uuids: Option<Vec<String>>,
    /// Restrict to objects referenced by these sources.
    pub back_ref_uuids: Option<Vec<String>>,
    /// Restrict to an explicit UUID set.
    pub obj_uuids: Option<Vec<String>>,
    /// Scalar-property equality filters.
    pub prop_filters: BTreeMap<String, Value>,
    /// Exclusive lexicographic start marker (UUID).
    pub paginate_start: Option<String>,
    /// Page size; None lists everything.
    pub paginate_count: Option<usize>,
}

/// Result of a list operation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListResult {
    /// `(fq_name, uuid)` pairs, sorted by UUID.
    pub entries: Vec<(Vec<String>, String)>,
    /// Marker to resume from, present when the page filled up.
    pub next_marker: Option<String>,
}

/// A single prop-collection mutation.
#[derive(Clone, Debug)]
pub struct PropCollectionUpdate {
    /// The list or map property name.
    pub field: String,
    /// The operation to apply.
    pub op: PropOp,
}

/// Atomic operations on one element of a list or map property.
#[derive(Clone, Debug)]
pub enum PropOp {
    /// Append (position None) or insert at a position.
    ListAdd {
        /// Target position; None appends.
        position: Option<u32>,
        /// Element value.
        value: Value,
    },
    /// Overwrite the element at a position.
    ListModify {
        /// Target position.
        position: u32,
        /// New element value.
        value: Value,
    },
    /// Remove the element at a position.
    ListDelete {
        /// Target position.
        position: u32,
    },
    /// Insert or overwrite a map entry.
    MapSet {
        /// Map key.
        key: String,
        /// Entry value.
        value: Value,
    },
    /// Remove a map entry.
    MapDelete {
        /// Map key.
        key: String,
    },
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn json_put(table: TableId, row: &str, column: ColumnName, value: &Value) -> RowOp {
    RowOp::Put {
        table,
        row: row.to_string(),
        column: column.render(),
        value: value.to_string(),
    }
}

fn col_delete(table: TableId, row: &str, column: ColumnName) -> RowOp {
    RowOp::Delete {
        table,
        row: row.to_string(),
        column: column.render(),
    }
}

fn ts_bump(row: &str, ts: &str) -> RowOp {
    RowOp::Put {
        table: TableId::ObjUuid,
        row: row.to_string(),
        column: LATEST_COL_TS.to_string(),
        value: ts.to_string(),
    }
}

/// Wide-column object store with a read-through cache.
pub struct ObjectStore {
    table: Arc<dyn ObjectTable>,
    cache: ObjectCache,
}

impl ObjectStore {
    /// Creates a store over the given table backend.
    pub fn new(table: Arc<dyn ObjectTable>, cache_config: CacheConfig) -> Self {
        Self {
            table,
            cache: ObjectCache::new(cache_config),
        }
    }

    /// Evicts a UUID from the object cache. Called by the notification
    /// dispatcher when a peer process mutated the object.
    pub fn evict(&self, uuid: &str) {
        self.cache.evict(uuid);
    }

    // ------------------------------------------------------------------
    // FQN index
    // ------------------------------------------------------------------

    /// Resolves `(type, fq_name)` to a UUID via the FQN index table.
    pub fn fq_name_to_uuid(&self, type_name: &str, fq_name: &[String]) -> Result<String, StoreError> {
        let fqn = fq_name.join(":");
        let prefix = format!("{}:", fqn);
        let cols = self
            .table
            .get_columns_prefixed(TableId::ObjFqName, type_name, &prefix)?;
        for (col, _) in cols {
            let rest = &col[prefix.len()..];
            // UUIDs never contain ':'; longer fq_names sharing the
            // prefix do.
            if !rest.is_empty() && !rest.contains(':') {
                return Ok(rest.to_string());
            }
        }
        Err(StoreError::FqNameNotFound {
            type_name: type_name.to_string(),
            fq_name: fqn,
        })
    }

    /// Resolves a UUID to its `(type, fq_name)`.
    pub fn uuid_to_fq_name(&self, uuid: &str) -> Result<(String, Vec<String>), StoreError> {
        let type_name = self
            .table
            .get_column(TableId::ObjUuid, uuid, "type")?
            .ok_or_else(|| StoreError::ObjectNotFound(uuid.to_string()))?;
        let fq_raw = self
            .table
            .get_column(TableId::ObjUuid, uuid, "fq_name")?
            .ok_or_else(|| StoreError::ObjectNotFound(uuid.to_string()))?;
        let type_name: String = serde_json::from_str(&type_name).map_err(|e| StoreError::BadColumn {
            column: "type".to_string(),
            reason: e.to_string(),
        })?;
        let fq_name: Vec<String> = serde_json::from_str(&fq_raw).map_err(|e| StoreError::BadColumn {
            column: "fq_name".to_string(),
            reason: e.to_string(),
        })?;
        Ok((type_name, fq_name))
    }

    /// True if an object row exists for the UUID.
    pub fn object_exists(&self, uuid: &str) -> Result<bool, StoreError> {
        Ok(self.table.get_column(TableId::ObjUuid, uuid, "type")?.is_some())
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    /// Persists a new object. Returns the UUIDs of referenced objects
    /// whose `backref:` columns were written.
    pub fn object_create(&self, record: &ObjectRecord) -> Result<Vec<String>, StoreError> {
        if self.fq_name_to_uuid(&record.type_name, &record.fq_name).is_ok() {
            return Err(StoreError::FqNameExists {
                type_name: record.type_name.clone(),
                fq_name: record.fq_name_str(),
            });
        }
        let ts = now_rfc3339();
        let mut ops = Vec::new();
        let uuid = record.uuid.as_str();

        ops.push(json_put(
            TableId::ObjUuid,
            uuid,
            ColumnName::Type,
            &Value::String(record.type_name.clone()),
        ));
        ops.push(json_put(
            TableId::ObjUuid,
            uuid,
            ColumnName::FqName,
            &serde_json::to_value(&record.fq_name).expect("fq_name serializes"),
        ));
        self.render_body(record, &ts, &mut ops);

        // FQN index entry.
        ops.push(RowOp::Put {
            table: TableId::ObjFqName,
            row: record.type_name.clone(),
            column: format!("{}:{}", record.fq_name_str(), uuid),
            value: ts.clone(),
        });

        // Parent's children column.
        if let Some((ptype, puuid)) = &record.parent {
            ops.push(json_put(
                TableId::ObjUuid,
                uuid,
                ColumnName::Parent {
                    type_name: ptype.clone(),
                    uuid: puuid.clone(),
                },
                &Value::Null,
            ));
            ops.push(json_put(
                TableId::ObjUuid,
                puuid,
                ColumnName::Children {
                    type_name: record.type_name.clone(),
                    uuid: uuid.to_string(),
                },
                &Value::Null,
            ));
            ops.push(ts_bump(puuid, &ts));
        }

        let mut impacted = Vec::new();
        for r in &record.refs {
            ops.push(json_put(
                TableId::ObjUuid,
                &r.uuid,
                ColumnName::BackRef {
                    type_name: record.type_name.clone(),
                    uuid: uuid.to_string(),
                },
                &r.attr,
            ));
            ops.push(ts_bump(&r.uuid, &ts));
            impacted.push(r.uuid.clone());
        }
        ops.push(ts_bump(uuid, &ts));

        self.table.write_batch(ops)?;
        if let Some((_, puuid)) = &record.parent {
            self.cache.evict(puuid);
        }
        for u in &impacted {
            self.cache.evict(u);
        }
        tracing::debug!("created {} {} ({})", record.type_name, record.fq_name_str(), uuid);
        Ok(impacted)
    }

    fn render_body(&self, record: &ObjectRecord, _ts: &str, ops: &mut Vec<RowOp>) {
        let uuid = record.uuid.as_str();
        for (name, value) in &record.props {
            ops.push(json_put(
                TableId::ObjUuid,
                uuid,
                ColumnName::Prop { name: name.clone() },
                value,
            ));
        }
        for (name, items) in &record.prop_lists {
            for (i, v) in items.iter().enumerate() {
                ops.push(json_put(
                    TableId::ObjUuid,
                    uuid,
                    ColumnName::PropList {
                        name: name.clone(),
                        position: i as u32,
                    },
                    v,
                ));
            }
        }
        for (name, entries) in &record.prop_maps {
            for (k, v) in entries {
                ops.push(json_put(
                    TableId::ObjUuid,
                    uuid,
                    ColumnName::PropMap {
                        name: name.clone(),
                        key: k.clone(),
                    },
                    v,
                ));
            }
        }
        for r in &record.refs {
            ops.push(json_put(
                TableId::ObjUuid,
                uuid,
                ColumnName::Ref {
                    type_name: r.type_name.clone(),
                    uuid: r.uuid.clone(),
                },
                &r.attr,
            ));
        }
    }

    /// Reads an object, serving from the cache when possible.
    pub fn object_read(&self, type_name: &str, uuid: &str) -> Result<StoredObject, StoreError> {
        if let Some(cached) = self.cache.get(uuid) {
            if cached.record.type_name == type_name {
                return Ok(cached);
            }
        }
        let obj = self.read_uncached(uuid)?;
        if obj.record.type_name != type_name {
            return Err(StoreError::ObjectNotFound(uuid.to_string()));
        }
        self.cache.put(&obj);
        Ok(obj)
    }

    /// Reads many objects, skipping UUIDs that no longer exist.
    pub fn object_read_multi(
        &self,
        type_name: &str,
        uuids: &[String],
    ) -> Result<Vec<StoredObject>, StoreError> {
        let mut out = Vec::with_capacity(uuids.len());
        for u in uuids {
            match self.object_read(type_name, u) {
                Ok(obj) => out.push(obj),
                Err(StoreError::ObjectNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn read_uncached(&self, uuid: &str) -> Result<StoredObject, StoreError> {
        let row = self
            .table
            .get_row(TableId::ObjUuid, uuid)?
            .ok_or_else(|| StoreError::ObjectNotFound(uuid.to_string()))?;
        let mut obj = StoredObject::default();
        obj.record.uuid = uuid.to_string();
        let mut lists: BTreeMap<String, BTreeMap<u32, Value>> = BTreeMap::new();
        for (col, raw) in &row {
            let parsed = ColumnName::parse(col)?;
            let value = || -> Result<Value, StoreError> {
                serde_json::from_str(raw).map_err(|e| StoreError::BadColumn {
                    column: col.clone(),
                    reason: e.to_string(),
                })
            };
            match parsed {
                ColumnName::Type => {
                    obj.record.type_name = serde_json::from_str(raw).map_err(|e| {
                        StoreError::BadColumn {
                            column: col.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                }
                ColumnName::FqName => {
                    obj.record.fq_name = serde_json::from_str(raw).map_err(|e| {
                        StoreError::BadColumn {
                            column: col.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                }
                ColumnName::Parent { type_name, uuid } => {
                    obj.record.parent = Some((type_name, uuid));
                }
                ColumnName::Children { type_name, uuid } => {
                    obj.children.push((type_name, uuid));
                }
                ColumnName::Ref { type_name, uuid } => {
                    obj.record.refs.push(RefEdge {
                        type_name,
                        uuid,
                        attr: value()?,
                    });
                }
                ColumnName::BackRef { type_name, uuid } => {
                    obj.backrefs.push(RefEdge {
                        type_name,
                        uuid,
                        attr: value()?,
                    });
                }
                ColumnName::RelaxBackRef { uuid } => {
                    obj.relaxed_backrefs.insert(uuid);
                }
                ColumnName::Prop { name } => {
                    obj.record.props.insert(name, value()?);
                }
                ColumnName::PropList { name, position } => {
                    lists.entry(name).or_default().insert(position, value()?);
                }
                ColumnName::PropMap { name, key } => {
                    obj.record
                        .prop_maps
                        .entry(name)
                        .or_default()
                        .insert(key, value()?);
                }
                ColumnName::LatestColTs => {
                    obj.last_modified = raw.clone();
                }
            }
        }
        for (name, by_pos) in lists {
            obj.record
                .prop_lists
                .insert(name, by_pos.into_values().collect());
        }
        Ok(obj)
    }

    /// Rewrites an object's body to match `record`. Properties and refs
    /// absent from the record are removed. Returns the UUIDs of ref
    /// targets whose `backref:` columns changed.
    pub fn object_update(&self, record: &ObjectRecord) -> Result<Vec<String>, StoreError> {
        let prev = self.read_uncached(&record.uuid)?;
        let ts = now_rfc3339();
        let mut ops = Vec::new();
        let uuid = record.uuid.as_str();

        // Scalar props: put new values, drop removed ones.
        for (name, value) in &record.props {
            if prev.record.props.get(name) != Some(value) {
                ops.push(json_put(
                    TableId::ObjUuid,
                    uuid,
                    ColumnName::Prop { name: name.clone() },
                    value,
                ));
            }
        }
        for name in prev.record.props.keys() {
            if !record.props.contains_key(name) {
                ops.push(col_delete(
                    TableId::ObjUuid,
                    uuid,
                    ColumnName::Prop { name: name.clone() },
                ));
            }
        }

        // List props: rewrite positions, trim the tail.
        for (name, items) in &record.prop_lists {
            let prev_len = prev.record.prop_lists.get(name).map_or(0, Vec::len);
            for (i, v) in items.iter().enumerate() {
                ops.push(json_put(
                    TableId::ObjUuid,
                    uuid,
                    ColumnName::PropList {
                        name: name.clone(),
                        position: i as u32,
                    },
                    v,
                ));
            }
            for i in items.len()..prev_len {
                ops.push(col_delete(
                    TableId::ObjUuid,
                    uuid,
                    ColumnName::PropList {
                        name: name.clone(),
                        position: i as u32,
                    },
                ));
            }
        }
        for (name, items) in &prev.record.prop_lists {
            if !record.prop_lists.contains_key(name) {
                for i in 0..items.len() {
                    ops.push(col_delete(
                        TableId::ObjUuid,
                        uuid,
                        ColumnName::PropList {
                            name: name.clone(),
                            position: i as u32,
                        },
                    ));
                }
            }
        }

        // Map props: set new entries, drop removed keys.
        for (name, entries) in &record.prop_maps {
            let prev_entries = prev.record.prop_maps.get(name);
            for (k, v) in entries {
                if prev_entries.and_then(|p| p.get(k)) != Some(v) {
                    ops.push(json_put(
                        TableId::ObjUuid,
                        uuid,
                        ColumnName::PropMap {
                            name: name.clone(),
                            key: k.clone(),
                        },
                        v,
                    ));
                }
            }
            if let Some(p) = prev_entries {
                for k in p.keys() {
                    if !entries.contains_key(k) {
                        ops.push(col_delete(
                            TableId::ObjUuid,
                            uuid,
                            ColumnName::PropMap {
                                name: name.clone(),
                                key: k.clone(),
                            },
                        ));
                    }
                }
            }
        }
        for (name, p) in &prev.record.prop_maps {
            if !record.prop_maps.contains_key(name) {
                for k in p.keys() {
                    ops.push(col_delete(
                        TableId::ObjUuid,
                        uuid,
                        ColumnName::PropMap {
                            name: name.clone(),
                            key: k.clone(),
                        },
                    ));
                }
            }
        }

        // Refs: symmetric add/remove.
        let new_refs: BTreeMap<(String, String), &RefEdge> = record
            .refs
            .iter()
            .map(|r| ((r.type_name.clone(), r.uuid.clone()), r))
            .collect();
        let old_refs: BTreeMap<(String, String), &RefEdge> = prev
            .record
            .refs
            .iter()
            .map(|r| ((r.type_name.clone(), r.uuid.clone()), r))
            .collect();
        let mut impacted = BTreeSet::new();
        for (key, r) in &new_refs {
            let changed = match old_refs.get(key) {
                Some(old) => old.attr != r.attr,
                None => true,
            };
            if changed {
                ops.push(json_put(
                    TableId::ObjUuid,
                    uuid,
                    ColumnName::Ref {
                        type_name: r.type_name.clone(),
                        uuid: r.uuid.clone(),
                    },
                    &r.attr,
                ));
                ops.push(json_put(
                    TableId::ObjUuid,
                    &r.uuid,
                    ColumnName::BackRef {
                        type_name: record.type_name.clone(),
                        uuid: uuid.to_string(),
                    },
                    &r.attr,
                ));
                ops.push(ts_bump(&r.uuid, &ts));
                impacted.insert(r.uuid.clone());
            }
        }
        for (key, r) in &old_refs {
            if !new_refs.contains_key(key) {
                ops.push(col_delete(
                    TableId::ObjUuid,
                    uuid,
                    ColumnName::Ref {
                        type_name: r.type_name.clone(),
                        uuid: r.uuid.clone(),
                    },
                ));
                ops.push(col_delete(
                    TableId::ObjUuid,
                    &r.uuid,
                    ColumnName::BackRef {
                        type_name: record.type_name.clone(),
                        uuid: uuid.to_string(),
                    },
                ));
                ops.push(col_delete(
                    TableId::ObjUuid,
                    &r.uuid,
                    ColumnName::RelaxBackRef {
                        uuid: uuid.to_string(),
                    },
                ));
                ops.push(ts_bump(&r.uuid, &ts));
                impacted.insert(r.uuid.clone());
            }
        }

        ops.push(ts_bump(uuid, &ts));
        self.table.write_batch(ops)?;
        self.cache.evict(uuid);
        for u in &impacted {
            self.cache.evict(u);
        }
        Ok(impacted.into_iter().collect())
    }

    /// Removes an object row, its FQN index entry, its parent's
    /// `children:` column, and the `backref:` columns it wrote on ref
    /// targets. Returns the impacted ref-target UUIDs.
    pub fn object_delete(&self, type_name: &str, uuid: &str) -> Result<Vec<String>, StoreError> {
        let obj = self.object_read(type_name, uuid)?;
        let ts = now_rfc3339();
        let mut ops = Vec::new();
        ops.push(RowOp::DeleteRow {
            table: TableId::ObjUuid,
            row: uuid.to_string(),
        });
        ops.push(RowOp::Delete {
            table: TableId::ObjFqName,
            row: type_name.to_string(),
            column: format!("{}:{}", obj.record.fq_name_str(), uuid),
        });
        if let Some((_, puuid)) = &obj.record.parent {
            ops.push(col_delete(
                TableId::ObjUuid,
                puuid,
                ColumnName::Children {
                    type_name: type_name.to_string(),
                    uuid: uuid.to_string(),
                },
            ));
            ops.push(ts_bump(puuid, &ts));
        }
        let mut impacted = Vec::new();
        for r in &obj.record.refs {
            ops.push(col_delete(
                TableId::ObjUuid,
                &r.uuid,
                ColumnName::BackRef {
                    type_name: type_name.to_string(),
                    uuid: uuid.to_string(),
                },
            ));
            ops.push(col_delete(
                TableId::ObjUuid,
                &r.uuid,
                ColumnName::RelaxBackRef {
                    uuid: uuid.to_string(),
                },
            ));
            ops.push(ts_bump(&r.uuid, &ts));
            impacted.push(r.uuid.clone());
        }
        self.table.write_batch(ops)?;
        self.cache.evict(uuid);
        if let Some((_, puuid)) = &obj.record.parent {
            self.cache.evict(puuid);
        }
        for u in &impacted {
            self.cache.evict(u);
        }
        tracing::debug!("deleted {} {} ({})", type_name, obj.record.fq_name_str(), uuid);
        Ok(impacted)
    }

    // ------------------------------------------------------------------
    // Ref edges
    // ------------------------------------------------------------------

    /// Adds or removes a single reference, writing both edge sides and
    /// bumping both mutation timestamps in one batch.
    pub fn ref_update(
        &self,
        from_type: &str,
        from_uuid: &str,
        to_type: &str,
        to_uuid: &str,
        add: bool,
        attr: &Value,
    ) -> Result<(), StoreError> {
        if !self.object_exists(from_uuid)? {
            return Err(StoreError::ObjectNotFound(from_uuid.to_string()));
        }
        if !self.object_exists(to_uuid)? {
            return Err(StoreError::ObjectNotFound(to_uuid.to_string()));
        }
        let ts = now_rfc3339();
        let mut ops = Vec::new();
        if add {
            ops.push(json_put(
                TableId::ObjUuid,
                from_uuid,
                ColumnName::Ref {
                    type_name: to_type.to_string(),
                    uuid: to_uuid.to_string(),
                },
                attr,
            ));
            ops.push(json_put(
                TableId::ObjUuid,
                to_uuid,
                ColumnName::BackRef {
                    type_name: from_type.to_string(),
                    uuid: from_uuid.to_string(),
                },
                attr,
            ));
        } else {
            ops.push(col_delete(
                TableId::ObjUuid,
                from_uuid,
                ColumnName::Ref {
                    type_name: to_type.to_string(),
                    uuid: to_uuid.to_string(),
                },
            ));
            ops.push(col_delete(
                TableId::ObjUuid,
                to_uuid,
                ColumnName::BackRef {
                    type_name: from_type.to_string(),
                    uuid: from_uuid.to_string(),
                },
            ));
            ops.push(col_delete(
                TableId::ObjUuid,
                to_uuid,
                ColumnName::RelaxBackRef {
                    uuid: from_uuid.to_string(),
                },
            ));
        }
        ops.push(ts_bump(from_uuid, &ts));
        ops.push(ts_bump(to_uuid, &ts));
        self.table.write_batch(ops)?;
        self.cache.evict(from_uuid);
        self.cache.evict(to_uuid);
        Ok(())
    }

    /// Marks the back-ref `target ← source` as relaxed so the target
    /// can later be deleted despite it.
    pub fn relax_backref(&self, source_uuid: &str, target_uuid: &str) -> Result<(), StoreError> {
        if !self.object_exists(target_uuid)? {
            return Err(StoreError::ObjectNotFound(target_uuid.to_string()));
        }
        let ts = now_rfc3339();
        self.table.write_batch(vec![
            json_put(
                TableId::ObjUuid,
                target_uuid,
                ColumnName::RelaxBackRef {
                    uuid: source_uuid.to_string(),
                },
                &Value::Null,
            ),
            ts_bump(target_uuid, &ts),
        ])?;
        self.cache.evict(target_uuid);
        Ok(())
    }

    // ------------------------------------------------------------------
    // List
    // ------------------------------------------------------------------

    /// Lists objects of a type per the filter.
    pub fn object_list(&self, type_name: &str, filter: &ListFilter) -> Result<ListResult, StoreError> {
        let mut candidates: Vec<String> = if let Some(uuids) = &filter.obj_uuids {
            uuids.clone()
        } else if let Some(parents) = &filter.parent_uuids {
            let prefix = format!("children:{}:", type_name);
            let mut out = Vec::new();
            for p in parents {
                for (col, _) in self.table.get_columns_prefixed(TableId::ObjUuid, p, &prefix)? {
                    out.push(col[prefix.len()..].to_string());
                }
            }
            out
        } else if let Some(sources) = &filter.back_ref_uuids {
            let prefix = format!("ref:{}:", type_name);
            let mut out = Vec::new();
            for s in sources {
                for (col, _) in self.table.get_columns_prefixed(TableId::ObjUuid, s, &prefix)? {
                    out.push(col[prefix.len()..].to_string());
                }
            }
            out
        } else {
            let mut out = Vec::new();
            for (col, _) in self
                .table
                .get_columns_prefixed(TableId::ObjFqName, type_name, "")?
            {
                if let Some((_, uuid)) = col.rsplit_once(':') {
                    out.push(uuid.to_string());
                }
            }
            out
        };
        candidates.sort();
        candidates.dedup();

        let mut entries = Vec::new();
        let mut next_marker = None;
        for uuid in candidates {
            if filter
                .paginate_start
                .as_ref()
                .is_some_and(|start| uuid.as_str() <= start.as_str())
            {
                continue;
            }
            let obj = match self.object_read(type_name, &uuid) {
                Ok(o) => o,
                Err(StoreError::ObjectNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if !filter
                .prop_filters
                .iter()
                .all(|(name, want)| obj.record.props.get(name) == Some(want))
            {
                continue;
            }
            if filter.paginate_count.is_some_and(|n| entries.len() >= n) {
                next_marker = entries.last().map(|(_, u): &(Vec<String>, String)| u.clone());
                break;
            }
            entries.push((obj.record.fq_name.clone(), uuid));
        }
        Ok(ListResult { entries, next_marker })
    }

    /// Number of live objects of a type.
    pub fn object_count(&self, type_name: &str) -> Result<usize, StoreError> {
        Ok(self
            .table
            .get_columns_prefixed(TableId::ObjFqName, type_name, "")?
            .len())
    }

    // ------------------------------------------------------------------
    // Prop collections
    // ------------------------------------------------------------------

    /// Reads the named list/map properties of an object.
    pub fn prop_collection_read(
        &self,
        type_name: &str,
        uuid: &str,
        fields: &[String],
    ) -> Result<BTreeMap<String, Value>, StoreError> {
        let obj = self.object_read(type_name, uuid)?;
        let mut out = BTreeMap::new();
        for f in fields {
            if let Some(items) = obj.record.prop_lists.get(f) {
                out.insert(f.clone(), Value::Array(items.clone()));
            } else if let Some(entries) = obj.record.prop_maps.get(f) {
                out.insert(
                    f.clone(),
                    Value::Object(entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
                );
            }
        }
        Ok(out)
    }

    /// Applies element-level updates to list/map properties in one
    /// batch.
    pub fn prop_collection_update(
        &self,
        type_name: &str,
        uuid: &str,
        updates: &[PropCollectionUpdate],
    ) -> Result<(), StoreError> {
        let obj = self.read_uncached(uuid)?;
        if obj.record.type_name != type_name {
            return Err(StoreError::ObjectNotFound(uuid.to_string()));
        }
        let ts = now_rfc3339();
        let mut record = obj.record.clone();
        for u in updates {
            match &u.op {
                PropOp::ListAdd { position, value } => {
                    let list = record.prop_lists.entry(u.field.clone()).or_default();
                    match position {
                        Some(p) if (*p as usize) <= list.len() => {
                            list.insert(*p as usize, value.clone())
                        }
                        _ => list.push(value.clone()),
                    }
                }
                PropOp::ListModify { position, value } => {
                    let list = record.prop_lists.entry(u.field.clone()).or_default();
                    let idx = *position as usize;
                    if idx >= list.len() {
                        return Err(StoreError::PropEntryNotFound {
                            field: u.field.clone(),
                            key: position.to_string(),
                        });
                    }
                    list[idx] = value.clone();
                }
                PropOp::ListDelete { position } => {
                    let list = record.prop_lists.entry(u.field.clone()).or_default();
                    let idx = *position as usize;
                    if idx >= list.len() {
                        return Err(StoreError::PropEntryNotFound {
                            field: u.field.clone(),
                            key: position.to_string(),
                        });
                    }
                    list.remove(idx);
                }
                PropOp::MapSet { key, value } => {
                    record
                        .prop_maps
                        .entry(u.field.clone())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                PropOp::MapDelete { key } => {
                    let entries = record.prop_maps.entry(u.field.clone()).or_default();
                    if entries.remove(key).is_none() {
                        return Err(StoreError::PropEntryNotFound {
                            field: u.field.clone(),
                            key: key.clone(),
                        });
                    }
                }
            }
        }
        // Reuse the column-diff path of object_update for the rewrite.
        let mut ops = Vec::new();
        self.diff_collections(&obj.record, &record, &mut ops);
        ops.push(ts_bump(uuid, &ts));
        self.table.write_batch(ops)?;
        self.cache.evict(uuid);
        Ok(())
    }

    fn diff_collections(&self, prev: &ObjectRecord, next: &ObjectRecord, ops: &mut Vec<RowOp>) {
        let uuid = next.uuid.as_str();
        for (name, items) in &next.prop_lists {
            let prev_len = prev.prop_lists.get(name).map_or(0, Vec::len);
            for (i, v) in items.iter().enumerate() {
                ops.push(json_put(
                    TableId::ObjUuid,
                    uuid,
                    ColumnName::PropList {
                        name: name.clone(),
                        position: i as u32,
                    },
                    v,
                ));
            }
            for i in items.len()..prev_len {
                ops.push(col_delete(
                    TableId::ObjUuid,
                    uuid,
                    ColumnName::PropList {
                        name: name.clone(),
                        position: i as u32,
                    },
                ));
            }
        }
        for (name, entries) in &next.prop_maps {
            let prev_entries = prev.prop_maps.get(name);
            for (k, v) in entries {
                ops.push(json_put(
                    TableId::ObjUuid,
                    uuid,
                    ColumnName::PropMap {
                        name: name.clone(),
                        key: k.clone(),
                    },
                    v,
                ));
            }
            if let Some(p) = prev_entries {
                for k in p.keys() {
                    if !entries.contains_key(k) {
                        ops.push(col_delete(
                            TableId::ObjUuid,
                            uuid,
                            ColumnName::PropMap {
                                name: name.clone(),
                                key: k.clone(),
                            },
                        ));
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // User-agent K/V
    // ------------------------------------------------------------------

    /// Stores an opaque adapter key/value pair.
    pub fn useragent_kv_store(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.table.write_batch(vec![RowOp::Put {
            table: TableId::UserAgent,
            row: key.to_string(),
            column: "value".to_string(),
            value: value.to_string(),
        }])
    }

    /// Retrieves an adapter value by key.
    pub fn useragent_kv_retrieve(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.table.get_column(TableId::UserAgent, key, "value")
    }

    /// Deletes an adapter key.
    pub fn useragent_kv_delete(&self, key: &str) -> Result<(), StoreError> {
        self.table.write_batch(vec![RowOp::DeleteRow {
            table: TableId::UserAgent,
            row: key.to_string(),
        }])
    }

    /// Direct table access for the repair tool.
    pub fn table(&self) -> &Arc<dyn ObjectTable> {
        &self.table
    }

    /// The object cache, for the admin introspection surface.
    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }
}
