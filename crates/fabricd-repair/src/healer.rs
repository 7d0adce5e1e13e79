//! Re-creation of missing state.
//!
//! The healer only adds: index entries, lock nodes, children columns,
//! allocation znodes, and subnet mappings. The object rows themselves
//! are the source of truth for content, the coordination store for
//! allocations, so anything the healer writes is derived from a live
//! row. Removal of stale state is the cleaner's job.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use fabricd_coord::{CoordError, CoordStore};
use fabricd_store::{ObjectTable, RowOp, TableId};

use crate::error::RepairError;
use crate::report::{RepairIssue, RepairReport, Severity};
use crate::scan::{
    children_or_empty, claimed_ids, fqn_entries, fqn_lock_node, id_node, instance_ip_claims,
    row_fq_name, row_prop_string, row_type, subnet_contains, SUBNET_KV_PREFIX, SUBNET_LOCK_ROOT,
};

/// Idempotent re-creator of missing derived state.
pub struct DbHealer {
    coord: Arc<dyn CoordStore>,
    table: Arc<dyn ObjectTable>,
}

impl DbHealer {
    /// Creates a healer over the two stores.
    pub fn new(coord: Arc<dyn CoordStore>, table: Arc<dyn ObjectTable>) -> Self {
        Self { coord, table }
    }

    /// Runs every heal pass.
    pub fn heal_all(&self) -> Result<RepairReport, RepairError> {
        let mut report = RepairReport::default();
        self.heal_fq_name_index(&mut report)?;
        self.heal_children_columns(&mut report)?;
        self.heal_resource_ids(&mut report)?;
        self.heal_subnet_state(&mut report)?;
        tracing::info!(repaired = report.repaired, "db heal complete");
        Ok(report)
    }

    fn create_tolerant(&self, path: &str, value: &str) -> Result<bool, RepairError> {
        match self.coord.create(path, value, true) {
            Ok(()) => Ok(true),
            Err(CoordError::NodeExists(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Rebuilds missing FQN index entries and FQN lock nodes from
    /// live rows. An index entry is only created when the row is the
    /// sole claimant of its FQN; conflicting claims are reported
    /// unrepaired.
    pub fn heal_fq_name_index(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        for uuid in self.table.row_keys(TableId::ObjUuid, None, None)? {
            let (Some(type_name), Some(fq_name)) = (
                row_type(&self.table, &uuid)?,
                row_fq_name(&self.table, &uuid)?,
            ) else {
                continue;
            };
            let fqn = fq_name.join(":");

            let column = format!("{}:{}", fqn, uuid);
            if self
                .table
                .get_column(TableId::ObjFqName, &type_name, &column)?
                .is_none()
            {
                let others: Vec<String> = fqn_entries(&self.table, &type_name)?
                    .into_iter()
                    .filter(|(f, u)| *f == fqn && *u != uuid)
                    .map(|(_, u)| u)
                    .collect();
                if others.is_empty() {
                    self.table.write_batch(vec![RowOp::Put {
                        table: TableId::ObjFqName,
                        row: type_name.clone(),
                        column,
                        value: chrono::Utc::now().to_rfc3339(),
                    }])?;
                    report.add_repaired(
                        Severity::Error,
                        RepairIssue::MissingFqNameEntry {
                            type_name: type_name.clone(),
                            fq_name: fqn.clone(),
                            uuid: uuid.clone(),
                        },
                    );
                } else {
                    let mut uuids = others;
                    uuids.push(uuid.clone());
                    report.add(
                        Severity::Error,
                        RepairIssue::DuplicateFqName {
                            type_name: type_name.clone(),
                            fq_name: fqn.clone(),
                            uuids,
                        },
                    );
                    continue;
                }
            }

            let node = fqn_lock_node(&type_name, &fqn);
            if self.create_tolerant(&node, &uuid)? {
                report.add_repaired(
                    Severity::Warning,
                    RepairIssue::MissingFqNameLock { type_name, fq_name: fqn },
                );
            }
        }
        Ok(())
    }

    /// Restores children columns on parents that lost them.
    pub fn heal_children_columns(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        for uuid in self.table.row_keys(TableId::ObjUuid, None, None)? {
            let Some(row) = self.table.get_row(TableId::ObjUuid, &uuid)? else {
                continue;
            };
            let Some(type_name) = row_type(&self.table, &uuid)? else { continue };
            for column in row.keys() {
                let Some(rest) = column.strip_prefix("parent:") else { continue };
                let Some((_, parent_uuid)) = rest.split_once(':') else { continue };
                if row_type(&self.table, parent_uuid)?.is_none() {
                    // Orphan; the cleaner decides its fate.
                    continue;
                }
                let child_col = format!("children:{}:{}", type_name, uuid);
                if self
                    .table
                    .get_column(TableId::ObjUuid, parent_uuid, &child_col)?
                    .is_none()
                {
                    self.table.write_batch(vec![RowOp::Put {
                        table: TableId::ObjUuid,
                        row: parent_uuid.to_string(),
                        column: child_col.clone(),
                        value: "null".to_string(),
                    }])?;
                    report.add_repaired(
                        Severity::Warning,
                        RepairIssue::MissingChildrenColumn {
                            parent_uuid: parent_uuid.to_string(),
                            column: child_col,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Re-creates allocation znodes for IDs that live rows claim.
    /// Contested IDs are reported unrepaired.
    pub fn heal_resource_ids(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        self.heal_id_namespace(
            report,
            "virtual-network",
            "virtual_network_network_id",
            "/id/virtual-networks",
        )?;
        self.heal_id_namespace(
            report,
            "security-group",
            "security_group_id",
            "/id/security-groups",
        )
    }

    fn heal_id_namespace(
        &self,
        report: &mut RepairReport,
        type_name: &str,
        prop: &str,
        base: &str,
    ) -> Result<(), RepairError> {
        for (id, uuids) in claimed_ids(&self.table, type_name, prop)? {
            if uuids.len() > 1 {
                report.add(
                    Severity::Error,
                    RepairIssue::DuplicateId {
                        namespace: base.to_string(),
                        id,
                        uuids,
                    },
                );
                continue;
            }
            let uuid = &uuids[0];
            let owner = row_fq_name(&self.table, uuid)?
                .map(|f| f.join(":"))
                .unwrap_or_default();
            let node = id_node(base, id);
            if self.create_tolerant(&node, &owner)? {
                report.add_repaired(
                    Severity::Error,
                    RepairIssue::MissingIdNode {
                        node,
                        uuid: uuid.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Re-creates missing subnet address locks from instance-ip rows
    /// and backfills the subnet K/V map.
    pub fn heal_subnet_state(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        let claims = instance_ip_claims(&self.table)?;
        let vn_fqns = subnet_vn_fqns(&self.table)?;
        let mut subnets: BTreeMap<String, Vec<(u32, u8, String)>> = BTreeMap::new();

        for tree in children_or_empty(&self.coord, SUBNET_LOCK_ROOT)? {
            let Some(vn_fqn) = vn_fqns.iter().find(|fqn| {
                tree.len() > fqn.len() + 1
                    && tree.starts_with(fqn.as_str())
                    && tree.as_bytes()[fqn.len()] == b':'
            }) else {
                continue;
            };
            let Ok(network) = tree[vn_fqn.len() + 1..].parse::<Ipv4Addr>() else { continue };
            let root = format!("{}/{}", SUBNET_LOCK_ROOT, tree);
            for prefix in children_or_empty(&self.coord, &root)? {
                let Ok(plen) = prefix.parse::<u8>() else { continue };
                if plen > 32 {
                    continue;
                }
                subnets.entry(vn_fqn.clone()).or_default().push((
                    u32::from(network),
                    plen,
                    format!("{}/{}", root, prefix),
                ));
            }
        }

        for (vn_fqn, addrs) in &claims {
            let Some(vn_subnets) = subnets.get(vn_fqn) else { continue };
            for (addr, iip_uuid) in addrs {
                for (net, plen, dir) in vn_subnets {
                    if !subnet_contains(*net, *plen, *addr) {
                        continue;
                    }
                    let node = id_node(dir, *addr);
                    if self.create_tolerant(&node, vn_fqn)? {
                        report.add_repaired(
                            Severity::Error,
                            RepairIssue::MissingAddressNode {
                                node,
                                uuid: iip_uuid.clone(),
                            },
                        );
                    }
                }
            }
        }

        // K/V map backfill: key the subnet UUID to its VN and CIDR.
        for (_, iip_uuid) in fqn_entries(&self.table, "instance-ip")? {
            let Some(subnet_uuid) = row_prop_string(&self.table, &iip_uuid, "subnet_uuid")?
            else {
                continue;
            };
            let key = format!("{}{}", SUBNET_KV_PREFIX, subnet_uuid);
            if self
                .table
                .get_column(TableId::UserAgent, &key, "value")?
                .is_some()
            {
                continue;
            }
            let Some(addr) = row_prop_string(&self.table, &iip_uuid, "instance_ip_address")?
            else {
                continue;
            };
            let Ok(addr) = addr.parse::<Ipv4Addr>() else { continue };
            let addr = u64::from(u32::from(addr));
            let mapping = subnets.iter().find_map(|(vn_fqn, vn_subnets)| {
                vn_subnets.iter().find_map(|(net, plen, _)| {
                    subnet_contains(*net, *plen, addr).then(|| {
                        format!("{} {}/{}", vn_fqn, Ipv4Addr::from(*net), plen)
                    })
                })
            });
            if let Some(value) = mapping {
                self.table.write_batch(vec![RowOp::Put {
                    table: TableId::UserAgent,
                    row: key.clone(),
                    column: "value".to_string(),
                    value,
                }])?;
                report.add_repaired(Severity::Warning, RepairIssue::MissingSubnetKey { key });
            }
        }
        Ok(())
    }
}

/// FQN strings of every live virtual network.
fn subnet_vn_fqns(table: &Arc<dyn ObjectTable>) -> Result<Vec<String>, RepairError> {
    Ok(fqn_entries(table, "virtual-network")?
        .into_iter()
        .map(|(fqn, _)| fqn)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabricd_coord::MemoryCoordStore;
    use fabricd_store::{CacheConfig, MemoryObjectTable, ObjectRecord, ObjectStore, RefEdge};
    use serde_json::json;

    use crate::checker::DbChecker;

    struct World {
        coord: Arc<dyn CoordStore>,
        table: Arc<dyn ObjectTable>,
        store: ObjectStore,
    }

    fn world() -> World {
        let coord: Arc<dyn CoordStore> = Arc::new(MemoryCoordStore::new());
        let table: Arc<dyn ObjectTable> = Arc::new(MemoryObjectTable::new());
        let store = ObjectStore::new(table.clone(), CacheConfig::default());
        World { coord, table, store }
    }

    fn healer(w: &World) -> DbHealer {
        DbHealer::new(w.coord.clone(), w.table.clone())
    }

    fn record(type_name: &str, uuid: &str, fq_name: &[&str]) -> ObjectRecord {
        let mut rec = ObjectRecord::new(type_name, uuid, fq_name);
        rec.props.insert("id_perms".to_string(), json!({"enable": true}));
        rec
    }

    #[test]
    fn test_heal_rebuilds_index_and_lock() {
        let w = world();
        // Row exists but neither index entry nor lock was written.
        w.store.object_create(&record("project", "p1", &["d", "p"])).unwrap();
        w.table
            .write_batch(vec![fabricd_store::RowOp::Delete {
                table: TableId::ObjFqName,
                row: "project".to_string(),
                column: "d:p:p1".to_string(),
            }])
            .unwrap();

        let mut report = RepairReport::default();
        healer(&w).heal_fq_name_index(&mut report).unwrap();
        assert_eq!(report.repaired, 2); // index entry + lock
        assert!(w
            .table
            .get_column(TableId::ObjFqName, "project", "d:p:p1")
            .unwrap()
            .is_some());
        assert!(w.coord.exists("/fq-name-to-uuid/project:d:p").unwrap());

        // Second pass finds nothing left to do.
        let mut again = RepairReport::default();
        healer(&w).heal_fq_name_index(&mut again).unwrap();
        assert_eq!(again.repaired, 0);
    }

    #[test]
    fn test_heal_refuses_contested_fqn() {
        let w = world();
        w.store.object_create(&record("project", "p1", &["d", "p"])).unwrap();
        // A second row claims the same FQN without an index entry.
        w.table
            .write_batch(vec![
                fabricd_store::RowOp::Put {
                    table: TableId::ObjUuid,
                    row: "p2".to_string(),
                    column: "type".to_string(),
                    value: "\"project\"".to_string(),
                },
                fabricd_store::RowOp::Put {
                    table: TableId::ObjUuid,
                    row: "p2".to_string(),
                    column: "fq_name".to_string(),
                    value: "[\"d\",\"p\"]".to_string(),
                },
            ])
            .unwrap();

        let mut report = RepairReport::default();
        healer(&w).heal_fq_name_index(&mut report).unwrap();
        assert!(report.findings.iter().any(|f| matches!(
            &f.issue,
            RepairIssue::DuplicateFqName { uuids, .. } if !f.repaired && uuids.len() == 2
        )));
        assert!(w
            .table
            .get_column(TableId::ObjFqName, "project", "d:p:p2")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_heal_children_column() {
        let w = world();
        w.store.object_create(&record("project", "p1", &["d", "p"])).unwrap();
        let mut vn = record("virtual-network", "u1", &["d", "p", "vn1"]);
        vn.parent = Some(("project".to_string(), "p1".to_string()));
        w.store.object_create(&vn).unwrap();
        w.table
            .write_batch(vec![fabricd_store::RowOp::Delete {
                table: TableId::ObjUuid,
                row: "p1".to_string(),
                column: "children:virtual-network:u1".to_string(),
            }])
            .unwrap();

        let mut report = RepairReport::default();
        healer(&w).heal_children_columns(&mut report).unwrap();
        assert_eq!(report.repaired, 1);
        assert!(w
            .table
            .get_column(TableId::ObjUuid, "p1", "children:virtual-network:u1")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_heal_missing_vn_id_node() {
        let w = world();
        let mut vn = record("virtual-network", "u1", &["d", "p", "vn1"]);
        vn.props
            .insert("virtual_network_network_id".to_string(), json!(4));
        w.store.object_create(&vn).unwrap();

        let mut report = RepairReport::default();
        healer(&w).heal_resource_ids(&mut report).unwrap();
        assert_eq!(report.repaired, 1);
        let (owner, _) = w.coord.get("/id/virtual-networks/0000000004").unwrap();
        assert_eq!(owner, "d:p:vn1");
    }

    #[test]
    fn test_heal_skips_contested_id() {
        let w = world();
        for (uuid, leaf) in [("u1", "vn1"), ("u2", "vn2")] {
            let mut vn = record("virtual-network", uuid, &["d", "p", leaf]);
            vn.props
                .insert("virtual_network_network_id".to_string(), json!(4));
            w.store.object_create(&vn).unwrap();
        }
        let mut report = RepairReport::default();
        healer(&w).heal_resource_ids(&mut report).unwrap();
        assert_eq!(report.repaired, 0);
        assert!(!w.coord.exists("/id/virtual-networks/0000000004").unwrap());
    }

    #[test]
    fn test_heal_subnet_address_and_kv() {
        let w = world();
        w.store
            .object_create(&record("virtual-network", "u-vn", &["d", "p", "vn1"]))
            .unwrap();
        // Subnet tree exists (created when the subnet allocator first
        // ran) but the address lock is gone.
        w.coord
            .create("/api-server/subnets/d:p:vn1:10.0.0.0/24", "", true)
            .unwrap();
        let mut iip = record("instance-ip", "iip1", &["iip1"]);
        iip.props
            .insert("instance_ip_address".to_string(), json!("10.0.0.5"));
        iip.props.insert("subnet_uuid".to_string(), json!("sn-1"));
        iip.refs.push(RefEdge::new("virtual-network", "u-vn"));
        w.store.object_create(&iip).unwrap();

        let mut report = RepairReport::default();
        healer(&w).heal_subnet_state(&mut report).unwrap();

        let net = u64::from(u32::from("10.0.0.5".parse::<Ipv4Addr>().unwrap()));
        let node = id_node("/api-server/subnets/d:p:vn1:10.0.0.0/24", net);
        assert!(w.coord.exists(&node).unwrap());
        assert_eq!(
            w.table
                .get_column(TableId::UserAgent, "subnet/sn-1", "value")
                .unwrap()
                .as_deref(),
            Some("d:p:vn1 10.0.0.0/24")
        );
        assert_eq!(report.repaired, 2);
    }

    #[test]
    fn test_heal_then_check_is_clean() {
        let w = world();
        let mut vn = record("virtual-network", "u1", &["d", "p", "vn1"]);
        vn.props
            .insert("virtual_network_network_id".to_string(), json!(1));
        w.store.object_create(&vn).unwrap();

        healer(&w).heal_all().unwrap();
        let report = DbChecker::new(w.coord.clone(), w.table.clone())
            .check_all()
            .unwrap();
        assert!(report.is_clean(), "unexpected findings: {:?}", report.findings);
    }
}
