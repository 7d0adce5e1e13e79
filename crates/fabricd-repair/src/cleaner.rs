//! Removal of stale state.
//!
//! The cleaner deletes index entries, edges, rows, and znodes that no
//! live object justifies. Each pass is idempotent; a pass that deletes
//! a row may expose new stale edges, so operators run check → clean
//! until clean reports nothing. Everything here follows the same trust
//! order as the checker: rows own content, znodes own allocations.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use fabricd_alloc::namespaces::RT_SYSTEM_MIN;
use fabricd_coord::CoordStore;
use fabricd_store::{ObjectTable, RowOp, TableId};

use crate::error::RepairError;
use crate::report::{RepairIssue, RepairReport, Severity};
use crate::scan::{
    children_or_empty, claimed_ids, fqn_entries, fqn_lock_node, id_node, instance_ip_claims,
    parse_id_node, reserved_addresses, route_target_id, row_fq_name, row_type, FQN_LOCK_ROOT,
    MANDATORY_COLUMNS, SUBNET_KV_PREFIX, SUBNET_LOCK_ROOT,
};

/// Idempotent remover of stale derived state.
pub struct DbCleaner {
    coord: Arc<dyn CoordStore>,
    table: Arc<dyn ObjectTable>,
}

impl DbCleaner {
    /// Creates a cleaner over the two stores.
    pub fn new(coord: Arc<dyn CoordStore>, table: Arc<dyn ObjectTable>) -> Self {
        Self { coord, table }
    }

    /// Runs every clean pass except the destructive ID resync.
    pub fn clean_all(&self) -> Result<RepairReport, RepairError> {
        let mut report = RepairReport::default();
        self.clean_orphan_rows(&mut report)?;
        self.clean_stale_fq_names(&mut report)?;
        self.clean_stale_edges(&mut report)?;
        self.clean_stale_ids(&mut report)?;
        self.clean_stale_subnets(&mut report)?;
        self.clean_stale_virtual_machines(&mut report)?;
        tracing::info!(repaired = report.repaired, "db clean complete");
        Ok(report)
    }

    /// Drops the row, its FQN index entry, and its FQN lock.
    fn remove_object(&self, uuid: &str) -> Result<(), RepairError> {
        let mut ops = vec![RowOp::DeleteRow {
            table: TableId::ObjUuid,
            row: uuid.to_string(),
        }];
        if let (Some(type_name), Some(fq_name)) =
            (row_type(&self.table, uuid)?, row_fq_name(&self.table, uuid)?)
        {
            let fqn = fq_name.join(":");
            ops.push(RowOp::Delete {
                table: TableId::ObjFqName,
                row: type_name.clone(),
                column: format!("{}:{}", fqn, uuid),
            });
            self.coord.delete(&fqn_lock_node(&type_name, &fqn), false)?;
        }
        self.table.write_batch(ops)?;
        Ok(())
    }

    /// Removes FQN index entries and FQN locks with no backing row.
    pub fn clean_stale_fq_names(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        for type_name in self.table.row_keys(TableId::ObjFqName, None, None)? {
            for (fqn, uuid) in fqn_entries(&self.table, &type_name)? {
                let live = row_type(&self.table, &uuid)?.is_some_and(|t| t == type_name);
                if !live {
                    self.table.write_batch(vec![RowOp::Delete {
                        table: TableId::ObjFqName,
                        row: type_name.clone(),
                        column: format!("{}:{}", fqn, uuid),
                    }])?;
                    report.add_repaired(
                        Severity::Error,
                        RepairIssue::StaleFqNameEntry {
                            type_name: type_name.clone(),
                            column: format!("{}:{}", fqn, uuid),
                        },
                    );
                }
            }
        }
        for name in children_or_empty(&self.coord, FQN_LOCK_ROOT)? {
            let node = format!("{}/{}", FQN_LOCK_ROOT, name);
            let (uuid, _) = self.coord.get(&node)?;
            if uuid.is_empty() || row_type(&self.table, &uuid)?.is_none() {
                self.coord.delete(&node, false)?;
                report.add_repaired(Severity::Warning, RepairIssue::StaleFqNameLock { node });
            }
        }
        Ok(())
    }

    /// Removes rows missing mandatory columns and rows whose parent is
    /// gone.
    pub fn clean_orphan_rows(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        for uuid in self.table.row_keys(TableId::ObjUuid, None, None)? {
            let Some(row) = self.table.get_row(TableId::ObjUuid, &uuid)? else {
                continue;
            };
            if let Some(column) = MANDATORY_COLUMNS.iter().find(|c| !row.contains_key(**c)) {
                self.remove_object(&uuid)?;
                report.add_repaired(
                    Severity::Error,
                    RepairIssue::MissingMandatoryColumn {
                        uuid: uuid.clone(),
                        column: column.to_string(),
                    },
                );
                continue;
            }
            let parent = row.keys().find_map(|c| {
                c.strip_prefix("parent:")
                    .and_then(|rest| rest.split_once(':'))
                    .map(|(_, u)| u.to_string())
            });
            if let Some(parent_uuid) = parent {
                if row_type(&self.table, &parent_uuid)?.is_none() {
                    self.remove_object(&uuid)?;
                    report.add_repaired(
                        Severity::Error,
                        RepairIssue::OrphanRow {
                            uuid: uuid.clone(),
                            parent_uuid,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Removes edge columns pointing at rows that no longer exist.
    pub fn clean_stale_edges(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        for uuid in self.table.row_keys(TableId::ObjUuid, None, None)? {
            let Some(row) = self.table.get_row(TableId::ObjUuid, &uuid)? else {
                continue;
            };
            for column in row.keys() {
                let target = if let Some(rest) = column
                    .strip_prefix("children:")
                    .or_else(|| column.strip_prefix("ref:"))
                    .or_else(|| column.strip_prefix("backref:"))
                {
                    rest.split_once(':').map(|(_, u)| u)
                } else {
                    column.strip_prefix("relaxbackref:")
                };
                let Some(target) = target else { continue };
                if row_type(&self.table, target)?.is_none() {
                    self.table.write_batch(vec![RowOp::Delete {
                        table: TableId::ObjUuid,
                        row: uuid.clone(),
                        column: column.clone(),
                    }])?;
                    report.add_repaired(
                        Severity::Warning,
                        RepairIssue::StaleEdge {
                            uuid: uuid.clone(),
                            column: column.clone(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Removes allocation znodes no live row claims, across the VN,
    /// SG, route-target, and tag namespaces.
    pub fn clean_stale_ids(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        let vn = claimed_ids(&self.table, "virtual-network", "virtual_network_network_id")?;
        self.clean_id_namespace(report, "/id/virtual-networks", &vn, None)?;
        let sg = claimed_ids(&self.table, "security-group", "security_group_id")?;
        self.clean_id_namespace(report, "/id/security-groups", &sg, Some(0))?;
        let tag_types = claimed_ids(&self.table, "tag-type", "tag_type_id")?;
        self.clean_id_namespace(report, "/id/tag-types", &tag_types, None)?;

        // Tag values live in one namespace per tag type.
        let mut tags_by_type: BTreeMap<String, BTreeMap<u64, Vec<String>>> = BTreeMap::new();
        for (_, uuid) in fqn_entries(&self.table, "tag")? {
            let type_name =
                crate::scan::row_prop_string(&self.table, &uuid, "tag_type_name")?;
            let id = crate::scan::row_prop_u64(&self.table, &uuid, "tag_id")?;
            if let (Some(type_name), Some(id)) = (type_name, id) {
                tags_by_type
                    .entry(type_name)
                    .or_default()
                    .entry(id)
                    .or_default()
                    .push(uuid);
            }
        }
        for dir in children_or_empty(&self.coord, "/id/tag-values")? {
            let empty = BTreeMap::new();
            let claimed = tags_by_type.get(&dir).unwrap_or(&empty);
            self.clean_id_namespace(report, &format!("/id/tag-values/{}", dir), claimed, None)?;
        }

        self.clean_route_target_ids(report)
    }

    fn clean_id_namespace(
        &self,
        report: &mut RepairReport,
        base: &str,
        claimed: &BTreeMap<u64, Vec<String>>,
        reserved: Option<u64>,
    ) -> Result<(), RepairError> {
        for name in children_or_empty(&self.coord, base)? {
            let node = format!("{}/{}", base, name);
            match parse_id_node(&name) {
                None => {
                    self.coord.delete(&node, true)?;
                    report.add_repaired(Severity::Warning, RepairIssue::BadIdNodeName { node });
                }
                Some(id) => {
                    if reserved != Some(id) && !claimed.contains_key(&id) {
                        self.coord.delete(&node, false)?;
                        report
                            .add_repaired(Severity::Warning, RepairIssue::StaleIdNode { node });
                    }
                }
            }
        }
        Ok(())
    }

    /// Removes route-target znodes no row claims and any znode below
    /// the system minimum; user-range targets have no znodes at all.
    fn clean_route_target_ids(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        let base = "/id/bgp/route-targets";
        let mut claimed = BTreeMap::new();
        for (fqn, uuid) in fqn_entries(&self.table, "route-target")? {
            if let Some(id) = route_target_id(&fqn) {
                claimed.insert(id, uuid);
            }
        }
        for name in children_or_empty(&self.coord, base)? {
            let node = format!("{}/{}", base, name);
            let Some(id) = parse_id_node(&name) else {
                self.coord.delete(&node, true)?;
                report.add_repaired(Severity::Warning, RepairIssue::BadIdNodeName { node });
                continue;
            };
            if id < RT_SYSTEM_MIN {
                self.coord.delete(&node, false)?;
                report.add_repaired(
                    Severity::Error,
                    RepairIssue::MisrangedRouteTarget {
                        uuid: claimed.get(&id).cloned().unwrap_or_default(),
                        id,
                    },
                );
            } else if !claimed.contains_key(&id) {
                self.coord.delete(&node, false)?;
                report.add_repaired(Severity::Warning, RepairIssue::StaleIdNode { node });
            }
        }
        Ok(())
    }

    /// Removes subnet trees of dead VNs, address locks no instance-ip
    /// claims, and stale subnet K/V mappings.
    pub fn clean_stale_subnets(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        let vns: BTreeMap<String, String> = fqn_entries(&self.table, "virtual-network")?
            .into_iter()
            .collect();
        let claims = instance_ip_claims(&self.table)?;

        for tree in children_or_empty(&self.coord, SUBNET_LOCK_ROOT)? {
            let root = format!("{}/{}", SUBNET_LOCK_ROOT, tree);
            let vn_fqn = vns.keys().find(|fqn| {
                tree.len() > fqn.len() + 1
                    && tree.starts_with(fqn.as_str())
                    && tree.as_bytes()[fqn.len()] == b':'
            });
            let Some(vn_fqn) = vn_fqn else {
                self.coord.delete(&root, true)?;
                report.add_repaired(
                    Severity::Warning,
                    RepairIssue::DanglingSubnetTree { node: root },
                );
                continue;
            };
            let Ok(network) = tree[vn_fqn.len() + 1..].parse::<Ipv4Addr>() else {
                continue;
            };
            let net = u32::from(network);
            let empty = BTreeMap::new();
            let vn_claims = claims.get(vn_fqn.as_str()).unwrap_or(&empty);
            for prefix in children_or_empty(&self.coord, &root)? {
                let Ok(plen) = prefix.parse::<u8>() else { continue };
                if plen > 32 {
                    continue;
                }
                let dir = format!("{}/{}", root, prefix);
                for name in children_or_empty(&self.coord, &dir)? {
                    let node = format!("{}/{}", dir, name);
                    let Some(id) = parse_id_node(&name) else { continue };
                    if reserved_addresses(net, plen).contains(&id) {
                        continue;
                    }
                    if !vn_claims.contains_key(&id) {
                        self.coord.delete(&node, false)?;
                        report.add_repaired(
                            Severity::Warning,
                            RepairIssue::StaleAddressNode { node },
                        );
                    }
                }
            }
        }

        for key in self.table.row_keys(TableId::UserAgent, None, None)? {
            if !key.starts_with(SUBNET_KV_PREFIX) {
                continue;
            }
            let Some(value) = self.table.get_column(TableId::UserAgent, &key, "value")? else {
                continue;
            };
            if let Some((vn_fqn, _)) = value.split_once(' ') {
                if !vns.contains_key(vn_fqn) {
                    self.table.write_batch(vec![RowOp::DeleteRow {
                        table: TableId::UserAgent,
                        row: key.clone(),
                    }])?;
                    report.add_repaired(Severity::Warning, RepairIssue::StaleSubnetKey { key });
                }
            }
        }
        Ok(())
    }

    /// Removes virtual machines with no interface back-refs left.
    pub fn clean_stale_virtual_machines(
        &self,
        report: &mut RepairReport,
    ) -> Result<(), RepairError> {
        for (_, uuid) in fqn_entries(&self.table, "virtual-machine")? {
            let vmi_backrefs = self.table.get_columns_prefixed(
                TableId::ObjUuid,
                &uuid,
                "backref:virtual-machine-interface:",
            )?;
            if vmi_backrefs.is_empty() && row_type(&self.table, &uuid)?.is_some() {
                self.remove_object(&uuid)?;
                report.add_repaired(
                    Severity::Warning,
                    RepairIssue::StaleVirtualMachine { uuid },
                );
            }
        }
        Ok(())
    }

    /// Destructive resync of the virtual-network ID namespace: drops
    /// every znode and rebuilds the set from object rows. Intended for
    /// operator use after a VXLAN identifier-mode change, never part
    /// of [`DbCleaner::clean_all`].
    pub fn resync_network_ids(&self) -> Result<RepairReport, RepairError> {
        let mut report = RepairReport::default();
        let base = "/id/virtual-networks";
        for name in children_or_empty(&self.coord, base)? {
            self.coord.delete(&format!("{}/{}", base, name), true)?;
        }
        for (id, uuids) in
            claimed_ids(&self.table, "virtual-network", "virtual_network_network_id")?
        {
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
            let owner = row_fq_name(&self.table, &uuids[0])?
                .map(|f| f.join(":"))
                .unwrap_or_default();
            let node = id_node(base, id);
            self.coord.create(&node, &owner, true)?;
            report.add_repaired(
                Severity::Info,
                RepairIssue::MissingIdNode {
                    node,
                    uuid: uuids[0].clone(),
                },
            );
        }
        tracing::warn!(rebuilt = report.repaired, "network ID namespace resynced");
        Ok(report)
    }
}
