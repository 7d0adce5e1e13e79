//! Read-only consistency checks.
//!
//! The checker audits three states against each other: object rows,
//! the FQN index, and coordination-store allocations. It never writes;
//! the healer and cleaner act on the same findings.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use fabricd_alloc::namespaces::RT_SYSTEM_MIN;
use fabricd_coord::CoordStore;
use fabricd_store::{ObjectTable, TableId};

use crate::error::RepairError;
use crate::report::{RepairIssue, RepairReport, Severity};
use crate::scan::{
    children_or_empty, claimed_ids, fqn_entries, fqn_lock_node, id_node, instance_ip_claims,
    parse_id_node, reserved_addresses, route_target_id, row_fq_name, row_prop_string, row_type,
    subnet_contains, FQN_LOCK_ROOT, MANDATORY_COLUMNS, SUBNET_KV_PREFIX, SUBNET_LOCK_ROOT,
};

/// Which check families to run.
#[derive(Clone, Debug)]
pub struct CheckConfig {
    /// FQN index and FQN lock consistency.
    pub check_fq_names: bool,
    /// Mandatory columns, orphan rows, stale edges.
    pub check_rows: bool,
    /// Virtual-network and security-group ID allocations.
    pub check_ids: bool,
    /// Route-target allocations and ranges.
    pub check_route_targets: bool,
    /// Subnet lock trees, address locks, and the subnet K/V map.
    pub check_subnets: bool,
    /// Stop after this many findings.
    pub max_findings: usize,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            check_fq_names: true,
            check_rows: true,
            check_ids: true,
            check_route_targets: true,
            check_subnets: true,
            max_findings: 1000,
        }
    }
}

/// Read-only auditor over the two stores.
pub struct DbChecker {
    coord: Arc<dyn CoordStore>,
    table: Arc<dyn ObjectTable>,
    config: CheckConfig,
}

impl DbChecker {
    /// Creates a checker with the default configuration.
    pub fn new(coord: Arc<dyn CoordStore>, table: Arc<dyn ObjectTable>) -> Self {
        Self::with_config(coord, table, CheckConfig::default())
    }

    /// Creates a checker with an explicit configuration.
    pub fn with_config(
        coord: Arc<dyn CoordStore>,
        table: Arc<dyn ObjectTable>,
        config: CheckConfig,
    ) -> Self {
        Self {
            coord,
            table,
            config,
        }
    }

    /// Runs every enabled check family.
    pub fn check_all(&self) -> Result<RepairReport, RepairError> {
        let mut report = RepairReport::default();
        if self.config.check_fq_names {
            self.check_fq_name_index(&mut report)?;
        }
        if self.config.check_rows {
            self.check_rows(&mut report)?;
        }
        if self.config.check_ids {
            self.check_ids(&mut report)?;
        }
        if self.config.check_route_targets {
            self.check_route_targets(&mut report)?;
        }
        if self.config.check_subnets {
            self.check_subnets(&mut report)?;
        }
        tracing::info!(
            errors = report.errors,
            warnings = report.warnings,
            "db check complete"
        );
        Ok(report)
    }

    fn full(&self, report: &RepairReport) -> bool {
        report.findings.len() >= self.config.max_findings
    }

    /// FQN index entries, object rows, and FQN locks must agree in
    /// both directions.
    pub fn check_fq_name_index(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        for type_name in self.table.row_keys(TableId::ObjFqName, None, None)? {
            let mut by_fqn: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for (fqn, uuid) in fqn_entries(&self.table, &type_name)? {
                if self.full(report) {
                    return Ok(());
                }
                match row_type(&self.table, &uuid)? {
                    Some(t) if t == type_name => {
                        by_fqn.entry(fqn.clone()).or_default().push(uuid);
                        if !self.coord.exists(&fqn_lock_node(&type_name, &fqn))? {
                            report.add(
                                Severity::Warning,
                                RepairIssue::MissingFqNameLock {
                                    type_name: type_name.clone(),
                                    fq_name: fqn,
                                },
                            );
                        }
                    }
                    _ => report.add(
                        Severity::Error,
                        RepairIssue::StaleFqNameEntry {
                            type_name: type_name.clone(),
                            column: format!("{}:{}", fqn, uuid),
                        },
                    ),
                }
            }
            for (fqn, uuids) in by_fqn {
                if uuids.len() > 1 {
                    report.add(
                        Severity::Error,
                        RepairIssue::DuplicateFqName {
                            type_name: type_name.clone(),
                            fq_name: fqn,
                            uuids,
                        },
                    );
                }
            }
        }

        // Reverse direction: every row must appear in the index.
        for uuid in self.table.row_keys(TableId::ObjUuid, None, None)? {
            if self.full(report) {
                return Ok(());
            }
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
                report.add(
                    Severity::Error,
                    RepairIssue::MissingFqNameEntry {
                        type_name,
                        fq_name: fqn,
                        uuid,
                    },
                );
            }
        }

        // Locks with no backing row.
        for name in children_or_empty(&self.coord, FQN_LOCK_ROOT)? {
            if self.full(report) {
                return Ok(());
            }
            let node = format!("{}/{}", FQN_LOCK_ROOT, name);
            let (uuid, _) = self.coord.get(&node)?;
            if uuid.is_empty() || row_type(&self.table, &uuid)?.is_none() {
                report.add(Severity::Warning, RepairIssue::StaleFqNameLock { node });
            }
        }
        Ok(())
    }

    /// Mandatory columns, orphaned rows, stale edges, and children
    /// columns the parent is missing.
    pub fn check_rows(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        for uuid in self.table.row_keys(TableId::ObjUuid, None, None)? {
            if self.full(report) {
                return Ok(());
            }
            let Some(row) = self.table.get_row(TableId::ObjUuid, &uuid)? else {
                continue;
            };
            for column in MANDATORY_COLUMNS {
                if !row.contains_key(*column) {
                    report.add(
                        Severity::Error,
                        RepairIssue::MissingMandatoryColumn {
                            uuid: uuid.clone(),
                            column: column.to_string(),
                        },
                    );
                }
            }
            for column in row.keys() {
                let target = if let Some(rest) = column.strip_prefix("parent:") {
                    rest.split_once(':').map(|(_, u)| u)
                } else if let Some(rest) = column
                    .strip_prefix("children:")
                    .or_else(|| column.strip_prefix("ref:"))
                    .or_else(|| column.strip_prefix("backref:"))
                {
                    rest.split_once(':').map(|(_, u)| u)
                } else {
                    column.strip_prefix("relaxbackref:")
                };
                let Some(target) = target else { continue };
                let target_live = row_type(&self.table, target)?.is_some();
                if column.starts_with("parent:") {
                    if !target_live {
                        report.add(
                            Severity::Error,
                            RepairIssue::OrphanRow {
                                uuid: uuid.clone(),
                                parent_uuid: target.to_string(),
                            },
                        );
                    } else if let Some(type_name) = row_type(&self.table, &uuid)? {
                        // Parent must list this row as a child.
                        let child_col = format!("children:{}:{}", type_name, uuid);
                        if self
                            .table
                            .get_column(TableId::ObjUuid, target, &child_col)?
                            .is_none()
                        {
                            report.add(
                                Severity::Warning,
                                RepairIssue::MissingChildrenColumn {
                                    parent_uuid: target.to_string(),
                                    column: child_col,
                                },
                            );
                        }
                    }
                } else if !target_live {
                    report.add(
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

    /// Virtual-network and security-group ID allocations match their
    /// znodes, with no duplicates.
    pub fn check_ids(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        self.check_id_namespace(
            report,
            "virtual-network",
            "virtual_network_network_id",
            "/id/virtual-networks",
            None,
        )?;
        self.check_id_namespace(
            report,
            "security-group",
            "security_group_id",
            "/id/security-groups",
            Some(0),
        )
    }

    fn check_id_namespace(
        &self,
        report: &mut RepairReport,
        type_name: &str,
        prop: &str,
        base: &str,
        reserved: Option<u64>,
    ) -> Result<(), RepairError> {
        let claimed = claimed_ids(&self.table, type_name, prop)?;
        for (id, uuids) in &claimed {
            if self.full(report) {
                return Ok(());
            }
            if uuids.len() > 1 {
                report.add(
                    Severity::Error,
                    RepairIssue::DuplicateId {
                        namespace: base.to_string(),
                        id: *id,
                        uuids: uuids.clone(),
                    },
                );
            }
            let node = id_node(base, *id);
            if !self.coord.exists(&node)? {
                report.add(
                    Severity::Error,
                    RepairIssue::MissingIdNode {
                        node,
                        uuid: uuids[0].clone(),
                    },
                );
            }
        }
        for name in children_or_empty(&self.coord, base)? {
            if self.full(report) {
                return Ok(());
            }
            let node = format!("{}/{}", base, name);
            match parse_id_node(&name) {
                None => report.add(Severity::Warning, RepairIssue::BadIdNodeName { node }),
                Some(id) => {
                    if reserved != Some(id) && !claimed.contains_key(&id) {
                        report.add(Severity::Warning, RepairIssue::StaleIdNode { node });
                    }
                }
            }
        }
        Ok(())
    }

    /// System route-target allocations exist and sit above the system
    /// minimum; user-range targets are left alone.
    pub fn check_route_targets(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        let base = "/id/bgp/route-targets";
        let mut claimed: BTreeMap<u64, String> = BTreeMap::new();
        for (fqn, uuid) in fqn_entries(&self.table, "route-target")? {
            let Some(id) = route_target_id(&fqn) else { continue };
            claimed.insert(id, uuid.clone());
            if id >= RT_SYSTEM_MIN {
                let node = id_node(base, id);
                if !self.coord.exists(&node)? {
                    report.add(Severity::Error, RepairIssue::MissingIdNode { node, uuid });
                }
            }
        }
        for name in children_or_empty(&self.coord, base)? {
            if self.full(report) {
                return Ok(());
            }
            let node = format!("{}/{}", base, name);
            let Some(id) = parse_id_node(&name) else {
                report.add(Severity::Warning, RepairIssue::BadIdNodeName { node });
                continue;
            };
            if id < RT_SYSTEM_MIN {
                report.add(
                    Severity::Error,
                    RepairIssue::MisrangedRouteTarget {
                        uuid: claimed.get(&id).cloned().unwrap_or_default(),
                        id,
                    },
                );
            } else if !claimed.contains_key(&id) {
                report.add(Severity::Warning, RepairIssue::StaleIdNode { node });
            }
        }
        Ok(())
    }

    /// Subnet lock trees belong to live virtual networks, address
    /// locks match instance-ip rows, and the subnet K/V map is
    /// two-way consistent.
    pub fn check_subnets(&self, report: &mut RepairReport) -> Result<(), RepairError> {
        let vns: BTreeMap<String, String> = fqn_entries(&self.table, "virtual-network")?
            .into_iter()
            .collect();
        let claims = instance_ip_claims(&self.table)?;

        for tree in children_or_empty(&self.coord, SUBNET_LOCK_ROOT)? {
            if self.full(report) {
                return Ok(());
            }
            let root = format!("{}/{}", SUBNET_LOCK_ROOT, tree);
            // Tree names are `<vn_fqn>:<network>`; the FQN itself
            // contains colons, so match against live VNs by prefix.
            let vn_fqn = vns.keys().find(|fqn| {
                tree.len() > fqn.len() + 1
                    && tree.starts_with(fqn.as_str())
                    && tree.as_bytes()[fqn.len()] == b':'
            });
            let Some(vn_fqn) = vn_fqn else {
                report.add(
                    Severity::Warning,
                    RepairIssue::DanglingSubnetTree { node: root },
                );
                continue;
            };
            let network = &tree[vn_fqn.len() + 1..];
            let Ok(network) = network.parse::<Ipv4Addr>() else {
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
                let mut present = Vec::new();
                for name in children_or_empty(&self.coord, &dir)? {
                    if self.full(report) {
                        return Ok(());
                    }
                    let node = format!("{}/{}", dir, name);
                    let Some(id) = parse_id_node(&name) else {
                        report.add(Severity::Warning, RepairIssue::BadIdNodeName { node });
                        continue;
                    };
                    present.push(id);
                    if reserved_addresses(net, plen).contains(&id) {
                        continue;
                    }
                    if !vn_claims.contains_key(&id) {
                        report.add(Severity::Warning, RepairIssue::StaleAddressNode { node });
                    }
                }
                for (addr, iip_uuid) in vn_claims {
                    if subnet_contains(net, plen, *addr) && !present.contains(addr) {
                        report.add(
                            Severity::Error,
                            RepairIssue::MissingAddressNode {
                                node: id_node(&dir, *addr),
                                uuid: iip_uuid.clone(),
                            },
                        );
                    }
                }
            }
        }

        // K/V map: every instance-ip's subnet must be mapped, and
        // every mapping must name a live VN.
        for (_, iip_uuid) in fqn_entries(&self.table, "instance-ip")? {
            if let Some(subnet_uuid) = row_prop_string(&self.table, &iip_uuid, "subnet_uuid")? {
                let key = format!("{}{}", SUBNET_KV_PREFIX, subnet_uuid);
                if self
                    .table
                    .get_column(TableId::UserAgent, &key, "value")?
                    .is_none()
                {
                    report.add(Severity::Warning, RepairIssue::MissingSubnetKey { key });
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
            if let Some((vn_fqn, _cidr)) = value.split_once(' ') {
                if !vns.contains_key(vn_fqn) {
                    report.add(Severity::Warning, RepairIssue::StaleSubnetKey { key });
                }
            }
        }
        Ok(())
    }
}
