//! Typed audit report shared by the checker, healer, and cleaner.

/// Severity level of a single audit finding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Indicates corrupted or conflicting control-plane state.
    Error,
    /// Indicates recoverable or cosmetic inconsistency.
    Warning,
    /// Informational note.
    Info,
}

impl Severity {
    /// Returns true if this severity is Error.
    pub fn is_error(&self) -> bool {
        matches!(self, Severity::Error)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

/// A detected inconsistency between the object store, the FQN index,
/// and the coordination store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepairIssue {
    /// An object row has no FQN index entry.
    MissingFqNameEntry {
        /// Resource type.
        type_name: String,
        /// Colon-joined FQN.
        fq_name: String,
        /// Row UUID.
        uuid: String,
    },
    /// An FQN index entry points at a missing object row.
    StaleFqNameEntry {
        /// Resource type (index row key).
        type_name: String,
        /// The raw `<fqn>:<uuid>` column.
        column: String,
    },
    /// Two or more live rows claim the same FQN.
    DuplicateFqName {
        /// Resource type.
        type_name: String,
        /// Colon-joined FQN.
        fq_name: String,
        /// Claiming UUIDs.
        uuids: Vec<String>,
    },
    /// A live row has no FQN lock node in the coordination store.
    MissingFqNameLock {
        /// Resource type.
        type_name: String,
        /// Colon-joined FQN.
        fq_name: String,
    },
    /// An FQN lock node has no backing object row.
    StaleFqNameLock {
        /// Full coordination-store path.
        node: String,
    },
    /// A row is missing one of the columns every object must carry.
    MissingMandatoryColumn {
        /// Row UUID.
        uuid: String,
        /// Missing column name.
        column: String,
    },
    /// A row's parent points at a missing row.
    OrphanRow {
        /// Row UUID.
        uuid: String,
        /// Missing parent UUID.
        parent_uuid: String,
    },
    /// A ref, back-ref, children, or relaxed-back-ref column points at
    /// a missing row.
    StaleEdge {
        /// Row carrying the column.
        uuid: String,
        /// The stale column name.
        column: String,
    },
    /// A child row exists but the parent lacks the children column.
    MissingChildrenColumn {
        /// Parent row UUID.
        parent_uuid: String,
        /// The absent children column name.
        column: String,
    },
    /// Two or more rows of a type claim the same allocated ID.
    DuplicateId {
        /// Allocator namespace base path.
        namespace: String,
        /// The contested ID.
        id: u64,
        /// Claiming UUIDs.
        uuids: Vec<String>,
    },
    /// A row claims an ID with no znode backing the allocation.
    MissingIdNode {
        /// Full znode path that should exist.
        node: String,
        /// Claiming row UUID.
        uuid: String,
    },
    /// An allocation znode no live row claims.
    StaleIdNode {
        /// Full znode path.
        node: String,
    },
    /// An allocation znode whose name is not a zero-padded decimal ID.
    BadIdNodeName {
        /// Full znode path.
        node: String,
    },
    /// A system route-target allocation below the system minimum.
    MisrangedRouteTarget {
        /// Route-target row UUID, empty when only the znode exists.
        uuid: String,
        /// The out-of-range ID.
        id: u64,
    },
    /// An instance-ip names a subnet with no user-agent K/V mapping.
    MissingSubnetKey {
        /// The absent K/V key.
        key: String,
    },
    /// A subnet K/V mapping whose virtual network no longer exists.
    StaleSubnetKey {
        /// The stale K/V key.
        key: String,
    },
    /// A subnet lock tree whose virtual network no longer exists.
    DanglingSubnetTree {
        /// Root of the stale tree.
        node: String,
    },
    /// An allocated instance-ip address with no lock znode.
    MissingAddressNode {
        /// Full znode path that should exist.
        node: String,
        /// Owning instance-ip UUID.
        uuid: String,
    },
    /// An address lock znode no instance-ip claims.
    StaleAddressNode {
        /// Full znode path.
        node: String,
    },
    /// A virtual machine with no interfaces left.
    StaleVirtualMachine {
        /// Virtual-machine row UUID.
        uuid: String,
    },
}

impl std::fmt::Display for RepairIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepairIssue::MissingFqNameEntry {
                type_name,
                fq_name,
                uuid,
            } => write!(
                f,
                "Row {} ({} {}) has no FQN index entry",
                uuid, type_name, fq_name
            ),
            RepairIssue::StaleFqNameEntry { type_name, column } => {
                write!(f, "Stale FQN index entry {}/{}", type_name, column)
            }
            RepairIssue::DuplicateFqName {
                type_name,
                fq_name,
                uuids,
            } => write!(
                f,
                "Duplicate FQN {} {} claimed by {}",
                type_name,
                fq_name,
                uuids.join(", ")
            ),
            RepairIssue::MissingFqNameLock { type_name, fq_name } => {
                write!(f, "No FQN lock for {} {}", type_name, fq_name)
            }
            RepairIssue::StaleFqNameLock { node } => {
                write!(f, "Stale FQN lock {}", node)
            }
            RepairIssue::MissingMandatoryColumn { uuid, column } => {
                write!(f, "Row {} missing mandatory column {}", uuid, column)
            }
            RepairIssue::OrphanRow { uuid, parent_uuid } => {
                write!(f, "Row {} orphaned; parent {} missing", uuid, parent_uuid)
            }
            RepairIssue::StaleEdge { uuid, column } => {
                write!(f, "Row {} carries stale edge {}", uuid, column)
            }
            RepairIssue::MissingChildrenColumn { parent_uuid, column } => {
                write!(f, "Parent {} missing {}", parent_uuid, column)
            }
            RepairIssue::DuplicateId { namespace, id, uuids } => write!(
                f,
                "Duplicate ID {} under {} claimed by {}",
                id,
                namespace,
                uuids.join(", ")
            ),
            RepairIssue::MissingIdNode { node, uuid } => {
                write!(f, "Row {} claims unbacked allocation {}", uuid, node)
            }
            RepairIssue::StaleIdNode { node } => {
                write!(f, "Stale allocation {}", node)
            }
            RepairIssue::BadIdNodeName { node } => {
                write!(f, "Malformed allocation node name {}", node)
            }
            RepairIssue::MisrangedRouteTarget { uuid, id } => {
                write!(f, "Route-target ID {} below system minimum ({})", id, uuid)
            }
            RepairIssue::MissingSubnetKey { key } => {
                write!(f, "Missing subnet K/V mapping {}", key)
            }
            RepairIssue::StaleSubnetKey { key } => {
                write!(f, "Stale subnet K/V mapping {}", key)
            }
            RepairIssue::DanglingSubnetTree { node } => {
                write!(f, "Dangling subnet lock tree {}", node)
            }
            RepairIssue::MissingAddressNode { node, uuid } => {
                write!(f, "Instance-ip {} has no address lock {}", uuid, node)
            }
            RepairIssue::StaleAddressNode { node } => {
                write!(f, "Stale address lock {}", node)
            }
            RepairIssue::StaleVirtualMachine { uuid } => {
                write!(f, "Virtual machine {} has no interfaces", uuid)
            }
        }
    }
}

/// A single finding from one audit pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finding {
    /// Severity of this finding.
    pub severity: Severity,
    /// The detected issue.
    pub issue: RepairIssue,
    /// Whether the issue was repaired in the same pass.
    pub repaired: bool,
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.severity, self.issue)?;
        if self.repaired {
            write!(f, " (repaired)")?;
        }
        Ok(())
    }
}

/// Aggregate result of a check, heal, or clean pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// All findings in scan order.
    pub findings: Vec<Finding>,
    /// Count of error-severity findings.
    pub errors: u64,
    /// Count of warning-severity findings.
    pub warnings: u64,
    /// Count of repaired issues.
    pub repaired: u64,
}

impl RepairReport {
    /// Records an unrepaired finding.
    pub fn add(&mut self, severity: Severity, issue: RepairIssue) {
        self.push(Finding {
            severity,
            issue,
            repaired: false,
        });
    }

    /// Records a finding that was fixed in the same pass.
    pub fn add_repaired(&mut self, severity: Severity, issue: RepairIssue) {
        self.push(Finding {
            severity,
            issue,
            repaired: true,
        });
    }

    fn push(&mut self, finding: Finding) {
        match finding.severity {
            Severity::Error => self.errors += 1,
            Severity::Warning => self.warnings += 1,
            Severity::Info => {}
        }
        if finding.repaired {
            self.repaired += 1;
        }
        self.findings.push(finding);
    }

    /// True if no error-severity findings remain unrepaired.
    pub fn is_clean(&self) -> bool {
        !self
            .findings
            .iter()
            .any(|f| f.severity.is_error() && !f.repaired)
    }
}
