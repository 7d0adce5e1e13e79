//! Raw-table scan helpers shared by the checker, healer, and cleaner.
//!
//! The repair tool works below the object-store cache on purpose: it
//! reads rows and columns directly so a poisoned cache entry can never
//! mask an on-disk inconsistency.

use std::collections::BTreeMap;
use std::sync::Arc;

use fabricd_alloc::ID_PAD;
use fabricd_coord::{CoordError, CoordStore};
use fabricd_store::{ObjectTable, TableId};

use crate::error::RepairError;

/// Root of the per-FQN creation locks in the coordination store.
pub const FQN_LOCK_ROOT: &str = "/fq-name-to-uuid";

/// Root of the per-subnet address lock trees.
pub const SUBNET_LOCK_ROOT: &str = "/api-server/subnets";

/// Key prefix of subnet mappings in the user-agent K/V table.
pub const SUBNET_KV_PREFIX: &str = "subnet/";

/// Columns every object row must carry.
pub const MANDATORY_COLUMNS: &[&str] = &["type", "fq_name", "prop:id_perms"];

/// Renders the znode path for an allocated ID.
pub fn id_node(base: &str, id: u64) -> String {
    format!("{}/{:0pad$}", base, id, pad = ID_PAD)
}

/// Parses an allocation znode name; None if malformed.
pub fn parse_id_node(name: &str) -> Option<u64> {
    if name.len() != ID_PAD || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// The FQN lock node path for a typed FQN.
pub fn fqn_lock_node(type_name: &str, fq_name_str: &str) -> String {
    format!("{}/{}:{}", FQN_LOCK_ROOT, type_name, fq_name_str)
}

/// Extracts the numeric ID from a route-target name
/// (`target:<asn>:<id>`).
pub fn route_target_id(name: &str) -> Option<u64> {
    let mut parts = name.split(':');
    if parts.next() != Some("target") {
        return None;
    }
    parts.next()?;
    let id = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    id.parse().ok()
}

/// Lists children of a path, treating a missing node as empty.
pub fn children_or_empty(
    coord: &Arc<dyn CoordStore>,
    path: &str,
) -> Result<Vec<String>, RepairError> {
    match coord.children(path) {
        Ok(names) => Ok(names),
        Err(CoordError::NodeNotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Reads a row's type column, parsed from its JSON encoding.
pub fn row_type(
    table: &Arc<dyn ObjectTable>,
    uuid: &str,
) -> Result<Option<String>, RepairError> {
    Ok(table
        .get_column(TableId::ObjUuid, uuid, "type")?
        .and_then(|raw| serde_json::from_str(&raw).ok()))
}

/// Reads a row's fq_name column as name components.
pub fn row_fq_name(
    table: &Arc<dyn ObjectTable>,
    uuid: &str,
) -> Result<Option<Vec<String>>, RepairError> {
    Ok(table
        .get_column(TableId::ObjUuid, uuid, "fq_name")?
        .and_then(|raw| serde_json::from_str(&raw).ok()))
}

/// Reads a scalar property as u64.
pub fn row_prop_u64(
    table: &Arc<dyn ObjectTable>,
    uuid: &str,
    name: &str,
) -> Result<Option<u64>, RepairError> {
    Ok(table
        .get_column(TableId::ObjUuid, uuid, &format!("prop:{}", name))?
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|v| v.as_u64()))
}

/// Reads a scalar property as a string.
pub fn row_prop_string(
    table: &Arc<dyn ObjectTable>,
    uuid: &str,
    name: &str,
) -> Result<Option<String>, RepairError> {
    Ok(table
        .get_column(TableId::ObjUuid, uuid, &format!("prop:{}", name))?
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|v| v.as_str().map(str::to_string)))
}

/// Lists `(fq_name_str, uuid)` pairs of the FQN index for a type.
pub fn fqn_entries(
    table: &Arc<dyn ObjectTable>,
    type_name: &str,
) -> Result<Vec<(String, String)>, RepairError> {
    let mut out = Vec::new();
    for (col, _) in table.get_columns_prefixed(TableId::ObjFqName, type_name, "")? {
        if let Some((fqn, uuid)) = col.rsplit_once(':') {
            out.push((fqn.to_string(), uuid.to_string()));
        }
    }
    Ok(out)
}

/// Maps each allocated ID of a type to the row UUIDs claiming it.
pub fn claimed_ids(
    table: &Arc<dyn ObjectTable>,
    type_name: &str,
    prop: &str,
) -> Result<BTreeMap<u64, Vec<String>>, RepairError> {
    let mut out: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    for (_, uuid) in fqn_entries(table, type_name)? {
        if let Some(id) = row_prop_u64(table, &uuid, prop)? {
            out.entry(id).or_default().push(uuid);
        }
    }
    Ok(out)
}

/// `vn_fqn → address-int → instance-ip uuid` for every v4 instance-ip
/// with a VN ref.
pub fn instance_ip_claims(
    table: &Arc<dyn ObjectTable>,
) -> Result<BTreeMap<String, BTreeMap<u64, String>>, RepairError> {
    let mut claims: BTreeMap<String, BTreeMap<u64, String>> = BTreeMap::new();
    for (_, iip_uuid) in fqn_entries(table, "instance-ip")? {
        let Some(addr) = row_prop_string(table, &iip_uuid, "instance_ip_address")? else {
            continue;
        };
        let Ok(addr) = addr.parse::<std::net::Ipv4Addr>() else { continue };
        let refs =
            table.get_columns_prefixed(TableId::ObjUuid, &iip_uuid, "ref:virtual-network:")?;
        for (col, _) in refs {
            let vn_uuid = &col["ref:virtual-network:".len()..];
            if let Some(fq_name) = row_fq_name(table, vn_uuid)? {
                claims
                    .entry(fq_name.join(":"))
                    .or_default()
                    .insert(u64::from(u32::from(addr)), iip_uuid.clone());
            }
        }
    }
    Ok(claims)
}

/// True if the v4 address int falls inside `net/plen`.
pub fn subnet_contains(net: u32, plen: u8, addr: u64) -> bool {
    let size = 1u64 << (32 - plen as u32);
    addr >= net as u64 && addr < net as u64 + size
}

/// Address ints a subnet never hands out: network, gateway, DNS, and
/// broadcast.
pub fn reserved_addresses(net: u32, plen: u8) -> Vec<u64> {
    let mut out = vec![net as u64, net as u64 + 1, net as u64 + 2];
    if plen < 31 {
        let size = 1u64 << (32 - plen as u32);
        out.push(net as u64 + size - 1);
    }
    out
}
