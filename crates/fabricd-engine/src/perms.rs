//! Object permissions (`perms2`) and identity metadata (`id_perms`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::UserContext;

/// Read bit (rwx-style octal).
pub const PERMS_R: u8 = 4;
/// Write bit.
pub const PERMS_W: u8 = 2;
/// Execute/link bit.
pub const PERMS_X: u8 = 1;
/// Full access.
pub const PERMS_RWX: u8 = 7;

/// One tenant-share entry of `perms2`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShareEntry {
    /// Tenant the object is shared with, `<scope>:<uuid>`.
    pub tenant: String,
    /// Access bits granted to that tenant.
    pub tenant_access: u8,
}

/// Ownership and sharing policy carried on every object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Perms2 {
    /// Owning project UUID.
    pub owner: String,
    /// Access bits of the owner.
    pub owner_access: u8,
    /// Access bits of everyone.
    pub global_access: u8,
    /// Per-tenant shares.
    #[serde(default)]
    pub share: Vec<ShareEntry>,
}

impl Perms2 {
    /// Default policy owned by `project`.
    pub fn owned_by(project: &str) -> Self {
        Self {
            owner: project.to_string(),
            owner_access: PERMS_RWX,
            global_access: 0,
            share: Vec::new(),
        }
    }

    fn access_for(&self, user: &UserContext) -> u8 {
        let mut access = self.global_access;
        if !self.owner.is_empty() && self.owner == user.project_id {
            access |= self.owner_access;
        }
        for entry in &self.share {
            let tenant_uuid = entry.tenant.rsplit(':').next().unwrap_or(&entry.tenant);
            if tenant_uuid == user.project_id || tenant_uuid == user.domain_id {
                access |= entry.tenant_access;
            }
        }
        access
    }

    /// True if the caller may read the object.
    pub fn read_allowed(&self, user: &UserContext) -> bool {
        user.is_admin() || self.access_for(user) & PERMS_R != 0
    }

    /// True if the caller may mutate the object.
    pub fn write_allowed(&self, user: &UserContext) -> bool {
        user.is_admin() || self.access_for(user) & PERMS_W != 0
    }
}

/// Extracts a `Perms2` from a stored `perms2` property, falling back
/// to an unowned-open policy when absent (bootstrap objects).
pub fn perms2_of(prop: Option<&Value>) -> Perms2 {
    prop.and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(Perms2 {
            owner: String::new(),
            owner_access: PERMS_RWX,
            global_access: PERMS_RWX,
            share: Vec::new(),
        })
}

/// Builds the `id_perms` property for a new object.
pub fn new_id_perms(uuid: &str, user_visible: bool) -> Value {
    let now = chrono::Utc::now().to_rfc3339();
    serde_json::json!({
        "uuid": uuid,
        "enable": true,
        "user_visible": user_visible,
        "created": now,
        "last_modified": now,
    })
}

/// True unless the object carries `id_perms.user_visible = false`.
pub fn is_user_visible(props: &std::collections::BTreeMap<String, Value>) -> bool {
    props
        .get("id_perms")
        .and_then(|p| p.get("user_visible"))
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(project: &str) -> UserContext {
        UserContext {
            project_id: project.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_owner_has_full_access() {
        let p = Perms2::owned_by("p1");
        assert!(p.read_allowed(&user("p1")));
        assert!(p.write_allowed(&user("p1")));
        assert!(!p.read_allowed(&user("p2")));
    }

    #[test]
    fn test_global_read() {
        let mut p = Perms2::owned_by("p1");
        p.global_access = PERMS_R;
        assert!(p.read_allowed(&user("p2")));
        assert!(!p.write_allowed(&user("p2")));
    }

    #[test]
    fn test_share_entry() {
        let mut p = Perms2::owned_by("p1");
        p.share.push(ShareEntry {
            tenant: "tenant:p2".to_string(),
            tenant_access: PERMS_R,
        });
        assert!(p.read_allowed(&user("p2")));
        assert!(!p.read_allowed(&user("p3")));
    }

    #[test]
    fn test_admin_bypass() {
        let p = Perms2::owned_by("p1");
        let mut admin = user("p9");
        admin.roles.push(crate::context::ADMIN_ROLE.to_string());
        assert!(p.write_allowed(&admin));
    }

    #[test]
    fn test_missing_perms2_is_open() {
        let p = perms2_of(None);
        assert!(p.read_allowed(&user("anyone")));
    }

    #[test]
    fn test_user_visible_default_true() {
        let mut props = std::collections::BTreeMap::new();
        assert!(is_user_visible(&props));
        props.insert("id_perms".to_string(), serde_json::json!({"user_visible": false}));
        assert!(!is_user_visible(&props));
    }
}
