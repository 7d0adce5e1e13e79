//! Per-request context: caller identity, pipeline phase, undo stack.

use std::fmt;

/// Identity of the reserved service account used by internal requests.
pub const SERVICE_ACCOUNT_USER: &str = "fabricd-service";

/// Role granting unrestricted access.
pub const ADMIN_ROLE: &str = "admin";

/// Caller identity extracted from the auth headers.
#[derive(Clone, Debug, Default)]
pub struct UserContext {
    /// User name (`X-User`).
    pub user: String,
    /// Roles (`X-Role`, comma-separated on the wire).
    pub roles: Vec<String>,
    /// Project UUID (`X-Project-Id`).
    pub project_id: String,
    /// Project name (`X-Project-Name`).
    pub project_name: String,
    /// Domain UUID (`X-Domain-Id`).
    pub domain_id: String,
    /// Domain name (`X-Domain-Name`).
    pub domain_name: String,
}

impl UserContext {
    /// The reserved service-account identity used for internal
    /// requests spawned by hooks.
    pub fn service_account() -> Self {
        Self {
            user: SERVICE_ACCOUNT_USER.to_string(),
            roles: vec![ADMIN_ROLE.to_string()],
            ..Default::default()
        }
    }

    /// True if the caller holds the admin role.
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ADMIN_ROLE)
    }
}

/// Pipeline phases, nameable for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Request accepted, nothing done yet.
    Init,
    /// Validation before any allocation.
    PreDbeAlloc,
    /// FQN lock and UUID allocation.
    DbeAlloc,
    /// Per-type pre-create hook and quota charge.
    PreDbeCreate,
    /// Object-store persist.
    DbeCreate,
    /// Post-create hook and publish.
    PostDbeCreate,
    /// Update accepted, target resolved.
    PendingDbeUpdate,
    /// Validation and pre-update hook.
    PreDbeUpdate,
    /// Object-store rewrite.
    DbeUpdate,
    /// Post-update hook and publish.
    PostDbeUpdate,
    /// Delete accepted, preconditions checked.
    PendingDbeDelete,
    /// Pre-delete hook and default-children cleanup.
    PreDbeDelete,
    /// Object-store row removal.
    DbeDelete,
    /// Post-delete hook, quota release, publish.
    PostDbeDelete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::PreDbeAlloc => "PRE_DBE_ALLOC",
            Phase::DbeAlloc => "DBE_ALLOC",
            Phase::PreDbeCreate => "PRE_DBE_CREATE",
            Phase::DbeCreate => "DBE_CREATE",
            Phase::PostDbeCreate => "POST_DBE_CREATE",
            Phase::PendingDbeUpdate => "PENDING_DBE_UPDATE",
            Phase::PreDbeUpdate => "PRE_DBE_UPDATE",
            Phase::DbeUpdate => "DBE_UPDATE",
            Phase::PostDbeUpdate => "POST_DBE_UPDATE",
            Phase::PendingDbeDelete => "PENDING_DBE_DELETE",
            Phase::PreDbeDelete => "PRE_DBE_DELETE",
            Phase::DbeDelete => "DBE_DELETE",
            Phase::PostDbeDelete => "POST_DBE_DELETE",
        };
        f.write_str(name)
    }
}

type Undo = Box<dyn FnOnce() + Send>;

/// Mutable state carried through one pipeline run.
///
/// Internal requests spawned from hooks get their own context; the
/// outer context (and its undo stack) is untouched while the inner one
/// runs.
pub struct RequestContext {
    /// Caller identity.
    pub user: UserContext,
    /// Correlates log lines, bus messages, and error bodies.
    pub request_id: String,
    /// True for engine-initiated (hook-spawned) requests.
    pub is_internal: bool,
    phase: Phase,
    undo_stack: Vec<(String, Undo)>,
    phase_log: Vec<(Phase, chrono::DateTime<chrono::Utc>)>,
}

impl RequestContext {
    /// Context for an external request.
    pub fn new(user: UserContext, request_id: &str) -> Self {
        Self {
            user,
            request_id: request_id.to_string(),
            is_internal: false,
            phase: Phase::Init,
            undo_stack: Vec::new(),
            phase_log: Vec::new(),
        }
    }

    /// Context for an internal request carrying the service account.
    pub fn internal(request_id: &str) -> Self {
        let mut ctx = Self::new(UserContext::service_account(), request_id);
        ctx.is_internal = true;
        ctx
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Enters a phase, stamping it for diagnostics.
    pub fn enter_phase(&mut self, phase: Phase) {
        tracing::debug!(request_id = %self.request_id, "phase {}", phase);
        self.phase = phase;
        self.phase_log.push((phase, chrono::Utc::now()));
    }

    /// Phases entered so far, in order.
    pub fn phase_log(&self) -> &[(Phase, chrono::DateTime<chrono::Utc>)] {
        &self.phase_log
    }

    /// Pushes a compensation action to run if a later phase fails.
    pub fn push_undo(&mut self, what: &str, undo: impl FnOnce() + Send + 'static) {
        self.undo_stack.push((what.to_string(), Box::new(undo)));
    }

    /// Number of pending undo actions.
    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    /// Runs all pushed undo actions in reverse order. Undo failures
    /// are the actions' own to log; this never propagates them.
    pub fn run_undos(&mut self) {
        while let Some((what, undo)) = self.undo_stack.pop() {
            tracing::warn!(request_id = %self.request_id, "undo: {}", what);
            undo();
        }
    }

    /// Drops the undo stack after a fully successful run.
    pub fn commit(&mut self) {
        self.undo_stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_undo_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut ctx = RequestContext::new(UserContext::default(), "req-1");
        for i in 0..3 {
            let order = order.clone();
            ctx.push_undo(&format!("step-{}", i), move || {
                order.lock().unwrap().push(i);
            });
        }
        ctx.run_undos();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert_eq!(ctx.undo_depth(), 0);
    }

    #[test]
    fn test_commit_discards_undos() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut ctx = RequestContext::new(UserContext::default(), "req-1");
        let f = fired.clone();
        ctx.push_undo("x", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        ctx.commit();
        ctx.run_undos();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::PreDbeAlloc.to_string(), "PRE_DBE_ALLOC");
        assert_eq!(Phase::PendingDbeDelete.to_string(), "PENDING_DBE_DELETE");
    }

    #[test]
    fn test_service_account_is_admin() {
        assert!(UserContext::service_account().is_admin());
        assert!(!UserContext::default().is_admin());
    }
}
