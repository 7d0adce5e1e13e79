//! Resource lifecycle engine.
//!
//! Ties the coordination store, object store, and change bus into one
//! pipeline: typed schema validation, ID and address allocation with
//! undo, quota, permissions, the security-policy draft workspace, and
//! change notification.

pub mod allocators;
pub mod context;
pub mod draft;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod notify;
pub mod perms;
pub mod schema;
pub mod validation;

pub use allocators::Allocators;
pub use context::{Phase, RequestContext, UserContext, ADMIN_ROLE, SERVICE_ACCOUNT_USER};
pub use draft::security_policy_draft;
pub use engine::{ApiResponse, Engine, EngineConfig, ListParams};
pub use error::ApiError;
pub use hooks::ResourceHooks;
pub use notify::Notifier;
pub use perms::{Perms2, ShareEntry};
pub use schema::{TypeRegistry, DRAFT_POLICY_NAME, SECURITY_DRAFT_TYPES};
