//! Consistency checker, healer, and cleaner for the fabricd stores.
//!
//! The object store and the coordination store can drift apart after a
//! partial write or an operator mistake. This crate audits both and
//! repairs the drift under one rule: the coordination store is
//! authoritative for allocations, the object store for content. The
//! [`DbChecker`] reports without touching anything, the [`DbHealer`]
//! only adds missing derived state, and the [`DbCleaner`] only removes
//! stale state. All three are idempotent.

pub mod checker;
pub mod cleaner;
pub mod error;
pub mod healer;
pub mod report;
pub mod scan;

pub use checker::{CheckConfig, DbChecker};
pub use cleaner::DbCleaner;
pub use error::RepairError;
pub use healer::DbHealer;
pub use report::{Finding, RepairIssue, RepairReport, Severity};
