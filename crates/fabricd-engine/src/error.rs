//! API error taxonomy and status-code mapping.

use thiserror::Error;

use fabricd_alloc::AllocError;
use fabricd_bus::BusError;
use fabricd_coord::CoordError;
use fabricd_store::StoreError;

/// Request-level errors, one variant per HTTP outcome.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 400 — validation failure, unknown field, bad type, bad FQN.
    #[error("{0}")]
    MalformedRequest(String),

    /// 401 — missing credentials.
    #[error("{0}")]
    AuthRequired(String),

    /// 403 — insufficient credentials.
    #[error("{0}")]
    Forbidden(String),

    /// 404 — unknown UUID, FQN, or type.
    #[error("{0}")]
    NotFound(String),

    /// 409 — FQN already in use, or delete blocked by children or
    /// back-refs.
    #[error("{0}")]
    Conflict(String),

    /// 412 — ETag mismatch or quota exceeded.
    #[error("{0}")]
    PreconditionFailed(String),

    /// 503 — coordination store or bus unavailable.
    #[error("{0}")]
    ServiceUnavailable(String),

    /// 500 — unexpected failure; request-id is returned to the caller.
    #[error("{0}")]
    Internal(String),

    /// 202 — staged in the draft workspace, not yet applied. Carries
    /// the shadow UUID.
    #[error("accepted into draft workspace: {0}")]
    Accepted(String),
}

impl ApiError {
    /// The HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ApiError::MalformedRequest(_) => 400,
            ApiError::AuthRequired(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::PreconditionFailed(_) => 412,
            ApiError::ServiceUnavailable(_) => 503,
            ApiError::Internal(_) => 500,
            ApiError::Accepted(_) => 202,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ObjectNotFound(_) | StoreError::FqNameNotFound { .. } => {
                ApiError::NotFound(e.to_string())
            }
            StoreError::FqNameExists { .. } => ApiError::Conflict(e.to_string()),
            StoreError::PropEntryNotFound { .. } => ApiError::NotFound(e.to_string()),
            StoreError::BadColumn { .. } | StoreError::BadColumnName(_) => {
                ApiError::Internal(e.to_string())
            }
            StoreError::Backend(_) => ApiError::ServiceUnavailable(e.to_string()),
        }
    }
}

impl From<CoordError> for ApiError {
    fn from(e: CoordError) -> Self {
        match e {
            CoordError::NodeNotFound(_) => ApiError::NotFound(e.to_string()),
            CoordError::NodeExists(_) | CoordError::LockTimeout { .. } => {
                ApiError::Conflict(e.to_string())
            }
            CoordError::OverLimit { .. } => ApiError::PreconditionFailed(e.to_string()),
            CoordError::NoParent(_) | CoordError::NotEmpty(_) => {
                ApiError::MalformedRequest(e.to_string())
            }
            CoordError::SessionLost | CoordError::Backend(_) => {
                ApiError::ServiceUnavailable(e.to_string())
            }
        }
    }
}

impl From<AllocError> for ApiError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::QuotaExceeded { ref resource, limit } => ApiError::PreconditionFailed(
                format!("quota limit ({}) exceeded for resource {}", limit, resource),
            ),
            AllocError::Exhausted { .. } | AllocError::ResourceExists { .. } => {
                ApiError::Conflict(e.to_string())
            }
            AllocError::OutOfRange { .. }
            | AllocError::BadCidr(_)
            | AllocError::AddressOutOfSubnet { .. } => ApiError::MalformedRequest(e.to_string()),
            AllocError::Coord(inner) => inner.into(),
        }
    }
}

impl From<BusError> for ApiError {
    fn from(e: BusError) -> Self {
        ApiError::ServiceUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::MalformedRequest("x".into()).http_status(), 400);
        assert_eq!(ApiError::Conflict("x".into()).http_status(), 409);
        assert_eq!(ApiError::PreconditionFailed("x".into()).http_status(), 412);
        assert_eq!(ApiError::Accepted("u1".into()).http_status(), 202);
        assert_eq!(ApiError::ServiceUnavailable("x".into()).http_status(), 503);
    }

    #[test]
    fn test_quota_message_shape() {
        let e: ApiError = AllocError::QuotaExceeded {
            resource: "virtual_network".into(),
            limit: 2,
        }
        .into();
        assert_eq!(
            e.to_string(),
            "quota limit (2) exceeded for resource virtual_network"
        );
        assert_eq!(e.http_status(), 412);
    }

    #[test]
    fn test_store_error_mapping() {
        let e: ApiError = StoreError::ObjectNotFound("u1".into()).into();
        assert_eq!(e.http_status(), 404);
        let e: ApiError = StoreError::FqNameExists {
            type_name: "virtual-network".into(),
            fq_name: "d:p:vn".into(),
        }
        .into();
        assert_eq!(e.http_status(), 409);
        assert!(e.to_string().contains("already exists"));
    }

    #[test]
    fn test_coord_lock_timeout_is_conflict() {
        let e: ApiError = CoordError::LockTimeout {
            path: "/x".into(),
            holder: "other".into(),
            waited: std::time::Duration::from_secs(1),
        }
        .into();
        assert_eq!(e.http_status(), 409);
    }
}
