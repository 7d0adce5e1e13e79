//! Header-based authentication.
//!
//! The server sits behind a gateway that validates tokens and forwards
//! the caller's identity in `X-User` / `X-Role` / `X-Project-*` /
//! `X-Domain-*` headers. This middleware turns those headers into a
//! [`UserContext`] and rejects anonymous requests unless the path is
//! exempt or the aaa-mode is `no-auth`.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use fabricd_engine::UserContext;

use crate::api::ApiServer;

/// Builds the caller identity from the forwarded headers.
pub fn user_from_headers(headers: &HeaderMap) -> UserContext {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let roles: Vec<String> = get("X-Role")
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();
    UserContext {
        user: get("X-User"),
        roles,
        project_id: get("X-Project-Id"),
        project_name: get("X-Project-Name"),
        domain_id: get("X-Domain-Id"),
        domain_name: get("X-Domain-Name"),
    }
}

pub async fn auth_middleware(
    State(state): State<Arc<ApiServer>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let user = user_from_headers(request.headers());

    let path = request.uri().path();
    let exempt = state
        .config()
        .no_auth_prefixes
        .iter()
        .any(|p| path.starts_with(p.as_str()));

    if !exempt && state.engine().aaa_mode() != "no-auth" && user.user.is_empty() {
        return (StatusCode::UNAUTHORIZED, "authentication required").into_response();
    }

    request.extensions_mut().insert(user);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_roles_are_comma_split() {
        let mut headers = HeaderMap::new();
        headers.insert("X-User", HeaderValue::from_static("alice"));
        headers.insert("X-Role", HeaderValue::from_static("admin, _member_"));
        headers.insert("X-Project-Id", HeaderValue::from_static("p-uuid"));

        let user = user_from_headers(&headers);
        assert_eq!(user.user, "alice");
        assert_eq!(user.roles, vec!["admin", "_member_"]);
        assert_eq!(user.project_id, "p-uuid");
        assert!(user.is_admin());
    }

    #[test]
    fn test_missing_headers_give_anonymous_user() {
        let user = user_from_headers(&HeaderMap::new());
        assert!(user.user.is_empty());
        assert!(user.roles.is_empty());
        assert!(!user.is_admin());
    }
}
