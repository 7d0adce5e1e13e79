//! The REST surface: resource CRUD plus action endpoints.
//!
//! Every handler is a thin shell: parse the wire dict, call the engine
//! with the caller's [`UserContext`], map [`ApiError`] to a status code
//! with a plain-text body. Static action routes take priority over the
//! `/:collection` and `/:type/:uuid` parameter routes.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use fabricd_engine::{
    security_policy_draft, ApiError, ApiResponse, Engine, ListParams, RequestContext, UserContext,
};
use fabricd_repair::DbChecker;
use fabricd_store::TableId;

use crate::auth;
use crate::config::ServerConfig;

/// The HTTP front end over one engine.
pub struct ApiServer {
    engine: Engine,
    config: Arc<ServerConfig>,
}

/// Error shell so handlers can use `?` on engine calls.
struct ServerError(ApiError);

impl From<ApiError> for ServerError {
    fn from(e: ApiError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.0.to_string()).into_response()
    }
}

type HandlerResult = Result<Response, ServerError>;

fn respond(r: ApiResponse) -> Response {
    let status = StatusCode::from_u16(r.status).unwrap_or(StatusCode::OK);
    if r.body.is_null() {
        status.into_response()
    } else {
        (status, Json(r.body)).into_response()
    }
}

fn request_ctx(user: &UserContext) -> RequestContext {
    RequestContext::new(user.clone(), &format!("req-{}", uuid::Uuid::new_v4()))
}

fn body_str<'a>(body: &'a Value, field: &str) -> Result<&'a str, ServerError> {
    body.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::MalformedRequest(format!("{} required", field)).into())
}

fn body_strings(body: &Value, field: &str) -> Vec<String> {
    body.get(field)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn body_flag(body: &Value, field: &str) -> bool {
    body.get(field).and_then(Value::as_bool).unwrap_or(false)
}

impl ApiServer {
    pub fn new(engine: Engine, config: Arc<ServerConfig>) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(link_index))
            .route("/fqname-to-id", post(fqname_to_id))
            .route("/id-to-fqname", post(id_to_fqname))
            .route("/ref-update", post(ref_update))
            .route("/ref-relax-for-delete", post(ref_relax_for_delete))
            .route(
                "/prop-collection-get",
                get(prop_collection_get_query).post(prop_collection_get),
            )
            .route("/prop-collection-update", post(prop_collection_update))
            .route("/list-bulk-collection", post(list_bulk_collection))
            .route("/obj-cache", get(obj_cache_get).post(obj_cache_evict))
            .route("/fetch-records", post(fetch_records))
            .route("/useragent-kv", post(useragent_kv))
            .route("/set-tag", post(set_tag))
            .route("/chown", post(chown))
            .route("/chmod", post(chmod))
            .route("/obj-perms", get(obj_perms))
            .route("/aaa-mode", get(aaa_mode_get).put(aaa_mode_put))
            .route("/security-policy-draft", post(draft_action))
            .route("/db-check", post(db_check))
            .route("/virtual-network/:uuid/ip-alloc", post(ip_alloc))
            .route("/virtual-network/:uuid/ip-free", post(ip_free))
            .route("/:collection", post(create_resource).get(list_resources))
            .route(
                "/:type_name/:uuid",
                get(read_resource).put(update_resource).delete(delete_resource),
            )
            .layer(middleware::from_fn_with_state(
                self.clone(),
                auth::auth_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.config.bind_addr;
        let router = Arc::new(self).router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("API server listening on {}", addr);

        axum::serve(listener, router.into_make_service()).await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Resource CRUD
// ----------------------------------------------------------------------

async fn link_index(State(state): State<Arc<ApiServer>>) -> Json<Value> {
    let registry = state.engine.registry();
    let links: Vec<Value> = registry
        .type_names()
        .into_iter()
        .filter_map(|name| registry.get(name).ok())
        .map(|rt| {
            json!({"link": {
                "href": format!("/{}", rt.plural),
                "name": rt.plural,
                "rel": "collection",
            }})
        })
        .collect();
    Json(json!({"href": "/", "links": links}))
}

async fn create_resource(
    State(state): State<Arc<ApiServer>>,
    Path(collection): Path<String>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let rt = state.engine.registry().resolve_plural(&collection)?;
    let inner = body.get(rt.name).ok_or_else(|| {
        ApiError::MalformedRequest(format!("body must carry a {} object", rt.name))
    })?;
    let mut ctx = request_ctx(&user);
    Ok(respond(state.engine.create(&mut ctx, rt.name, inner)?))
}

async fn read_resource(
    State(state): State<Arc<ApiServer>>,
    Path((type_name, uuid)): Path<(String, String)>,
    Extension(user): Extension<UserContext>,
    headers: HeaderMap,
) -> HandlerResult {
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    let ctx = request_ctx(&user);
    Ok(respond(state.engine.read(&ctx, &type_name, &uuid, if_none_match)?))
}

async fn update_resource(
    State(state): State<Arc<ApiServer>>,
    Path((type_name, uuid)): Path<(String, String)>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let inner = body.get(&type_name).unwrap_or(&body);
    let mut ctx = request_ctx(&user);
    Ok(respond(state.engine.update(&mut ctx, &type_name, &uuid, inner)?))
}

async fn delete_resource(
    State(state): State<Arc<ApiServer>>,
    Path((type_name, uuid)): Path<(String, String)>,
    Extension(user): Extension<UserContext>,
) -> HandlerResult {
    let mut ctx = request_ctx(&user);
    Ok(respond(state.engine.delete(&mut ctx, &type_name, &uuid)?))
}

fn comma_list(q: &HashMap<String, String>, key: &str) -> Vec<String> {
    q.get(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn flag(q: &HashMap<String, String>, key: &str) -> bool {
    q.get(key).map(|v| v == "true" || v == "1").unwrap_or(false)
}

fn list_params(q: &HashMap<String, String>) -> ListParams {
    let mut filters = std::collections::BTreeMap::new();
    if let Some(raw) = q.get("filters") {
        // `name==value` pairs; values parse as JSON where they can.
        for pair in raw.split(',') {
            if let Some((name, value)) = pair.split_once("==") {
                let parsed = serde_json::from_str(value)
                    .unwrap_or_else(|_| Value::String(value.to_string()));
                filters.insert(name.to_string(), parsed);
            }
        }
    }
    ListParams {
        parent_uuids: comma_list(q, "parent_id"),
        parent_fq_name_str: q.get("parent_fq_name_str").cloned(),
        parent_type: q.get("parent_type").cloned(),
        back_ref_uuids: comma_list(q, "back_ref_id"),
        obj_uuids: comma_list(q, "obj_uuids"),
        fq_name_prefixes: comma_list(q, "fq_name_prefix"),
        fq_names: comma_list(q, "fq_names"),
        fields: comma_list(q, "fields"),
        filters,
        tags: comma_list(q, "tag"),
        detail: flag(q, "detail"),
        count: flag(q, "count"),
        shared: flag(q, "shared"),
        exclude_hrefs: flag(q, "exclude_hrefs"),
        page_marker: q.get("page_marker").cloned(),
        page_limit: q.get("page_limit").and_then(|v| v.parse().ok()),
    }
}

async fn list_resources(
    State(state): State<Arc<ApiServer>>,
    Path(collection): Path<String>,
    Extension(user): Extension<UserContext>,
    Query(q): Query<HashMap<String, String>>,
) -> HandlerResult {
    let rt = state.engine.registry().resolve_plural(&collection)?;
    let ctx = request_ctx(&user);
    Ok(respond(state.engine.list(&ctx, rt.name, &list_params(&q))?))
}

// ----------------------------------------------------------------------
// Action endpoints
// ----------------------------------------------------------------------

async fn fqname_to_id(
    State(state): State<Arc<ApiServer>>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let type_name = body_str(&body, "type")?;
    let fq_name: Vec<String> = body
        .get("fq_name")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| ApiError::MalformedRequest("fq_name required".to_string()))?;
    Ok(respond(state.engine.fq_name_to_id(type_name, &fq_name)?))
}

async fn id_to_fqname(
    State(state): State<Arc<ApiServer>>,
    Json(body): Json<Value>,
) -> HandlerResult {
    Ok(respond(state.engine.id_to_fq_name(body_str(&body, "uuid")?)?))
}

async fn ref_update(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let ref_fq_name: Option<Vec<String>> = body.get("ref-fq-name").and_then(Value::as_array).map(|a| {
        a.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    });
    let ctx = request_ctx(&user);
    Ok(respond(state.engine.ref_update(
        &ctx,
        body_str(&body, "type")?,
        body_str(&body, "uuid")?,
        body_str(&body, "ref-type")?,
        body.get("ref-uuid").and_then(Value::as_str),
        ref_fq_name.as_deref(),
        body_str(&body, "operation")?,
        body.get("attr").unwrap_or(&Value::Null),
    )?))
}

async fn ref_relax_for_delete(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let ctx = request_ctx(&user);
    Ok(respond(state.engine.ref_relax_for_delete(
        &ctx,
        body_str(&body, "uuid")?,
        body_str(&body, "ref-uuid")?,
    )?))
}

async fn prop_collection_get(
    State(state): State<Arc<ApiServer>>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let fields = body_strings(&body, "fields");
    Ok(respond(
        state
            .engine
            .prop_collection_get(body_str(&body, "uuid")?, &fields)?,
    ))
}

async fn prop_collection_get_query(
    State(state): State<Arc<ApiServer>>,
    Query(q): Query<HashMap<String, String>>,
) -> HandlerResult {
    let uuid = q
        .get("uuid")
        .ok_or_else(|| ApiError::MalformedRequest("uuid required".to_string()))?;
    let fields = comma_list(&q, "fields");
    Ok(respond(state.engine.prop_collection_get(uuid, &fields)?))
}

async fn prop_collection_update(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let updates = body
        .get("updates")
        .ok_or_else(|| ApiError::MalformedRequest("updates required".to_string()))?;
    let ctx = request_ctx(&user);
    Ok(respond(state.engine.prop_collection_update(
        &ctx,
        body_str(&body, "uuid")?,
        updates,
    )?))
}

async fn useragent_kv(
    State(state): State<Arc<ApiServer>>,
    Json(body): Json<Value>,
) -> HandlerResult {
    Ok(respond(state.engine.useragent_kv(
        body_str(&body, "operation")?,
        body_str(&body, "key")?,
        body.get("value").and_then(Value::as_str),
    )?))
}

async fn set_tag(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let tags = body
        .get("tags")
        .and_then(Value::as_object)
        .ok_or_else(|| ApiError::MalformedRequest("tags object required".to_string()))?;
    let ctx = request_ctx(&user);
    Ok(respond(state.engine.set_tag(
        &ctx,
        body_str(&body, "type")?,
        body_str(&body, "uuid")?,
        tags,
    )?))
}

async fn chown(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let ctx = request_ctx(&user);
    Ok(respond(state.engine.chown(
        &ctx,
        body_str(&body, "uuid")?,
        body_str(&body, "owner")?,
    )?))
}

async fn chmod(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let ctx = request_ctx(&user);
    Ok(respond(state.engine.chmod(&ctx, body_str(&body, "uuid")?, &body)?))
}

async fn obj_perms(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
    Query(q): Query<HashMap<String, String>>,
) -> HandlerResult {
    let uuid = q
        .get("uuid")
        .ok_or_else(|| ApiError::MalformedRequest("uuid required".to_string()))?;
    let ctx = request_ctx(&user);
    Ok(respond(state.engine.obj_perms(&ctx, uuid)?))
}

async fn aaa_mode_get(State(state): State<Arc<ApiServer>>) -> Json<Value> {
    Json(json!({"aaa-mode": state.engine.aaa_mode()}))
}

async fn aaa_mode_put(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let ctx = request_ctx(&user);
    Ok(respond(
        state.engine.set_aaa_mode(&ctx, body_str(&body, "aaa-mode")?)?,
    ))
}

async fn draft_action(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let ctx = request_ctx(&user);
    Ok(respond(security_policy_draft(
        &state.engine,
        &ctx,
        body_str(&body, "scope_uuid")?,
        body_str(&body, "action")?,
    )?))
}

async fn ip_alloc(
    State(state): State<Arc<ApiServer>>,
    Path(uuid): Path<String>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let count = body.get("count").and_then(Value::as_u64).unwrap_or(1) as usize;
    Ok(respond(
        state.engine.ip_alloc(&uuid, body_str(&body, "subnet")?, count)?,
    ))
}

async fn ip_free(
    State(state): State<Arc<ApiServer>>,
    Path(uuid): Path<String>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let addrs: Vec<String> = body
        .get("ip_addr")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(respond(
        state.engine.ip_free(&uuid, body_str(&body, "subnet")?, &addrs)?,
    ))
}

async fn db_check(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
) -> HandlerResult {
    if !user.is_admin() {
        return Err(ApiError::Forbidden("db-check requires admin".to_string()).into());
    }
    let checker = DbChecker::new(
        state.engine.coord().clone(),
        state.engine.store().table().clone(),
    );
    let report = checker
        .check_all()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(respond(ApiResponse::ok(json!({
        "clean": report.is_clean(),
        "errors": report.errors,
        "warnings": report.warnings,
        "findings": report
            .findings
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>(),
    }))))
}

/// `POST /list-bulk-collection`: list with the selectors in the body,
/// for callers whose UUID sets outgrow a query string.
async fn list_bulk_collection(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    let type_name = body_str(&body, "type")?;
    let rt = state.engine.registry().get(type_name)?;
    let params = ListParams {
        parent_uuids: body_strings(&body, "parent_id"),
        back_ref_uuids: body_strings(&body, "back_ref_id"),
        obj_uuids: body_strings(&body, "obj_uuids"),
        fq_names: body_strings(&body, "fq_names"),
        fields: body_strings(&body, "fields"),
        detail: body_flag(&body, "detail"),
        count: body_flag(&body, "count"),
        shared: body_flag(&body, "shared"),
        exclude_hrefs: body_flag(&body, "exclude_hrefs"),
        ..Default::default()
    };
    let ctx = request_ctx(&user);
    Ok(respond(state.engine.list(&ctx, rt.name, &params)?))
}

/// `GET /obj-cache`: object-cache inventory, admin only.
async fn obj_cache_get(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
) -> HandlerResult {
    if !user.is_admin() {
        return Err(ApiError::Forbidden("obj-cache requires admin".to_string()).into());
    }
    let cache = state.engine.store().cache();
    Ok(respond(ApiResponse::ok(json!({
        "entries": cache.len(),
        "uuids": cache.cached_uuids(),
    }))))
}

/// `POST /obj-cache`: evicts the given UUIDs, admin only.
async fn obj_cache_evict(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    if !user.is_admin() {
        return Err(ApiError::Forbidden("obj-cache requires admin".to_string()).into());
    }
    let uuids = body_strings(&body, "uuids");
    for uuid in &uuids {
        state.engine.store().evict(uuid);
    }
    Ok(respond(ApiResponse::ok(json!({"evicted": uuids.len()}))))
}

/// `POST /fetch-records`: raw rows straight off the object table,
/// below the cache and the schema; admin only.
async fn fetch_records(
    State(state): State<Arc<ApiServer>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<Value>,
) -> HandlerResult {
    if !user.is_admin() {
        return Err(ApiError::Forbidden("fetch-records requires admin".to_string()).into());
    }
    let uuids = body_strings(&body, "uuids");
    if uuids.is_empty() {
        return Err(ApiError::MalformedRequest("uuids required".to_string()).into());
    }
    let table = state.engine.store().table();
    let mut records = Vec::new();
    for uuid in &uuids {
        let row = table
            .get_row(TableId::ObjUuid, uuid)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let Some(columns) = row else {
            continue;
        };
        records.push(json!({"uuid": uuid, "columns": columns}));
    }
    Ok(respond(ApiResponse::ok(json!({"records": records}))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use fabricd_bus::MemoryBus;
    use fabricd_coord::MemoryCoordStore;
    use fabricd_store::{CacheConfig, MemoryObjectTable};

    fn server() -> Arc<ApiServer> {
        let engine = Engine::new(
            Arc::new(MemoryCoordStore::new()),
            Arc::new(MemoryObjectTable::new()),
            Arc::new(MemoryBus::new()),
            ServerConfig::default().engine_config(),
            CacheConfig::default(),
        )
        .unwrap();
        Arc::new(ApiServer::new(engine, Arc::new(ServerConfig::default())))
    }

    fn admin_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("X-User", "admin")
            .header("X-Role", "admin")
            .header("X-Project-Id", "admin-project")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn seed_project(router: &Router) -> String {
        let response = router
            .clone()
            .oneshot(admin_request(
                "POST",
                "/domains",
                json!({"domain": {"fq_name": ["default-domain"]}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(admin_request(
                "POST",
                "/projects",
                json!({"project": {
                    "fq_name": ["default-domain", "p"],
                    "parent_type": "domain",
                }}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        json_body(response).await["project"]["uuid"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_anonymous_request_rejected() {
        let router = server().router();
        let request = Request::builder()
            .uri("/virtual-networks")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_link_index_lists_collections() {
        let router = server().router();
        let response = router
            .oneshot(admin_request("GET", "/", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let links = body["links"].as_array().unwrap();
        assert!(links.iter().any(|l| l["link"]["name"] == "virtual-networks"));
        assert!(links.iter().any(|l| l["link"]["name"] == "projects"));
    }

    #[tokio::test]
    async fn test_create_read_list_delete_cycle() {
        let srv = server();
        let router = srv.clone().router();
        let project = seed_project(&router).await;

        let response = router
            .clone()
            .oneshot(admin_request(
                "POST",
                "/virtual-networks",
                json!({"virtual-network": {
                    "fq_name": ["default-domain", "p", "vn1"],
                    "parent_type": "project",
                    "parent_uuid": project,
                }}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let vn_uuid = json_body(response).await["virtual-network"]["uuid"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .clone()
            .oneshot(admin_request(
                "GET",
                &format!("/virtual-network/{}", vn_uuid),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["virtual-network"]["fq_name"][2], "vn1");

        let response = router
            .clone()
            .oneshot(admin_request("GET", "/virtual-networks?count=true", json!({})))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["virtual-networks"]["count"], 1);

        let response = router
            .clone()
            .oneshot(admin_request(
                "DELETE",
                &format!("/virtual-network/{}", vn_uuid),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(admin_request(
                "GET",
                &format!("/virtual-network/{}", vn_uuid),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fqname_to_id_and_back() {
        let srv = server();
        let router = srv.clone().router();
        let project = seed_project(&router).await;

        let response = router
            .clone()
            .oneshot(admin_request(
                "POST",
                "/fqname-to-id",
                json!({"type": "project", "fq_name": ["default-domain", "p"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["uuid"], project);

        let response = router
            .oneshot(admin_request(
                "POST",
                "/id-to-fqname",
                json!({"uuid": project}),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["type"], "project");
        assert_eq!(body["fq_name"][1], "p");
    }

    #[tokio::test]
    async fn test_unknown_collection_is_404() {
        let router = server().router();
        let response = router
            .oneshot(admin_request("GET", "/flux-capacitors", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_conflict_maps_to_409() {
        let srv = server();
        let router = srv.clone().router();
        seed_project(&router).await;

        let response = router
            .oneshot(admin_request(
                "POST",
                "/domains",
                json!({"domain": {"fq_name": ["default-domain"]}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_aaa_mode_change_requires_admin() {
        let srv = server();
        let router = srv.clone().router();

        let request = Request::builder()
            .method("PUT")
            .uri("/aaa-mode")
            .header("X-User", "bob")
            .header("X-Role", "_member_")
            .header("content-type", "application/json")
            .body(Body::from(json!({"aaa-mode": "rbac"}).to_string()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = router
            .clone()
            .oneshot(admin_request("PUT", "/aaa-mode", json!({"aaa-mode": "rbac"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(admin_request("GET", "/aaa-mode", json!({})))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["aaa-mode"], "rbac");
    }

    #[tokio::test]
    async fn test_useragent_kv_store_retrieve() {
        let router = server().router();

        let response = router
            .clone()
            .oneshot(admin_request(
                "POST",
                "/useragent-kv",
                json!({"operation": "STORE", "key": "k1", "value": "v1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(admin_request(
                "POST",
                "/useragent-kv",
                json!({"operation": "RETRIEVE", "key": "k1"}),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["value"], "v1");
    }

    #[tokio::test]
    async fn test_db_check_on_consistent_store() {
        let srv = server();
        let router = srv.clone().router();
        seed_project(&router).await;

        let response = router
            .clone()
            .oneshot(admin_request("POST", "/db-check", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["clean"], true);
        assert_eq!(body["errors"], 0);

        // Not an admin action for everyone.
        let request = Request::builder()
            .method("POST")
            .uri("/db-check")
            .header("X-User", "bob")
            .header("X-Role", "_member_")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    async fn seed_vn(router: &Router, project: &str, name: &str) -> String {
        let response = router
            .clone()
            .oneshot(admin_request(
                "POST",
                "/virtual-networks",
                json!({"virtual-network": {
                    "fq_name": ["default-domain", "p", name],
                    "parent_type": "project",
                    "parent_uuid": project,
                }}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        json_body(response).await["virtual-network"]["uuid"]
            .as_str()
            .unwrap()
            .to_string()
    }

    fn member_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("X-User", "bob")
            .header("X-Role", "_member_")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_query_selectors() {
        let srv = server();
        let router = srv.clone().router();
        let project = seed_project(&router).await;
        seed_vn(&router, &project, "vn1").await;
        seed_vn(&router, &project, "vn2").await;

        let response = router
            .clone()
            .oneshot(admin_request(
                "GET",
                "/virtual-networks?fq_names=default-domain:p:vn2&fields=virtual_network_network_id",
                json!({}),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        let entries = body["virtual-networks"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["fq_name"][2], "vn2");
        assert_eq!(entries[0]["virtual_network_network_id"], 2);
        assert!(entries[0]["href"].as_str().unwrap().starts_with("/virtual-network/"));

        let response = router
            .oneshot(admin_request(
                "GET",
                "/virtual-networks?exclude_hrefs=true",
                json!({}),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert!(body["virtual-networks"][0].get("href").is_none());
    }

    #[tokio::test]
    async fn test_list_bulk_collection() {
        let srv = server();
        let router = srv.clone().router();
        let project = seed_project(&router).await;
        let vn1 = seed_vn(&router, &project, "vn1").await;
        let vn2 = seed_vn(&router, &project, "vn2").await;
        seed_vn(&router, &project, "vn3").await;

        let response = router
            .oneshot(admin_request(
                "POST",
                "/list-bulk-collection",
                json!({
                    "type": "virtual-network",
                    "obj_uuids": [vn1, vn2],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["virtual-networks"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_obj_cache_inspect_and_evict() {
        let srv = server();
        let router = srv.clone().router();
        let project = seed_project(&router).await;
        let vn = seed_vn(&router, &project, "vn1").await;

        // A read warms the cache.
        router
            .clone()
            .oneshot(admin_request(
                "GET",
                &format!("/virtual-network/{}", vn),
                json!({}),
            ))
            .await
            .unwrap();
        let response = router
            .clone()
            .oneshot(admin_request("GET", "/obj-cache", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert!(body["uuids"].as_array().unwrap().contains(&json!(vn)));

        let response = router
            .clone()
            .oneshot(admin_request("POST", "/obj-cache", json!({"uuids": [vn]})))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["evicted"], 1);
        let response = router
            .clone()
            .oneshot(admin_request("GET", "/obj-cache", json!({})))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert!(!body["uuids"].as_array().unwrap().contains(&json!(vn)));

        let response = router
            .oneshot(member_request("GET", "/obj-cache", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_fetch_records_dumps_raw_columns() {
        let srv = server();
        let router = srv.clone().router();
        let project = seed_project(&router).await;
        let vn = seed_vn(&router, &project, "vn1").await;

        let response = router
            .clone()
            .oneshot(admin_request("POST", "/fetch-records", json!({"uuids": [vn]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let records = body["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["uuid"], json!(vn));
        assert!(records[0]["columns"]["type"]
            .as_str()
            .unwrap()
            .contains("virtual-network"));

        let response = router
            .oneshot(member_request("POST", "/fetch-records", json!({"uuids": [vn]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_prop_collection_get_via_query() {
        let srv = server();
        let router = srv.clone().router();
        let project = seed_project(&router).await;
        let response = router
            .clone()
            .oneshot(admin_request(
                "POST",
                "/virtual-machine-interfaces",
                json!({"virtual-machine-interface": {
                    "fq_name": ["default-domain", "p", "vmi1"],
                    "parent_type": "project",
                    "parent_uuid": project,
                    "virtual_machine_interface_bindings": {"vif_type": "vrouter"},
                }}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let vmi = json_body(response).await["virtual-machine-interface"]["uuid"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .oneshot(admin_request(
                "GET",
                &format!(
                    "/prop-collection-get?uuid={}&fields=virtual_machine_interface_bindings",
                    vmi
                ),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(
            body["virtual_machine_interface_bindings"]["vif_type"],
            "vrouter"
        );
    }

    #[tokio::test]
    async fn test_ref_update_over_http() {
        let srv = server();
        let router = srv.clone().router();
        let project = seed_project(&router).await;

        let mk_vn = |name: &str| {
            admin_request(
                "POST",
                "/virtual-networks",
                json!({"virtual-network": {
                    "fq_name": ["default-domain", "p", name],
                    "parent_type": "project",
                    "parent_uuid": project,
                }}),
            )
        };
        let vn = json_body(router.clone().oneshot(mk_vn("vn1")).await.unwrap()).await
            ["virtual-network"]["uuid"]
            .as_str()
            .unwrap()
            .to_string();
        let response = router
            .clone()
            .oneshot(admin_request(
                "POST",
                "/network-ipams",
                json!({"network-ipam": {
                    "fq_name": ["default-domain", "p", "ipam1"],
                    "parent_type": "project",
                    "parent_uuid": project,
                }}),
            ))
            .await
            .unwrap();
        let ipam = json_body(response).await["network-ipam"]["uuid"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .oneshot(admin_request(
                "POST",
                "/ref-update",
                json!({
                    "type": "virtual-network",
                    "uuid": vn,
                    "ref-type": "network-ipam",
                    "ref-uuid": ipam,
                    "operation": "ADD",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
