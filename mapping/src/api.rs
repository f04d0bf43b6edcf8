use crate::access::verify_client_hash;
use crate::config::Listener as ListenerConfig;
use crate::configs::{ConfigPatch, NewConfig};
use crate::errors::{CoreError, ErrorCode};
use crate::master::{ConfigRefs, MappingPage};
use crate::projects::NewProject;
use crate::resolver::Resolution;
use crate::service::MappingService;
use crate::types::{
    Caller, ConfigBundle, ConfigKind, FilterCombination, FilterDimension, FilterRequest,
    MasterEntry, Project, Role,
};
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::SystemTime;
use tokio::net::TcpListener;

/// Identity header set by the session gateway.
pub const CALLER_HEADER: &str = "x-caller-email";
pub const CLIENT_HASH_HEADER: &str = "x-client-hash";

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub fn router(service: MappingService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/projects", post(create_project))
        .route("/projects/{id}", get(get_project).delete(deactivate_project))
        .route("/projects/{id}/members", post(add_member))
        .route("/projects/{id}/config-types", post(add_config_type))
        .route("/projects/{id}/config-types/{name}", delete(remove_config_type))
        .route("/projects/{id}/filters", get(list_filters).post(add_filter))
        .route("/projects/{id}/filters/expand", post(expand))
        .route("/projects/{id}/filters/{name}", put(update_filter).delete(remove_filter))
        .route("/projects/{id}/configs", get(list_configs))
        .route("/configs", post(create_config))
        .route(
            "/configs/{id}",
            get(get_config).patch(update_config).delete(deactivate_config),
        )
        .route("/configs/{id}/clone", post(clone_config))
        .route("/projects/{id}/mappings", get(list_mappings).post(create_mapping))
        .route("/projects/{id}/mappings/delete", post(delete_mapping))
        .route("/projects/{id}/mappings/active", post(get_active_mapping))
        .route("/projects/{id}/mappings/prune", post(prune_mappings))
        .route("/resolve", post(resolve))
        .with_state(service)
}

pub async fn serve<F>(
    listener: &ListenerConfig,
    service: MappingService,
    shutdown: F,
) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", listener.host, listener.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Listening");

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .map(Caller::new)
            .ok_or_else(|| CoreError::Unauthorized(format!("missing {CALLER_HEADER} header")))
    }
}

#[derive(Serialize)]
struct ApiErrorResponse {
    code: ErrorCode,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<Vec<FilterCombination>>,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match self.code() {
            ErrorCode::Validation => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::PartialWrite | ErrorCode::Inconsistency | ErrorCode::Transport => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let message = self.to_string();
        let code = self.code();
        let remaining = match self {
            CoreError::PartialFanOut { remaining, .. } => Some(remaining),
            _ => None,
        };

        let body = Json(ApiErrorResponse {
            code,
            message,
            remaining,
        });

        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, CoreError>;

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(service): State<MappingService>) -> StatusCode {
    if service.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn create_project(
    State(service): State<MappingService>,
    caller: Caller,
    Json(new): Json<NewProject>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let project = service
        .projects()
        .create_project(&service.deadline(), &caller, new)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Project>> {
    let project = service
        .projects()
        .get_project(&service.deadline(), &caller, &project_id)
        .await?;
    Ok(Json(project))
}

async fn deactivate_project(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Project>> {
    let project = service
        .projects()
        .deactivate_project(&service.deadline(), &caller, &project_id)
        .await?;
    Ok(Json(project))
}

#[derive(Deserialize)]
struct MemberBody {
    email: String,
    role: Role,
}

async fn add_member(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
    Json(body): Json<MemberBody>,
) -> ApiResult<Json<Project>> {
    let project = service
        .projects()
        .add_member(&service.deadline(), &caller, &project_id, &body.email, body.role)
        .await?;
    Ok(Json(project))
}

#[derive(Deserialize)]
struct ConfigTypeBody {
    name: String,
    #[serde(default)]
    desc: String,
}

async fn add_config_type(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
    Json(body): Json<ConfigTypeBody>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let project = service
        .projects()
        .add_config_type(&service.deadline(), &caller, &project_id, &body.name, &body.desc)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn remove_config_type(
    State(service): State<MappingService>,
    caller: Caller,
    Path((project_id, name)): Path<(String, String)>,
) -> ApiResult<Json<Project>> {
    let project = service
        .projects()
        .remove_config_type(&service.deadline(), &caller, &project_id, &name)
        .await?;
    Ok(Json(project))
}

async fn list_filters(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Vec<FilterDimension>>> {
    let catalog = service
        .catalog()
        .list_dimensions(&service.deadline(), &caller, &project_id)
        .await?;
    Ok(Json(catalog.dimensions().to_vec()))
}

async fn add_filter(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
    Json(dimension): Json<FilterDimension>,
) -> ApiResult<(StatusCode, Json<FilterDimension>)> {
    let dimension = service
        .catalog()
        .add_dimension(&service.deadline(), &caller, &project_id, dimension)
        .await?;
    Ok((StatusCode::CREATED, Json(dimension)))
}

async fn update_filter(
    State(service): State<MappingService>,
    caller: Caller,
    Path((project_id, name)): Path<(String, String)>,
    Json(mut dimension): Json<FilterDimension>,
) -> ApiResult<Json<FilterDimension>> {
    // The path names the dimension.
    dimension.name = name;
    let dimension = service
        .catalog()
        .update_dimension(&service.deadline(), &caller, &project_id, dimension)
        .await?;
    Ok(Json(dimension))
}

async fn remove_filter(
    State(service): State<MappingService>,
    caller: Caller,
    Path((project_id, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    service
        .catalog()
        .remove_dimension(&service.deadline(), &caller, &project_id, &name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn expand(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
    Json(request): Json<FilterRequest>,
) -> ApiResult<Json<Vec<FilterCombination>>> {
    let expanded = service
        .expand_filter(&service.deadline(), &caller, &project_id, &request)
        .await?;
    Ok(Json(expanded))
}

#[derive(Deserialize)]
struct ConfigListParams {
    kind: Option<ConfigKind>,
    #[serde(default)]
    include_inactive: bool,
}

async fn list_configs(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
    Query(params): Query<ConfigListParams>,
) -> ApiResult<Json<Vec<ConfigBundle>>> {
    let bundles = service
        .configs()
        .list(
            &service.deadline(),
            &caller,
            &project_id,
            params.kind,
            params.include_inactive,
        )
        .await?;
    Ok(Json(bundles))
}

async fn create_config(
    State(service): State<MappingService>,
    caller: Caller,
    Json(new): Json<NewConfig>,
) -> ApiResult<(StatusCode, Json<ConfigBundle>)> {
    let bundle = service
        .configs()
        .create(&service.deadline(), &caller, new)
        .await?;
    Ok((StatusCode::CREATED, Json(bundle)))
}

async fn get_config(
    State(service): State<MappingService>,
    caller: Caller,
    Path(config_id): Path<String>,
) -> ApiResult<Json<ConfigBundle>> {
    let bundle = service
        .configs()
        .get(&service.deadline(), &caller, &config_id)
        .await?;
    Ok(Json(bundle))
}

async fn update_config(
    State(service): State<MappingService>,
    caller: Caller,
    Path(config_id): Path<String>,
    Json(patch): Json<ConfigPatch>,
) -> ApiResult<Json<ConfigBundle>> {
    let bundle = service
        .configs()
        .update(&service.deadline(), &caller, &config_id, patch)
        .await?;
    Ok(Json(bundle))
}

async fn clone_config(
    State(service): State<MappingService>,
    caller: Caller,
    Path(config_id): Path<String>,
    Json(overrides): Json<ConfigPatch>,
) -> ApiResult<(StatusCode, Json<ConfigBundle>)> {
    let bundle = service
        .configs()
        .clone_config(&service.deadline(), &caller, &config_id, overrides)
        .await?;
    Ok((StatusCode::CREATED, Json(bundle)))
}

async fn deactivate_config(
    State(service): State<MappingService>,
    caller: Caller,
    Path(config_id): Path<String>,
) -> ApiResult<Json<ConfigBundle>> {
    let bundle = service
        .configs()
        .deactivate(&service.deadline(), &caller, &config_id)
        .await?;
    Ok(Json(bundle))
}

#[derive(Deserialize)]
struct CreateMappingBody {
    configs: ConfigRefs,
    #[serde(default)]
    filter: FilterRequest,
}

#[derive(Serialize)]
struct WrittenResponse {
    written: usize,
}

async fn create_mapping(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
    Json(body): Json<CreateMappingBody>,
) -> ApiResult<(StatusCode, Json<WrittenResponse>)> {
    let written = service
        .mappings()
        .create_mapping(
            &service.deadline(),
            &caller,
            &project_id,
            &body.configs,
            &body.filter,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(WrittenResponse { written })))
}

#[derive(Deserialize)]
struct DeleteMappingBody {
    #[serde(default)]
    filter: FilterRequest,
}

#[derive(Serialize)]
struct RetiredResponse {
    retired: usize,
}

async fn delete_mapping(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
    Json(body): Json<DeleteMappingBody>,
) -> ApiResult<Json<RetiredResponse>> {
    let retired = service
        .mappings()
        .delete_mapping(&service.deadline(), &caller, &project_id, &body.filter)
        .await?;
    Ok(Json(RetiredResponse { retired }))
}

#[derive(Deserialize)]
struct ActiveMappingBody {
    filter: FilterCombination,
}

async fn get_active_mapping(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
    Json(body): Json<ActiveMappingBody>,
) -> ApiResult<Json<MasterEntry>> {
    let entry = service
        .mappings()
        .get_active_mapping(&service.deadline(), &caller, &project_id, &body.filter)
        .await?;
    Ok(Json(entry))
}

#[derive(Deserialize)]
struct ListMappingsParams {
    cursor: Option<String>,
    limit: Option<usize>,
}

async fn list_mappings(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
    Query(params): Query<ListMappingsParams>,
) -> ApiResult<Json<MappingPage>> {
    let page = service
        .mappings()
        .list_mappings(
            &service.deadline(),
            &caller,
            &project_id,
            params.cursor.as_deref(),
            params.limit,
        )
        .await?;
    Ok(Json(page))
}

async fn prune_mappings(
    State(service): State<MappingService>,
    caller: Caller,
    Path(project_id): Path<String>,
) -> ApiResult<Json<RetiredResponse>> {
    let retired = service
        .mappings()
        .prune_stale_mappings(&service.deadline(), &caller, &project_id)
        .await?;
    Ok(Json(RetiredResponse { retired }))
}

#[derive(Deserialize)]
struct ResolveBody {
    project_id: String,
    filter: FilterCombination,
    #[serde(default)]
    skip_cache: bool,
}

/// Client path. Authenticated by the time-salted client hash rather than a
/// caller identity.
async fn resolve(
    State(service): State<MappingService>,
    headers: HeaderMap,
    Json(body): Json<ResolveBody>,
) -> ApiResult<Json<Resolution>> {
    if let Some(salt) = service.client_salt() {
        let presented = headers
            .get(CLIENT_HASH_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !verify_client_hash(salt, presented, SystemTime::now()) {
            return Err(CoreError::Unauthorized("invalid client hash".into()));
        }
    }

    let resolution = service
        .resolver()
        .resolve(&service.deadline(), &body.project_id, &body.filter, body.skip_cache)
        .await?;
    Ok(Json(resolution))
}
