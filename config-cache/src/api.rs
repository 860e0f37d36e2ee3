use crate::config::Listener as ListenerConfig;
use crate::engine::{ConfigEngine, EngineError};
use crate::gray_rule::{GrayRule, GrayRuleError};
use crate::query_chain::{ConfigQuery, QueryResult};
use crate::repository::{ConfigWriter, RepositoryError, RowDraft};
use crate::types::{ConfigKey, QueryStatus, VariantTarget, now_millis};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum ConfigApiError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Clone)]
struct AppState {
    engine: ConfigEngine,
    writer: Arc<dyn ConfigWriter>,
}

pub fn router(engine: ConfigEngine, writer: Arc<dyn ConfigWriter>) -> Router {
    Router::new()
        .route(
            "/v1/cs/configs",
            get(get_config).post(publish_config).delete(delete_config),
        )
        .route("/v1/cs/notify", post(notify))
        .with_state(AppState { engine, writer })
}

pub async fn serve(
    listener: ListenerConfig,
    engine: ConfigEngine,
    writer: Arc<dyn ConfigWriter>,
) -> Result<(), ConfigApiError> {
    let app = router(engine, writer);

    let addr = format!("{}:{}", listener.host, listener.port);
    tracing::info!(%addr, "Config API listening");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("invalid gray rule: {0}")]
    InvalidRule(#[from] GrayRuleError),

    #[error("{0}")]
    BadRequest(String),

    #[error("config not found")]
    NotFound,

    #[error("tag not found")]
    TagNotFound,

    #[error("conflicting gray rules matched")]
    GrayConflict,
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Engine(EngineError::NotReady) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Engine(EngineError::InvalidKey(_))
            | ApiError::InvalidRule(_)
            | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound | ApiError::TagNotFound | ApiError::GrayConflict => {
                StatusCode::NOT_FOUND
            }
            ApiError::Engine(_) | ApiError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });

        (status, body).into_response()
    }
}

#[derive(Deserialize, Debug, Default)]
struct ConfigParams {
    #[serde(default)]
    namespace: String,
    group: String,
    data_id: String,
    tag: Option<String>,
    client_ip: Option<String>,
    /// Comma separated `name=value` pairs.
    labels: Option<String>,
}

impl ConfigParams {
    fn key(&self) -> ConfigKey {
        ConfigKey::new(&self.namespace, &self.group, &self.data_id)
    }

    fn to_query(&self) -> Result<ConfigQuery, ApiError> {
        let mut query = ConfigQuery::new(self.key());
        if let Some(tag) = &self.tag {
            query = query.with_tag(tag);
        }
        if let Some(ip) = &self.client_ip {
            query = query.with_client_ip(ip);
        }
        for pair in self.labels.iter().flat_map(|l| l.split(',')) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| ApiError::BadRequest(format!("malformed label: {pair:?}")))?;
            query = query.with_label(name.trim(), value.trim());
        }
        Ok(query)
    }
}

#[derive(Serialize, Debug, PartialEq)]
struct ConfigResponse {
    status: &'static str,
    content: String,
    md5: Option<String>,
    legacy_md5: Option<String>,
    last_modified: Option<i64>,
    encrypted_data_key: Option<String>,
    gray_name: Option<String>,
}

impl TryFrom<QueryResult> for ConfigResponse {
    type Error = ApiError;

    fn try_from(result: QueryResult) -> Result<Self, ApiError> {
        match result.status {
            QueryStatus::NotFound => return Err(ApiError::NotFound),
            QueryStatus::TagNotFound => return Err(ApiError::TagNotFound),
            QueryStatus::GrayConflict => return Err(ApiError::GrayConflict),
            QueryStatus::Beta | QueryStatus::Tag | QueryStatus::Formal => {}
        }
        Ok(ConfigResponse {
            status: result.status.as_str(),
            content: result.content.as_deref().unwrap_or_default().to_string(),
            md5: result.md5,
            legacy_md5: result.legacy_md5,
            last_modified: result.last_modified,
            encrypted_data_key: result.encrypted_data_key,
            gray_name: result.matched_gray,
        })
    }
}

async fn get_config(
    State(state): State<AppState>,
    Query(params): Query<ConfigParams>,
) -> Result<Json<ConfigResponse>, ApiError> {
    let result = state.engine.resolve(&params.to_query()?)?;
    Ok(Json(result.try_into()?))
}

/// Which channel a write or notification refers to. At most one of the
/// fields may be set; none means the formal release.
#[derive(Deserialize, Debug, Default)]
struct ChannelParams {
    tag: Option<String>,
    gray_name: Option<String>,
    #[serde(default)]
    beta: bool,
}

impl ChannelParams {
    fn target(&self) -> Result<VariantTarget, ApiError> {
        let target = match (&self.tag, &self.gray_name, self.beta) {
            (None, None, false) => VariantTarget::Formal,
            (Some(tag), None, false) => VariantTarget::Tag(tag.clone()),
            (None, Some(name), false) => VariantTarget::Gray(name.clone()),
            (None, None, true) => VariantTarget::Beta,
            _ => {
                return Err(ApiError::BadRequest(
                    "tag, gray_name and beta are mutually exclusive".into(),
                ));
            }
        };
        target.validate().map_err(EngineError::from)?;
        Ok(target)
    }
}

#[derive(Deserialize, Debug)]
struct PublishRequest {
    #[serde(default)]
    namespace: String,
    group: String,
    data_id: String,
    content: String,
    #[serde(flatten)]
    channel: ChannelParams,
    gray_rule: Option<String>,
    beta_ips: Option<String>,
    encrypted_data_key: Option<String>,
}

#[derive(Serialize, Debug)]
struct PublishResponse {
    id: u64,
    md5: Option<String>,
    last_modified: i64,
}

async fn publish_config(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, ApiError> {
    let key = ConfigKey::new(&request.namespace, &request.group, &request.data_id);
    key.validate().map_err(EngineError::from)?;
    let target = request.channel.target()?;

    let mut draft = RowDraft::formal(key.clone(), request.content, now_millis());
    draft.target = Some(target.clone());
    draft.encrypted_data_key = request.encrypted_data_key;
    match &target {
        VariantTarget::Gray(_) => {
            let rule = request
                .gray_rule
                .ok_or_else(|| ApiError::BadRequest("gray_rule is required".into()))?;
            GrayRule::parse(&rule)?;
            draft.gray_rule = Some(rule);
        }
        VariantTarget::Beta => {
            let ips = request
                .beta_ips
                .filter(|ips| !ips.trim().is_empty())
                .ok_or_else(|| ApiError::BadRequest("beta_ips is required".into()))?;
            draft.beta_ips = Some(ips);
        }
        VariantTarget::Formal | VariantTarget::Tag(_) => {}
    }

    let row = state.writer.publish(draft).await?;
    state
        .engine
        .on_write_committed(key, target, row.last_modified, "publish")?;
    Ok(Json(PublishResponse {
        id: row.id,
        md5: row.md5,
        last_modified: row.last_modified,
    }))
}

#[derive(Deserialize, Debug, Default)]
struct DeleteParams {
    #[serde(default)]
    namespace: String,
    group: String,
    data_id: String,
    tag: Option<String>,
    gray_name: Option<String>,
    #[serde(default)]
    beta: bool,
}

async fn delete_config(
    State(state): State<AppState>,
    Query(params): Query<DeleteParams>,
) -> Result<StatusCode, ApiError> {
    let key = ConfigKey::new(&params.namespace, &params.group, &params.data_id);
    key.validate().map_err(EngineError::from)?;
    let target = ChannelParams {
        tag: params.tag,
        gray_name: params.gray_name,
        beta: params.beta,
    }
    .target()?;
    let at = now_millis();

    if !state.writer.remove(&key, &target, at).await? {
        return Err(ApiError::NotFound);
    }
    state.engine.on_write_committed(key, target, at, "delete")?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Debug)]
struct NotifyRequest {
    #[serde(default)]
    namespace: String,
    group: String,
    data_id: String,
    #[serde(default = "default_target")]
    target: VariantTarget,
    last_modified: i64,
    source: Option<String>,
}

fn default_target() -> VariantTarget {
    VariantTarget::Formal
}

async fn notify(
    State(state): State<AppState>,
    Json(request): Json<NotifyRequest>,
) -> Result<StatusCode, ApiError> {
    let key = ConfigKey::new(request.namespace, request.group, request.data_id);
    state.engine.on_write_committed(
        key,
        request.target,
        request.last_modified,
        request.source.as_deref().unwrap_or("notify"),
    )?;
    Ok(StatusCode::ACCEPTED)
}
