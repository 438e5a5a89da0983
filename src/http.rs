use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use ulid::Ulid;

use crate::auth::ApiAuth;
use crate::engine::{Engine, EngineError, NewReservation, ReservationPatch, Scope};
use crate::model::*;
use crate::observability::{REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub auth: ApiAuth,
}

// ── Wire types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReservationBody {
    pub resource_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(deserialize_with = "utc_timestamp")]
    pub start: Ts,
    #[serde(deserialize_with = "utc_timestamp")]
    pub end: Ts,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReservationBody {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(deserialize_with = "utc_timestamp")]
    pub start: Ts,
    #[serde(deserialize_with = "utc_timestamp")]
    pub end: Ts,
}

/// RFC 3339 in UTC (`Z` suffix) only, so timestamps echo back unchanged.
fn utc_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Ts, D::Error> {
    let raw = String::deserialize(deserializer)?;
    if !raw.ends_with(['Z', 'z']) {
        return Err(de::Error::custom(format!("timestamp must be UTC with a Z suffix, got {raw:?}")));
    }
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(de::Error::custom)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationView {
    pub id: Ulid,
    pub resource_id: ResourceId,
    pub owner_id: OwnerId,
    pub title: String,
    pub description: Option<String>,
    pub start: Ts,
    pub end: Ts,
    pub created_at: Ts,
    pub updated_at: Ts,
}

impl From<Reservation> for ReservationView {
    fn from(r: Reservation) -> Self {
        Self {
            id: r.id,
            resource_id: r.resource_id,
            owner_id: r.owner_id,
            title: r.title,
            description: r.description,
            start: r.span.start,
            end: r.span.end,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanView {
    pub start: Ts,
    pub end: Ts,
}

impl From<Span> for SpanView {
    fn from(s: Span) -> Self {
        Self {
            start: s.start,
            end: s.end,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayQuery {
    date: Option<String>,
    min_minutes: Option<i64>,
}

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
    /// Path id that cannot name any reservation.
    UnknownId(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "InvalidInput", msg.clone()),
            ApiError::UnknownId(id) => (
                StatusCode::NOT_FOUND,
                "NotFound",
                format!("reservation not found: {id}"),
            ),
            ApiError::Engine(e) => {
                let (status, kind) = match e {
                    EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => {
                        (StatusCode::BAD_REQUEST, "InvalidInput")
                    }
                    EngineError::SlotConflict(_) => (StatusCode::CONFLICT, "SlotConflict"),
                    EngineError::NotFound(_) | EngineError::ResourceNotFound(_) => {
                        (StatusCode::NOT_FOUND, "NotFound")
                    }
                    EngineError::Busy(_) => (StatusCode::SERVICE_UNAVAILABLE, "Busy"),
                    EngineError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
                    EngineError::WalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal"),
                };
                (status, kind, e.to_string())
            }
        };

        let mut body = json!({ "error": kind, "message": message });
        if let ApiError::Engine(EngineError::SlotConflict(id)) = &self {
            body["conflictingId"] = json!(id.to_string());
        }
        if status.is_server_error() && !matches!(self, ApiError::Engine(EngineError::Busy(_))) {
            tracing::error!("request failed: {message}");
        }

        let mut response = (status, Json(body)).into_response();
        if matches!(self, ApiError::Engine(EngineError::Busy(_))) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

fn parse_id(raw: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(raw).map_err(|_| ApiError::UnknownId(raw.to_string()))
}

fn parse_day(query: &DayQuery) -> Result<NaiveDate, ApiError> {
    let raw = query
        .date
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing date".into()))?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("date must be YYYY-MM-DD, got {raw:?}")))
}

// ── Handlers ─────────────────────────────────────────────────────

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn create_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateReservationBody>, JsonRejection>,
) -> Result<(StatusCode, Json<ReservationView>), ApiError> {
    let principal = state.auth.authenticate(&headers)?;
    let Json(body) = body?;
    let request = NewReservation {
        resource_id: body.resource_id,
        title: body.title,
        description: body.description,
        span: Span {
            start: body.start,
            end: body.end,
        },
    };
    let created = state.engine.create(principal.as_ref(), request).await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

async fn update_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<UpdateReservationBody>, JsonRejection>,
) -> Result<Json<ReservationView>, ApiError> {
    let principal = state.auth.authenticate(&headers)?;
    let id = parse_id(&id)?;
    let Json(body) = body?;
    let patch = ReservationPatch {
        title: body.title,
        description: body.description,
        span: Span {
            start: body.start,
            end: body.end,
        },
    };
    let updated = state.engine.update(principal.as_ref(), id, patch).await?;
    Ok(Json(updated.into()))
}

async fn delete_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state.auth.authenticate(&headers)?;
    let id = parse_id(&id)?;
    state.engine.delete(principal.as_ref(), id).await?;
    Ok(Json(json!({})))
}

async fn get_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ReservationView>, ApiError> {
    state.auth.authenticate(&headers)?;
    let id = parse_id(&id)?;
    Ok(Json(state.engine.get(id).await?.into()))
}

async fn list_reservations(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<ReservationView>>, ApiError> {
    let principal = state.auth.authenticate(&headers)?;
    let Query(query) = query?;
    let scope = match query.scope.as_deref() {
        None | Some("mine") => Scope::Mine,
        Some("all") => Scope::All,
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "scope must be mine or all, got {other:?}"
            )));
        }
    };
    let reservations = state.engine.list(principal.as_ref(), scope).await?;
    Ok(Json(reservations.into_iter().map(Into::into).collect()))
}

async fn availability(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(resource_id): Path<String>,
    query: Result<Query<DayQuery>, QueryRejection>,
) -> Result<Json<Vec<SpanView>>, ApiError> {
    state.auth.authenticate(&headers)?;
    let Query(query) = query?;
    let day = parse_day(&query)?;
    let busy = state.engine.free_busy(&resource_id, day).await?;
    Ok(Json(busy.into_iter().map(Into::into).collect()))
}

async fn free_slots(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(resource_id): Path<String>,
    query: Result<Query<DayQuery>, QueryRejection>,
) -> Result<Json<Vec<SpanView>>, ApiError> {
    state.auth.authenticate(&headers)?;
    let Query(query) = query?;
    let day = parse_day(&query)?;
    let min_duration = match query.min_minutes {
        None => None,
        Some(m) if (0..=24 * 60).contains(&m) => Some(TimeDelta::minutes(m)),
        Some(m) => {
            return Err(ApiError::BadRequest(format!(
                "minMinutes must be between 0 and 1440, got {m}"
            )));
        }
    };
    let free = state.engine.free_slots(&resource_id, day, min_duration).await?;
    Ok(Json(free.into_iter().map(Into::into).collect()))
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let started = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16().to_string();
    metrics::counter!(REQUESTS_TOTAL, "route" => route.clone(), "status" => status).increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "route" => route)
        .record(started.elapsed().as_secs_f64());
    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/reservations",
            get(list_reservations).post(create_reservation),
        )
        .route(
            "/reservations/{id}",
            get(get_reservation)
                .put(update_reservation)
                .delete(delete_reservation),
        )
        .route("/resources/{id}/availability", get(availability))
        .route("/resources/{id}/free-slots", get(free_slots))
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then let in-flight requests finish.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
