use std::sync::Arc;

use async_graphql::http::GraphiQLSource;
use async_graphql_axum::GraphQL;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, middleware};
use serde::{Deserialize, Serialize};
use tower_http::LatencyUnit;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::{Reservation, ReservationDraft, Timestamp};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub api_token: Arc<str>,
}

// ── Wire types ───────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ReservationResponse {
    pub id: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub total_price: f64,
}

impl From<&Reservation> for ReservationResponse {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id.to_string(),
            start_time: r.start_time(),
            end_time: r.end_time(),
            total_price: r.total_price(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateReservationRequest {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub client_id: Ulid,
    pub calendar_id: Ulid,
    #[serde(default)]
    pub product_ids: Vec<Ulid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateReservationRequest {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub client_id: Ulid,
    pub calendar_id: Ulid,
}

impl From<UpdateReservationRequest> for ReservationDraft {
    fn from(req: UpdateReservationRequest) -> Self {
        ReservationDraft {
            start_time: req.start_time,
            end_time: req.end_time,
            client_id: req.client_id,
            calendar_id: req.calendar_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

// ── Errors ───────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

fn engine_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::DoubleBooking(_)
        | EngineError::ReferentialIntegrity { .. }
        | EngineError::DuplicateEmail(_) => StatusCode::CONFLICT,
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::Invalid(_) => StatusCode::BAD_REQUEST,
        EngineError::Wal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Engine(e) => {
                let status = engine_status(&e);
                if status.is_server_error() {
                    tracing::error!("request failed: {e}");
                }
                (
                    status,
                    ErrorBody {
                        code: e.code(),
                        message: e.to_string(),
                    },
                )
            }
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    code: "INVALID_INPUT",
                    message,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_id(raw: &str) -> ApiResult<Ulid> {
    Ulid::from_string(raw).map_err(|e| ApiError::BadRequest(format!("invalid id {raw:?}: {e}")))
}

// ── Handlers ─────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

async fn list_reservations(State(state): State<AppState>) -> Json<Vec<ReservationResponse>> {
    let reservations = state.engine.list_reservations().await;
    Json(reservations.iter().map(ReservationResponse::from).collect())
}

async fn create_reservation(
    State(state): State<AppState>,
    body: Result<Json<CreateReservationRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ReservationResponse>)> {
    let Json(req) = body?;
    let draft = ReservationDraft {
        start_time: req.start_time,
        end_time: req.end_time,
        client_id: req.client_id,
        calendar_id: req.calendar_id,
    };
    let reservation = state
        .engine
        .create_reservation(Ulid::new(), draft, req.product_ids)
        .await?;
    Ok((StatusCode::CREATED, Json(ReservationResponse::from(&reservation))))
}

async fn get_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ReservationResponse>> {
    let reservation = state.engine.get_reservation(parse_id(&id)?).await?;
    Ok(Json(ReservationResponse::from(&reservation)))
}

async fn update_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<UpdateReservationRequest>, JsonRejection>,
) -> ApiResult<Json<ReservationResponse>> {
    let id = parse_id(&id)?;
    let Json(req) = body?;
    let reservation = state.engine.update_reservation(id, req.into()).await?;
    Ok(Json(ReservationResponse::from(&reservation)))
}

async fn delete_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.delete_reservation(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn graphiql() -> Html<String> {
    Html(GraphiQLSource::build().endpoint("/graphql").finish())
}

// ── Router ───────────────────────────────────────────────

/// The full HTTP surface: health, the authenticated reservation API, and
/// GraphQL with its GraphiQL page.
pub fn router(engine: Arc<Engine>, api_token: &str) -> Router {
    let state = AppState {
        engine: engine.clone(),
        api_token: Arc::from(api_token),
    };
    let schema = crate::graphql::build_schema(engine);

    let api = Router::new()
        .route("/reservations", get(list_reservations).post(create_reservation))
        .route(
            "/reservations/{id}",
            get(get_reservation)
                .put(update_reservation)
                .delete(delete_reservation),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_token,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/graphql", get(graphiql).post_service(GraphQL::new(schema)))
        .nest("/api", api)
        .route_layer(middleware::from_fn(crate::observability::track_metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(LatencyUnit::Millis),
                ),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EntityKind;

    #[test]
    fn engine_errors_map_to_statuses() {
        let id = Ulid::new();
        assert_eq!(engine_status(&EngineError::DoubleBooking(id)), StatusCode::CONFLICT);
        assert_eq!(
            engine_status(&EngineError::NotFound {
                kind: EntityKind::Reservation,
                id
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            engine_status(&EngineError::DuplicateEmail("a@b".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(engine_status(&EngineError::Invalid("bad")), StatusCode::BAD_REQUEST);
        assert_eq!(
            engine_status(&EngineError::Wal("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn malformed_ids_are_bad_requests() {
        assert!(matches!(parse_id("nope"), Err(ApiError::BadRequest(_))));
        let id = Ulid::new();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
    }
}
