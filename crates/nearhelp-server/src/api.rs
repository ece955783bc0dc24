//! HTTP API.
//!
//! Thin handlers over the [`Coordinator`]: parse, delegate, serialize.
//! Identity arrives as an explicit participant id in the body or query;
//! authentication is a deployment concern handled upstream.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use nearhelp_core::{
    ChatMessage, Coordinate, HelpRequest, ParticipantId, RequestId, Visibility,
};

use crate::config::ServerConfig;
use crate::coordinator::{Coordinator, CreateRequest};
use crate::error::ApiError;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomRouter;
use crate::ws::ws_handler;

const MAX_MESSAGE_PAGE: u32 = 100;
const DEFAULT_MESSAGE_PAGE: u32 = 50;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub presence: PresenceRegistry,
    pub rooms: RoomRouter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/requests", post(create_request))
        .route("/requests/nearby", get(nearby_requests))
        .route("/requests/all", get(all_nearby_requests))
        .route("/requests/mine", get(my_requests))
        .route("/requests/accepted", get(accepted_requests))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/accept", post(accept_request))
        .route("/requests/:id/complete", post(complete_request))
        .route("/requests/:id/location", post(push_location))
        .route("/requests/:id/messages", post(post_message))
        .route("/requests/:id/messages", get(list_messages))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and run the HTTP server; returns only on listener failure.
pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    online: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online: state.presence.online_count().await,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequestBody {
    requester_id: ParticipantId,
    category: String,
    description: String,
    lat: f64,
    lng: f64,
    #[serde(default)]
    visibility: Option<Visibility>,
    #[serde(default)]
    duration_minutes: Option<i64>,
}

async fn create_request(
    State(state): State<AppState>,
    Json(body): Json<CreateRequestBody>,
) -> Result<(StatusCode, Json<HelpRequest>), ApiError> {
    let request = state
        .coordinator
        .create(CreateRequest {
            requester_id: body.requester_id,
            category: body.category,
            description: body.description,
            origin: Coordinate::new(body.lat, body.lng),
            visibility: body.visibility.unwrap_or(Visibility::Public),
            duration_minutes: body.duration_minutes,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NearbyQuery {
    participant_id: ParticipantId,
    lat: f64,
    lng: f64,
}

async fn nearby_requests(
    State(state): State<AppState>,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<HelpRequest>>, ApiError> {
    let feed = state
        .coordinator
        .nearby(query.participant_id, Coordinate::new(query.lat, query.lng))
        .await?;
    Ok(Json(feed))
}

async fn all_nearby_requests(
    State(state): State<AppState>,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<HelpRequest>>, ApiError> {
    let feed = state
        .coordinator
        .all_nearby(query.participant_id, Coordinate::new(query.lat, query.lng))
        .await?;
    Ok(Json(feed))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParticipantQuery {
    participant_id: ParticipantId,
}

async fn my_requests(
    State(state): State<AppState>,
    Query(query): Query<ParticipantQuery>,
) -> Result<Json<Vec<HelpRequest>>, ApiError> {
    Ok(Json(state.coordinator.requests_of(query.participant_id).await?))
}

async fn accepted_requests(
    State(state): State<AppState>,
    Query(query): Query<ParticipantQuery>,
) -> Result<Json<Vec<HelpRequest>>, ApiError> {
    Ok(Json(state.coordinator.accepted_by(query.participant_id).await?))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
) -> Result<Json<HelpRequest>, ApiError> {
    Ok(Json(state.coordinator.request(id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptBody {
    helper_id: ParticipantId,
}

async fn accept_request(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
    Json(body): Json<AcceptBody>,
) -> Result<Json<HelpRequest>, ApiError> {
    Ok(Json(state.coordinator.accept(id, body.helper_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteBody {
    participant_id: ParticipantId,
}

async fn complete_request(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
    Json(body): Json<CompleteBody>,
) -> Result<Json<HelpRequest>, ApiError> {
    Ok(Json(state.coordinator.complete(id, body.participant_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationBody {
    participant_id: ParticipantId,
    lat: f64,
    lng: f64,
}

#[derive(Serialize)]
struct LocationResponse {
    accepted: bool,
}

async fn push_location(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
    Json(body): Json<LocationBody>,
) -> Result<Json<LocationResponse>, ApiError> {
    state
        .coordinator
        .update_live_location(id, body.participant_id, Coordinate::new(body.lat, body.lng))
        .await?;
    Ok(Json(LocationResponse { accepted: true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageBody {
    sender_id: ParticipantId,
    sender_name: String,
    body: String,
}

async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
    Json(body): Json<MessageBody>,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    let message = state
        .coordinator
        .append_message(id, body.sender_id, &body.sender_name, &body.body)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    offset: Option<u32>,
}

async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<RequestId>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let limit = page.limit.unwrap_or(DEFAULT_MESSAGE_PAGE).min(MAX_MESSAGE_PAGE);
    let offset = page.offset.unwrap_or(0);
    Ok(Json(state.coordinator.messages(id, limit, offset).await?))
}
