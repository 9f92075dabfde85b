//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State,
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::engine::{AllocateError, HoldDuration, ReleaseError};
use crate::feed::{FeedSubscription, SlotView};
use crate::pool::{BlockId, HoldToken, SlotId, SlotStatus};
use crate::service::{HealthStatus, ParkingService};
use crate::version::VersionInfo;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for AllocateError {
    fn into_response(self) -> Response {
        match self {
            AllocateError::NoCapacity => error_response(StatusCode::NOT_FOUND, self),
        }
    }
}

impl IntoResponse for ReleaseError {
    fn into_response(self) -> Response {
        error_response(StatusCode::BAD_REQUEST, self)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotRef {
    pub block: BlockId,
    pub number: u32,
}

impl From<SlotId> for SlotRef {
    fn from(id: SlotId) -> Self {
        Self {
            block: id.block,
            number: id.number,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateQuery {
    pub user_id: Option<String>,
}

/// One held slot in the `/slots` listing; available slots are `null`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeldSlot {
    pub status: SlotStatus,
    pub held_by: HoldToken,
    pub start_time: DateTime<Utc>,
}

/// Body of `POST /release`. Fields stay loose so any malformed value maps
/// to `InvalidSlot` instead of a framework rejection.
#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub block: Option<serde_json::Value>,
    pub number: Option<serde_json::Value>,
}

impl ReleaseRequest {
    fn slot_id(&self) -> Option<SlotId> {
        let block: BlockId = self.block.as_ref()?.as_str()?.parse().ok()?;
        let number = u32::try_from(self.number.as_ref()?.as_u64()?).ok()?;
        (number > 0).then(|| SlotId::new(block, number))
    }
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub duration: HoldDuration,
}

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub available: usize,
    pub capacity: usize,
    pub version: VersionInfo,
}

async fn allocate(
    State(service): State<Arc<ParkingService>>,
    Query(query): Query<AllocateQuery>,
) -> Result<Json<SlotRef>, AllocateError> {
    let holder = query
        .user_id
        .filter(|id| !id.is_empty())
        .map(HoldToken::new);
    let slot = service.allocate(holder)?;
    Ok(Json(slot.into()))
}

async fn occupied(State(service): State<Arc<ParkingService>>) -> Json<Vec<SlotRef>> {
    Json(service.occupied().into_iter().map(SlotRef::from).collect())
}

async fn slots(
    State(service): State<Arc<ParkingService>>,
) -> Json<IndexMap<String, Vec<Option<HeldSlot>>>> {
    let blocks = service
        .slots()
        .into_iter()
        .map(|(block, slots)| {
            let entries = slots
                .into_iter()
                .map(|slot| {
                    let status = slot.status();
                    slot.state.hold().map(|hold| HeldSlot {
                        status,
                        held_by: hold.holder.clone(),
                        start_time: hold.started_at,
                    })
                })
                .collect();
            (block.to_string(), entries)
        })
        .collect();
    Json(blocks)
}

async fn release(
    State(service): State<Arc<ParkingService>>,
    payload: Result<Json<ReleaseRequest>, JsonRejection>,
) -> Result<Json<ReleaseResponse>, ReleaseError> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Unreadable release request");
            return Err(ReleaseError::InvalidSlot);
        }
    };
    let slot = request.slot_id().ok_or(ReleaseError::InvalidSlot)?;
    let duration = service.release(slot)?;
    Ok(Json(ReleaseResponse { duration }))
}

async fn snapshot(State(service): State<Arc<ParkingService>>) -> Json<Vec<SlotView>> {
    Json(service.snapshot())
}

async fn events(
    State(service): State<Arc<ParkingService>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    tracing::debug!("SSE subscriber connected");
    let stream = service
        .subscribe()
        .into_stream()
        .map(|message| Event::default().json_data(message));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn ws(ws: WebSocketUpgrade, State(service): State<Arc<ParkingService>>) -> Response {
    let subscription = service.subscribe();
    ws.on_upgrade(move |socket: WebSocket| {
        let (sender, receiver) = socket.split();
        push_to_socket(sender, receiver, subscription)
    })
}

/// Forward feed messages as text frames until either side goes away.
async fn push_to_socket<S, R, E>(mut sender: S, mut receiver: R, mut subscription: FeedSubscription)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    tracing::debug!("WebSocket subscriber connected");

    loop {
        tokio::select! {
            message = subscription.next() => {
                let Some(message) = message else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode feed message");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.close().await;
    tracing::debug!("WebSocket subscriber disconnected");
}

async fn health_check(State(service): State<Arc<ParkingService>>) -> Json<HealthCheckResponse> {
    let snapshot = service.health();
    Json(HealthCheckResponse {
        status: snapshot.status(),
        available: snapshot.available,
        capacity: snapshot.capacity,
        version: snapshot.version,
    })
}

pub fn routes(service: Arc<ParkingService>) -> Router {
    Router::new()
        .route("/allocate", get(allocate))
        .route("/occupied", get(occupied))
        .route("/slots", get(slots))
        .route("/release", post(release))
        .route("/snapshot", get(snapshot))
        .route("/events", get(events))
        .route("/ws", get(ws))
        .route("/health-check", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(service)
}
