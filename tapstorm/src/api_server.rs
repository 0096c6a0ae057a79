//! HTTP surface and realtime transport boundary.
//!
//! The identity collaborator attaches a verified opaque subject to every
//! request (`x-identity` header, `identity` query parameter for the
//! WebSocket upgrade). The first authenticated contact creates the user;
//! afterwards the core trusts the resolved id.

use std::{
    collections::HashMap, convert::Infallible, net::SocketAddr, sync::Arc, thread::JoinHandle,
};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tapstorm_utils::{unix_ms, Amount, RoomId, RoomType, TxKind, UserId};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use warp::{
    http::StatusCode,
    ws::{Message, WebSocket, Ws},
    Filter, Rejection, Reply,
};

use crate::{
    errors::{CoordinatorError, NotFoundError, Result, ValidationError},
    hub::SessionChannels,
    leaderboard::{self, Period},
    metrics::{
        ACTIVE_ROOMS, BROADCAST_DROPPED, CONNECTED_CLIENTS, GAMES_SETTLED, TAPS_ACCEPTED,
        TAPS_REJECTED,
    },
    protocol::{ClientMessage, ServerMessage},
    room_manager::CreateRoomParams,
    storage::{StorageError, UserProfile},
    ServiceContext,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub taps_accepted_total: u64,
    pub taps_rejected_total: HashMap<String, u64>,
    pub games_settled_total: u64,
    pub broadcast_dropped_total: u64,
    pub active_rooms: i64,
    pub connected_clients: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoomBody {
    pub entry_fee: Amount,
    pub capacity: Option<usize>,
    pub waiting_secs: Option<u64>,
    pub game_secs: Option<u64>,
    pub target_taps: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinBody {
    #[serde(default)]
    pub as_observer: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoJoinBody {
    pub entry_fee: Amount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentBody {
    pub amount: Amount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BonusTapBody {
    pub count: u32,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    identity: String,
}

/// Handle returned by spawn_api_server for graceful shutdown.
pub struct ApiServerHandle {
    pub thread_handle: JoinHandle<()>,
    pub shutdown_tx: oneshot::Sender<()>,
}

impl ApiServerHandle {
    /// Trigger graceful shutdown and wait for the server to stop.
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.thread_handle.join() {
            error!("API server thread panicked: {:?}", e);
        }
    }
}

/// Spawn the HTTP/WebSocket server on its own thread and runtime.
pub fn spawn_api_server(
    ctx: Arc<ServiceContext>,
    port: u16,
    allow_public_bind: bool,
) -> ApiServerHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let thread_handle = std::thread::spawn(move || {
        let rt = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                error!("Failed to create tokio runtime for API server: {}", e);
                return;
            }
        };
        rt.block_on(async move {
            let addr = if allow_public_bind {
                warn!("API server binding to 0.0.0.0:{} - publicly accessible", port);
                SocketAddr::from(([0, 0, 0, 0], port))
            } else {
                SocketAddr::from(([127, 0, 0, 1], port))
            };
            info!("Starting HTTP API server on {}", addr);

            let (_, server) = warp::serve(routes(ctx).recover(handle_rejection))
                .bind_with_graceful_shutdown(addr, async {
                    let _ = shutdown_rx.await;
                    info!("API server received shutdown signal");
                });
            server.await;
            info!("API server shut down gracefully");
        });
    });

    ApiServerHandle {
        thread_handle,
        shutdown_tx,
    }
}

pub fn routes(
    ctx: Arc<ServiceContext>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&HealthResponse {
            status: "ok".to_string(),
        })
    });

    let status = warp::path("status")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(status_handler);

    let metrics_json = warp::path!("metrics" / "json")
        .and(warp::get())
        .map(|| warp::reply::json(&gather_metrics()));

    let create_room = warp::path!("rooms" / String)
        .and(warp::post())
        .and(identity())
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(create_room_handler);

    let auto_join = warp::path!("rooms" / "auto-join")
        .and(warp::post())
        .and(identity())
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(auto_join_handler);

    let join_room = warp::path!("rooms" / u64 / "join")
        .and(warp::post())
        .and(identity())
        .and(json_or_default::<JoinBody>())
        .and(with_ctx(ctx.clone()))
        .and_then(join_room_handler);

    let leave_room = warp::path!("rooms" / u64 / "leave")
        .and(warp::post())
        .and(identity())
        .and(with_ctx(ctx.clone()))
        .and_then(leave_room_handler);

    let delete_room = warp::path!("rooms" / u64)
        .and(warp::delete())
        .and(identity())
        .and(with_ctx(ctx.clone()))
        .and_then(delete_room_handler);

    let get_room = warp::path!("rooms" / u64)
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(get_room_handler);

    let room_by_code = warp::path!("rooms" / "hero" / String)
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(room_by_code_handler);

    let bonus_start = warp::path!("bonus" / "start")
        .and(warp::post())
        .and(identity())
        .and(with_ctx(ctx.clone()))
        .and_then(bonus_start_handler);

    let bonus_pause = warp::path!("bonus" / "pause")
        .and(warp::post())
        .and(identity())
        .and(with_ctx(ctx.clone()))
        .and_then(bonus_pause_handler);

    let bonus_tap = warp::path!("bonus" / "tap")
        .and(warp::post())
        .and(identity())
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(bonus_tap_handler);

    let leaderboard_route = warp::path!("leaderboard" / String)
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(leaderboard_handler);

    let wallet_payment = warp::path!("wallet" / "payment")
        .and(warp::post())
        .and(identity())
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(wallet_payment_handler);

    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(warp::query::<WsQuery>())
        .and(with_ctx(ctx))
        .map(|ws: Ws, query: WsQuery, ctx: Arc<ServiceContext>| {
            ws.on_upgrade(move |socket| async move {
                match resolve_identity(&ctx, &query.identity).await {
                    Ok(profile) => client_session(ctx, profile.id, socket).await,
                    Err(e) => {
                        warn!("rejecting websocket, identity resolution failed: {e}");
                    }
                }
            })
        });

    health
        .or(status)
        .or(metrics_json)
        .or(auto_join)
        .or(room_by_code)
        .or(join_room)
        .or(leave_room)
        .or(create_room)
        .or(delete_room)
        .or(get_room)
        .or(bonus_start)
        .or(bonus_pause)
        .or(bonus_tap)
        .or(leaderboard_route)
        .or(wallet_payment)
        .or(ws_route)
}

fn with_ctx(
    ctx: Arc<ServiceContext>,
) -> impl Filter<Extract = (Arc<ServiceContext>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

fn identity() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::<String>("x-identity")
}

/// Optional JSON body with a default.
fn json_or_default<T: serde::de::DeserializeOwned + Default + Send>(
) -> impl Filter<Extract = (T,), Error = Infallible> + Clone {
    warp::body::json().or(warp::any().map(T::default)).unify()
}

/// Map a verified identity subject to a user, creating it on first contact.
async fn resolve_identity(ctx: &Arc<ServiceContext>, key: &str) -> Result<UserProfile> {
    if let Some(profile) = ctx.store.user_by_identity(key).await? {
        return Ok(profile);
    }
    match ctx.store.create_user(key, unix_ms()).await {
        Ok(profile) => Ok(profile),
        // Lost a creation race: the row exists now.
        Err(StorageError::Duplicate { .. }) => ctx
            .store
            .user_by_identity(key)
            .await?
            .ok_or_else(|| CoordinatorError::Unauthorized("identity vanished".into())),
        Err(e) => Err(e.into()),
    }
}

fn error_status(err: &CoordinatorError) -> StatusCode {
    match err {
        CoordinatorError::Validation(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::Ledger(crate::ledger::LedgerError::InsufficientBalance { .. }) => {
            StatusCode::PAYMENT_REQUIRED
        }
        CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
        CoordinatorError::InvalidState(_) => StatusCode::CONFLICT,
        CoordinatorError::Unauthorized(_) => StatusCode::FORBIDDEN,
        CoordinatorError::TapRejected(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiReply = warp::reply::WithStatus<warp::reply::Json>;

fn respond<T: Serialize>(result: Result<T>) -> ApiReply {
    match result {
        Ok(value) => warp::reply::with_status(warp::reply::json(&value), StatusCode::OK),
        Err(err) => warp::reply::with_status(
            warp::reply::json(&ErrorResponse {
                code: err.code().to_string(),
                error: err.to_string(),
            }),
            error_status(&err),
        ),
    }
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (status, code, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found", "no such route".to_string())
    } else {
        (
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("{rejection:?}"),
        )
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorResponse {
            code: code.to_string(),
            error: message,
        }),
        status,
    ))
}

// ── HTTP handlers ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct StatusResponse {
    status: String,
    stats: crate::room_manager::CoordinatorStats,
    connected_clients: usize,
    pending_payouts: Vec<crate::room_manager::PendingPayout>,
}

async fn status_handler(ctx: Arc<ServiceContext>) -> Result<ApiReply, Infallible> {
    let stats = ctx.rooms.stats().await;
    let pending_payouts = ctx.rooms.pending_payouts().await;
    Ok(respond(Ok(StatusResponse {
        status: "ok".to_string(),
        stats,
        connected_clients: ctx.hub.connection_count(),
        pending_payouts,
    })))
}

fn gather_metrics() -> MetricsResponse {
    let mut rejected = HashMap::new();
    for reason in ["count_ceiling", "rate_exceeded", "flagged", "storage"] {
        let value = TAPS_REJECTED.with_label_values(&[reason]).get();
        if value > 0 {
            rejected.insert(reason.to_string(), value);
        }
    }
    MetricsResponse {
        taps_accepted_total: TAPS_ACCEPTED.get(),
        taps_rejected_total: rejected,
        games_settled_total: GAMES_SETTLED.get(),
        broadcast_dropped_total: BROADCAST_DROPPED.get(),
        active_rooms: ACTIVE_ROOMS.get(),
        connected_clients: CONNECTED_CLIENTS.get(),
    }
}

async fn create_room_handler(
    kind: String,
    identity: String,
    body: CreateRoomBody,
    ctx: Arc<ServiceContext>,
) -> Result<ApiReply, Infallible> {
    let result = async {
        let room_type = match kind.as_str() {
            "standard" => RoomType::Standard,
            "hero" => RoomType::Hero,
            other => {
                return Err(ValidationError::MalformedMessage {
                    reason: format!("unknown room kind: {other}"),
                }
                .into())
            }
        };
        let profile = resolve_identity(&ctx, &identity).await?;
        ctx.rooms
            .create_room(CreateRoomParams {
                creator: profile.id,
                room_type,
                entry_fee: body.entry_fee,
                capacity: body.capacity.unwrap_or(2),
                waiting_secs: body.waiting_secs,
                game_secs: body.game_secs,
                target_taps: body.target_taps,
            })
            .await
    }
    .await;
    Ok(respond(result))
}

async fn auto_join_handler(
    identity: String,
    body: AutoJoinBody,
    ctx: Arc<ServiceContext>,
) -> Result<ApiReply, Infallible> {
    let result = async {
        let profile = resolve_identity(&ctx, &identity).await?;
        ctx.rooms.auto_join(profile.id, body.entry_fee).await
    }
    .await;
    Ok(respond(result))
}

async fn join_room_handler(
    room_id: u64,
    identity: String,
    body: JoinBody,
    ctx: Arc<ServiceContext>,
) -> Result<ApiReply, Infallible> {
    let result = async {
        let profile = resolve_identity(&ctx, &identity).await?;
        ctx.rooms
            .join(RoomId(room_id), profile.id, body.as_observer)
            .await
    }
    .await;
    Ok(respond(result))
}

async fn leave_room_handler(
    room_id: u64,
    identity: String,
    ctx: Arc<ServiceContext>,
) -> Result<ApiReply, Infallible> {
    let result = async {
        let profile = resolve_identity(&ctx, &identity).await?;
        ctx.rooms.leave(RoomId(room_id), profile.id).await?;
        Ok(HealthResponse {
            status: "left".to_string(),
        })
    }
    .await;
    Ok(respond(result))
}

async fn delete_room_handler(
    room_id: u64,
    identity: String,
    ctx: Arc<ServiceContext>,
) -> Result<ApiReply, Infallible> {
    let result = async {
        let profile = resolve_identity(&ctx, &identity).await?;
        ctx.rooms.delete_room(RoomId(room_id), profile.id).await?;
        Ok(HealthResponse {
            status: "deleted".to_string(),
        })
    }
    .await;
    Ok(respond(result))
}

async fn get_room_handler(room_id: u64, ctx: Arc<ServiceContext>) -> Result<ApiReply, Infallible> {
    Ok(respond(ctx.rooms.summary(RoomId(room_id)).await))
}

async fn room_by_code_handler(
    code: String,
    ctx: Arc<ServiceContext>,
) -> Result<ApiReply, Infallible> {
    Ok(respond(ctx.rooms.summary_by_code(&code).await))
}

#[derive(Debug, Clone, Serialize)]
struct BonusStartResponse {
    progress: tapstorm_utils::BonusProgress,
    room: crate::protocol::RoomSummary,
}

async fn bonus_start_handler(
    identity: String,
    ctx: Arc<ServiceContext>,
) -> Result<ApiReply, Infallible> {
    let result = async {
        let profile = resolve_identity(&ctx, &identity).await?;
        // Reuse the running bonus room; otherwise open a fresh one (which
        // also opens the challenge window).
        let room = match ctx.rooms.bonus_room_for(profile.id).await {
            Some(room_id) => ctx.rooms.summary(room_id).await?,
            None => {
                ctx.rooms
                    .create_room(CreateRoomParams {
                        creator: profile.id,
                        room_type: RoomType::Bonus,
                        entry_fee: 0,
                        capacity: 1,
                        waiting_secs: None,
                        game_secs: None,
                        target_taps: None,
                    })
                    .await?
            }
        };
        let progress = ctx.bonus.start(profile.id).await?;
        Ok(BonusStartResponse { progress, room })
    }
    .await;
    Ok(respond(result))
}

async fn bonus_pause_handler(
    identity: String,
    ctx: Arc<ServiceContext>,
) -> Result<ApiReply, Infallible> {
    let result = async {
        let profile = resolve_identity(&ctx, &identity).await?;
        ctx.bonus.pause(profile.id).await
    }
    .await;
    Ok(respond(result))
}

async fn bonus_tap_handler(
    identity: String,
    body: BonusTapBody,
    ctx: Arc<ServiceContext>,
) -> Result<ApiReply, Infallible> {
    let result = async {
        if body.count == 0 {
            return Err(ValidationError::ZeroTapCount.into());
        }
        let profile = resolve_identity(&ctx, &identity).await?;
        ctx.bonus.tap(profile.id, body.count).await
    }
    .await;
    Ok(respond(result))
}

async fn leaderboard_handler(
    period: String,
    ctx: Arc<ServiceContext>,
) -> Result<ApiReply, Infallible> {
    let result = async {
        let period: Period = period.parse().map_err(CoordinatorError::Validation)?;
        leaderboard::winnings(&ctx.store, period, unix_ms()).await
    }
    .await;
    Ok(respond(result))
}

async fn wallet_payment_handler(
    identity: String,
    body: PaymentBody,
    ctx: Arc<ServiceContext>,
) -> Result<ApiReply, Infallible> {
    let result = async {
        let profile = resolve_identity(&ctx, &identity).await?;
        ctx.ledger
            .credit(profile.id, body.amount, TxKind::Payment, "wallet payment")
            .await?;
        ctx.store.set_wallet_linked(profile.id, true).await?;
        Ok(HealthResponse {
            status: "credited".to_string(),
        })
    }
    .await;
    Ok(respond(result))
}

// ── WebSocket session ─────────────────────────────────────────────────

/// One task per connection: reads, validates and routes inbound frames,
/// forwards the hub's outbound queue, and runs disconnect cleanup when the
/// socket goes away for any reason.
pub async fn client_session(ctx: Arc<ServiceContext>, user: UserId, socket: WebSocket) {
    debug!(%user, "websocket session open");
    let (mut ws_tx, mut ws_rx) = socket.split();
    let SessionChannels {
        connection,
        mut outbound,
        mut close,
    } = ctx.hub.register(user);

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = outbound.recv() => match maybe {
                    Some(message) => {
                        if ws_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut close => {
                    let _ = ws_tx.send(Message::close()).await;
                    break;
                }
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                debug!(%user, "websocket read error: {e}");
                break;
            }
        };
        connection.touch();
        if message.is_close() {
            break;
        }
        if message.is_ping() || message.is_pong() {
            continue;
        }
        let Ok(text) = message.to_str() else {
            continue;
        };
        route_client_message(&ctx, user, text).await;
    }

    // Disconnect is a best-effort leave for every joined room.
    let rooms = ctx.hub.unregister(user, connection.seq);
    for room in rooms {
        match ctx.rooms.leave(room, user).await {
            Ok(()) => {}
            Err(e) => {
                // Active rooms keep the participant for scoring; still let
                // the others know the connection is gone.
                debug!(%room, %user, "disconnect leave skipped: {e}");
                ctx.hub.broadcast(
                    room,
                    &ServerMessage::PlayerLeave {
                        room_id: room,
                        user_id: user,
                    },
                );
            }
        }
    }
    writer.abort();
    debug!(%user, "websocket session closed");
}

async fn route_client_message(ctx: &Arc<ServiceContext>, user: UserId, text: &str) {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            let err = CoordinatorError::from(e);
            ctx.hub.send_to(
                user,
                &ServerMessage::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                },
            );
            return;
        }
    };

    let result: Result<()> = match message {
        ClientMessage::JoinRoom { room_id, data } => {
            // Membership first so the joiner sees their own join events.
            ctx.hub.join_room(room_id, user);
            match ctx.rooms.join(room_id, user, data.as_observer).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    ctx.hub.leave_room(room_id, user);
                    Err(e)
                }
            }
        }
        ClientMessage::LeaveRoom { room_id } => {
            let result = ctx.rooms.leave(room_id, user).await;
            ctx.hub.leave_room(room_id, user);
            result
        }
        ClientMessage::Tap {
            room_id,
            data,
            timestamp,
        } => ctx
            .rooms
            .record_tap(room_id, user, data.count, timestamp)
            .await
            .map(|_| ()),
        ClientMessage::PlayerReaction { room_id, data } => {
            if ctx.hub.members_of(room_id).contains(&user) {
                ctx.hub.broadcast(
                    room_id,
                    &ServerMessage::PlayerReaction {
                        room_id,
                        user_id: user,
                        data,
                    },
                );
                Ok(())
            } else {
                Err(NotFoundError::Room(room_id).into())
            }
        }
    };

    if let Err(e) = result {
        // Soft per-client error; the room at large never sees it.
        ctx.hub.send_to(
            user,
            &ServerMessage::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        );
    }
}
