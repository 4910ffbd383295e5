use agora_shared::permission::Container;
use agora_shared::protocol::{MessagePayload, SendMessage};
use agora_shared::types::{MessageId, ReplyId, RoomId, SectionId, ThreadId};
use agora_shared::UserSummary;
use agora_store::{HistoryCursor, Room, Section, UnreadCounts};
use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::AuthUser;
use crate::broker::{Broker, HistoryView, SendOutcome};
use crate::error::ServerError;
use crate::forum::{ReplyView, ThreadDetail, ThreadView};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/api/online_count", get(online_count))
        .route("/api/unread_counts", get(unread_counts))
        .route("/api/last_views/unread_counts", get(unread_counts))
        // Chat
        .route("/api/chat/rooms", get(list_rooms))
        .route("/api/chat/history", get(history_by_query))
        .route("/api/chat/send", post(send_message))
        .route("/api/chat/messages/:id", get(get_message).delete(delete_message))
        .route("/api/chat/:room_id/history", get(history_by_path))
        .route("/api/chat/:room_id/view", post(view_room))
        .route("/api/chat/:room_id/online_users", get(room_online_users))
        // Forum
        .route("/api/forum/sections", get(list_sections))
        .route(
            "/api/forum/sections/:section_id/threads",
            get(list_threads).post(create_thread),
        )
        .route("/api/forum/sections/:section_id/view", post(view_section))
        .route("/api/forum/threads/:thread_id", get(get_thread).delete(delete_thread))
        .route("/api/forum/threads/:thread_id/replies", post(create_reply))
        .route("/api/forum/replies/:reply_id", delete(delete_reply))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// `{ "success": true, ...payload }`
#[derive(Serialize)]
struct Success<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

fn ok<T: Serialize>(body: T) -> Json<Success<T>> {
    Json(Success {
        success: true,
        body,
    })
}

#[derive(Serialize)]
struct Done {}

#[derive(Serialize)]
struct RoomsResponse {
    rooms: Vec<Room>,
}

#[derive(Serialize)]
struct SectionsResponse {
    sections: Vec<Section>,
}

#[derive(Serialize)]
struct ThreadsResponse {
    threads: Vec<ThreadView>,
}

#[derive(Serialize)]
struct MessageResponse {
    message: MessagePayload,
}

#[derive(Serialize)]
struct OnlineUsersResponse {
    count: usize,
    users: Vec<UserSummary>,
}

#[derive(Serialize)]
struct OnlineCountResponse {
    count: usize,
}

#[derive(Serialize)]
struct ChallengeResponse {
    success: bool,
    message: &'static str,
    captcha_id: String,
    question: String,
}

#[derive(Deserialize, Default)]
struct HistoryParams {
    room_id: Option<RoomId>,
    limit: Option<u32>,
    offset: Option<u32>,
    page: Option<String>,
}

impl HistoryParams {
    /// `page` wins over `offset`; `page=last` is the final page and an
    /// unparseable page reads as the first.
    fn cursor(&self) -> HistoryCursor {
        match self.page.as_deref().map(str::trim) {
            Some(page) if page.eq_ignore_ascii_case("last") => HistoryCursor::LastPage,
            Some(page) => HistoryCursor::Page(page.parse().unwrap_or(0)),
            None => HistoryCursor::Offset(self.offset.unwrap_or(0)),
        }
    }
}

#[derive(Deserialize)]
struct NewThreadRequest {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct NewReplyRequest {
    #[serde(default)]
    content: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ─── Presence and unread ───

async fn online_count(State(state): State<AppState>, _user: AuthUser) -> Json<OnlineCountResponse> {
    let count = state.broker.global_online_count().await;
    Json(OnlineCountResponse { count })
}

async fn room_online_users(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(room_id): Path<RoomId>,
) -> Result<impl IntoResponse, ServerError> {
    let users = state.broker.online_users(&identity, room_id).await?;
    Ok(ok(OnlineUsersResponse {
        count: users.len(),
        users,
    }))
}

async fn unread_counts(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<Json<Success<UnreadCounts>>, ServerError> {
    Ok(ok(state.broker.unread_counts(&identity)?))
}

// ─── Chat ───

async fn list_rooms(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<impl IntoResponse, ServerError> {
    let rooms = state.broker.list_rooms(&identity)?;
    Ok(ok(RoomsResponse { rooms }))
}

async fn history_by_query(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Success<HistoryView>>, ServerError> {
    let room = params
        .room_id
        .ok_or_else(|| ServerError::validation("room_id is required"))?;
    let view = state
        .broker
        .history(&identity, room, params.limit, params.cursor())?;
    Ok(ok(view))
}

async fn history_by_path(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(room_id): Path<RoomId>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Success<HistoryView>>, ServerError> {
    let view = state
        .broker
        .history(&identity, room_id, params.limit, params.cursor())?;
    Ok(ok(view))
}

/// Same pipeline as the socket `send_message` event. A challenged send
/// answers 429 with the challenge; resubmitting with `captcha_id` and
/// `captcha_answer` delivers the held message.
async fn send_message(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Json(req): Json<SendMessage>,
) -> Result<Response, ServerError> {
    match state.broker.submit(&identity, req).await? {
        SendOutcome::Delivered(message) => Ok(ok(MessageResponse { message }).into_response()),
        SendOutcome::Challenged {
            captcha_id,
            question,
        } => Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ChallengeResponse {
                success: false,
                message: "captcha required",
                captcha_id,
                question,
            }),
        )
            .into_response()),
    }
}

async fn get_message(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(id): Path<MessageId>,
) -> Result<impl IntoResponse, ServerError> {
    let message = state.broker.get_message(&identity, id)?;
    Ok(ok(MessageResponse { message }))
}

async fn delete_message(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(id): Path<MessageId>,
) -> Result<impl IntoResponse, ServerError> {
    state.broker.delete_message(&identity, id).await?;
    info!(user = %identity.user_id, message = %id, "message deleted via API");
    Ok(ok(Done {}))
}

async fn view_room(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(room_id): Path<RoomId>,
) -> Result<impl IntoResponse, ServerError> {
    state.broker.record_view(&identity, Container::Room(room_id))?;
    Ok(ok(Done {}))
}

// ─── Forum ───

async fn list_sections(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<impl IntoResponse, ServerError> {
    let sections = state.broker.list_sections(&identity)?;
    Ok(ok(SectionsResponse { sections }))
}

async fn list_threads(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(section_id): Path<SectionId>,
) -> Result<impl IntoResponse, ServerError> {
    let threads = state.broker.list_threads(&identity, section_id)?;
    Ok(ok(ThreadsResponse { threads }))
}

async fn create_thread(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(section_id): Path<SectionId>,
    Json(req): Json<NewThreadRequest>,
) -> Result<Json<Success<ThreadView>>, ServerError> {
    let thread = state
        .broker
        .create_thread(&identity, section_id, &req.title, &req.content)?;
    Ok(ok(thread))
}

async fn view_section(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(section_id): Path<SectionId>,
) -> Result<impl IntoResponse, ServerError> {
    state
        .broker
        .record_view(&identity, Container::Section(section_id))?;
    Ok(ok(Done {}))
}

async fn get_thread(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(thread_id): Path<ThreadId>,
) -> Result<Json<Success<ThreadDetail>>, ServerError> {
    Ok(ok(state.broker.get_thread(&identity, thread_id)?))
}

async fn delete_thread(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(thread_id): Path<ThreadId>,
) -> Result<impl IntoResponse, ServerError> {
    state.broker.delete_thread(&identity, thread_id).await?;
    Ok(ok(Done {}))
}

async fn create_reply(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(thread_id): Path<ThreadId>,
    Json(req): Json<NewReplyRequest>,
) -> Result<Json<Success<ReplyView>>, ServerError> {
    Ok(ok(state
        .broker
        .create_reply(&identity, thread_id, &req.content)?))
}

async fn delete_reply(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(reply_id): Path<ReplyId>,
) -> Result<impl IntoResponse, ServerError> {
    state.broker.delete_reply(&identity, reply_id).await?;
    Ok(ok(Done {}))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use agora_store::{Database, NewUser};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::ServerConfig;

    fn app() -> (Router, String, RoomId) {
        let db = Database::open_in_memory().unwrap();
        db.seed_defaults().unwrap();
        let room = db.list_rooms().unwrap()[0].id;
        let alice = db.create_user(&NewUser::named("alice")).unwrap().id;
        db.set_permission(alice, Container::Room(room), "777").unwrap();
        let token = db.create_session(alice).unwrap();

        let broker = Broker::new(Arc::new(Mutex::new(db)), &ServerConfig::default());
        (build_router(AppState { broker }), token, room)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn authed(method: &str, uri: &str, token: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let (app, _, _) = app();
        let response = app
            .oneshot(Request::get("/api/chat/rooms").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn test_send_then_read_history() {
        let (app, token, room) = app();
        let send = serde_json::json!({ "room_id": room, "message": "hello <b>there</b>" });
        let response = app
            .clone()
            .oneshot(authed("POST", "/api/chat/send", &token, Body::from(send.to_string())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["message"]["content"], "hello there");

        let uri = format!("/api/chat/history?room_id={room}&page=last");
        let response = app
            .oneshot(authed("GET", &uri, &token, Body::empty()))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["total_pages"], 1);
        assert_eq!(json["messages"][0]["content"], "hello there");
    }

    #[tokio::test]
    async fn test_bad_token_is_unauthorized() {
        let (app, _, room) = app();
        let uri = format!("/api/chat/history?room_id={room}");
        let response = app
            .oneshot(authed("GET", &uri, "not-a-session", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_challenged_send_returns_429() {
        let (app, token, room) = app();
        for (i, expected) in [StatusCode::OK, StatusCode::TOO_MANY_REQUESTS].into_iter().enumerate() {
            let send = serde_json::json!({ "room_id": room, "message": format!("m{i}") });
            let response = app
                .clone()
                .oneshot(authed("POST", "/api/chat/send", &token, Body::from(send.to_string())))
                .await
                .unwrap();
            assert_eq!(response.status(), expected);
            if expected == StatusCode::TOO_MANY_REQUESTS {
                let json = body_json(response).await;
                assert!(json["captcha_id"].is_string());
                assert!(json["question"].as_str().unwrap().ends_with(" = ?"));
            }
        }
    }

    #[test]
    fn test_history_cursor() {
        let params = |page: Option<&str>, offset: Option<u32>| HistoryParams {
            page: page.map(str::to_string),
            offset,
            ..HistoryParams::default()
        };
        assert_eq!(params(Some("last"), None).cursor(), HistoryCursor::LastPage);
        assert_eq!(params(Some("2"), Some(9)).cursor(), HistoryCursor::Page(2));
        assert_eq!(params(Some("abc"), None).cursor(), HistoryCursor::Page(0));
        assert_eq!(params(None, Some(9)).cursor(), HistoryCursor::Offset(9));
    }
}
