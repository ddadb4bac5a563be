use crate::config::Config;
use crate::error::ApiError;
use crate::model::{Attachment, BookmarkKind, NotificationKind, NotificationRef};
use crate::notifications::NewNotification;
use crate::registry::Registry;
use crate::typing::TypingTracker;
use crate::{auth, conversations, db, delivery, messages, notifications, posts, social, users, ws};
use anyhow::Result;
use axum::{
    extract::{Extension, Path, Query, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use time::Duration as TimeDuration;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<SqliteConnectionManager>,
    pub registry: Arc<Registry>,
    pub typing: Arc<TypingTracker>,
    pub jwt_secret: Arc<Vec<u8>>,
    pub login_limiter: auth::LoginRateLimiter,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let pool = db::open_pool(config.data_dir.join("devconnect.db"))?;
        let conn = pool.get()?;
        let jwt_secret = auth::load_or_create_secret(&conn)?;
        drop(conn);
        Ok(Self {
            pool,
            registry: Arc::new(Registry::new()),
            typing: Arc::new(TypingTracker::new(Duration::from_millis(
                config.typing_debounce_ms,
            ))),
            jwt_secret: Arc::new(jwt_secret),
            login_limiter: auth::LoginRateLimiter::new(5, Duration::from_secs(60)),
            config,
        })
    }

    pub fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, ApiError> {
        Ok(self.pool.get()?)
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/me", get(me))
        .route("/api/users/:id", get(get_user))
        .route("/api/users/:id/follow", post(follow_user))
        .route("/api/users/:id/unfollow", post(unfollow_user))
        .route("/api/users/:id/followers", get(list_followers))
        .route("/api/users/:id/following", get(list_following))
        .route("/api/follow-requests/:id/accept", post(accept_follow_request))
        .route("/api/conversations", get(list_conversations).post(start_conversation))
        .route(
            "/api/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/conversations/:id/read", patch(mark_conversation_read))
        .route("/api/messages/:id", delete(delete_message))
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/:id/read", put(mark_notification_read))
        .route(
            "/api/notifications/mark/all-as-read",
            put(mark_all_notifications_read),
        )
        .route("/api/notifications/:id", delete(delete_notification))
        .route("/api/posts", get(list_posts).post(create_post))
        .route("/api/posts/:id", get(get_post))
        .route("/api/posts/:id/like", post(like_post))
        .route(
            "/api/posts/:id/comments",
            get(list_comments).post(add_comment),
        )
        .route("/api/endorsements", post(create_endorsement))
        .route("/api/endorsements/user/:id", get(list_endorsements))
        .route("/api/endorsements/:id", delete(delete_endorsement))
        .route("/api/bookmarks", get(list_bookmarks).post(create_bookmark))
        .route("/api/bookmarks/:id", delete(delete_bookmark))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    let ws_route = Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .merge(protected)
        .merge(ws_route)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: axum::http::Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if let Ok(claims) = auth::verify_jwt(&state.jwt_secret, token) {
                    req.extensions_mut().insert(claims);
                    return Ok(next.run(req).await);
                }
            }
        }
    }
    Err(StatusCode::UNAUTHORIZED)
}

#[derive(Deserialize)]
struct RegisterReq {
    username: String,
    display_name: String,
    password: String,
    #[serde(default)]
    skills: Vec<String>,
}

#[derive(serde::Serialize)]
struct AuthResp {
    token: String,
    user: crate::model::User,
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterReq>,
) -> Result<impl IntoResponse, ApiError> {
    if req.password.len() < 8 {
        return Err(ApiError::validation("password too short"));
    }
    let hash = auth::hash_password(&req.password)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let conn = state.conn()?;
    let user = users::create(&conn, &req.username, &req.display_name, &hash, &req.skills)?;
    let token = auth::issue_jwt(&state.jwt_secret, user.id, TimeDuration::hours(24))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((StatusCode::CREATED, Json(AuthResp { token, user })))
}

#[derive(Deserialize)]
struct LoginReq {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> Result<Response, ApiError> {
    if !state.login_limiter.check(&req.username).await {
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": "rate_limited" })),
        )
            .into_response());
    }
    let conn = state.conn()?;
    let found = users::credentials(&conn, &req.username)?;
    let (user, hash) = match found {
        Some(pair) => pair,
        None => {
            return Ok((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "invalid_credentials" })),
            )
                .into_response())
        }
    };
    if !auth::verify_password(&req.password, &hash) {
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid_credentials" })),
        )
            .into_response());
    }
    let token = auth::issue_jwt(&state.jwt_secret, user.id, TimeDuration::hours(24))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(AuthResp { token, user }).into_response())
}

async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let user = users::get(&conn, &claims.sub)?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok(Json(user))
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let user = users::get(&conn, &id)?.ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok(Json(user))
}

async fn follow_user(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    users::request_follow(&conn, &claims.sub, &id)?;
    notifications::dispatch(
        &conn,
        &state.registry,
        NewNotification {
            recipient_id: id,
            sender_id: claims.sub,
            kind: NotificationKind::FollowRequest,
            body: "sent you a follow request".into(),
            reference: Some(NotificationRef::User(claims.sub)),
        },
    );
    Ok(Json(serde_json::json!({ "message": "follow request sent" })))
}

async fn accept_follow_request(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    users::accept_follow(&conn, &claims.sub, &id)?;
    notifications::dispatch(
        &conn,
        &state.registry,
        NewNotification {
            recipient_id: id,
            sender_id: claims.sub,
            kind: NotificationKind::FollowAccepted,
            body: "accepted your follow request".into(),
            reference: Some(NotificationRef::User(claims.sub)),
        },
    );
    Ok(Json(serde_json::json!({ "message": "follow request accepted" })))
}

async fn unfollow_user(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    users::unfollow(&conn, &claims.sub, &id)?;
    Ok(Json(serde_json::json!({ "message": "unfollowed" })))
}

async fn list_followers(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    Ok(Json(users::followers(&conn, &id)?))
}

async fn list_following(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    Ok(Json(users::following(&conn, &id)?))
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    Ok(Json(conversations::list_for_user(&conn, &claims.sub)?))
}

#[derive(Deserialize)]
struct StartConversationReq {
    recipient_id: Uuid,
}

async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Json(req): Json<StartConversationReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let conversation = delivery::get_or_start_conversation(&conn, claims.sub, req.recipient_id)?;
    Ok(Json(conversation))
}

#[derive(Deserialize)]
struct ListMessagesQuery {
    limit: Option<usize>,
    before: Option<String>,
}

fn parse_cursor(raw: &str) -> Result<messages::Cursor, ApiError> {
    if let Ok(ts) = raw.parse::<i64>() {
        return Ok(messages::Cursor::Timestamp(ts));
    }
    Uuid::parse_str(raw)
        .map(messages::Cursor::Id)
        .map_err(|_| ApiError::validation("invalid before cursor"))
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let conversation = conversations::get(&conn, &id)?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;
    if !conversation.is_participant(&claims.sub) {
        return Err(ApiError::forbidden("not a participant of this conversation"));
    }
    let before = query.before.as_deref().map(parse_cursor).transpose()?;
    let limit = query.limit.unwrap_or(state.config.default_page_size);
    Ok(Json(messages::list(&conn, &id, before, limit)?))
}

#[derive(Deserialize)]
struct SendMessageReq {
    content: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let message = delivery::send_message(
        &conn,
        &state.registry,
        claims.sub,
        id,
        &req.content,
        &req.attachments,
        state.config.max_content_len,
    )?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_conversation_read(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let marked = delivery::mark_conversation_read(&conn, claims.sub, id)?;
    Ok(Json(serde_json::json!({ "marked": marked })))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    messages::delete(&conn, &id, &claims.sub)?;
    Ok(Json(serde_json::json!({ "message": "message deleted" })))
}

async fn list_notifications(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    Ok(Json(notifications::list_for(&conn, &claims.sub, 50)?))
}

async fn mark_notification_read(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    Ok(Json(notifications::mark_read(&conn, &id)?))
}

async fn mark_all_notifications_read(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let marked = notifications::mark_all_read(&conn, &claims.sub)?;
    Ok(Json(serde_json::json!({ "marked": marked })))
}

async fn delete_notification(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    notifications::delete(&conn, &id, &claims.sub)?;
    Ok(Json(serde_json::json!({ "message": "notification deleted" })))
}

#[derive(Deserialize)]
struct CreatePostReq {
    content: String,
}

async fn create_post(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Json(req): Json<CreatePostReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let post = posts::create(&conn, &claims.sub, &req.content, state.config.max_content_len)?;
    for mentioned in posts::scan_mentions(&conn, &claims.sub, &post.content)? {
        notifications::dispatch(
            &conn,
            &state.registry,
            NewNotification {
                recipient_id: mentioned,
                sender_id: claims.sub,
                kind: NotificationKind::Mention,
                body: "mentioned you in a post".into(),
                reference: Some(NotificationRef::Post(post.id)),
            },
        );
    }
    Ok((StatusCode::CREATED, Json(post)))
}

async fn list_posts(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    Ok(Json(posts::list(&conn, 50)?))
}

async fn get_post(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let post = posts::get(&conn, &id)?.ok_or_else(|| ApiError::not_found("post not found"))?;
    Ok(Json(post))
}

async fn like_post(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let post = posts::get(&conn, &id)?.ok_or_else(|| ApiError::not_found("post not found"))?;
    let (likes, is_liked) = posts::toggle_like(&conn, &id, &claims.sub)?;
    if is_liked && post.author_id != claims.sub {
        notifications::dispatch(
            &conn,
            &state.registry,
            NewNotification {
                recipient_id: post.author_id,
                sender_id: claims.sub,
                kind: NotificationKind::Like,
                body: "liked your post".into(),
                reference: Some(NotificationRef::Post(id)),
            },
        );
    }
    Ok(Json(serde_json::json!({ "likes": likes, "is_liked": is_liked })))
}

#[derive(Deserialize)]
struct AddCommentReq {
    content: String,
}

async fn add_comment(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddCommentReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let post = posts::get(&conn, &id)?.ok_or_else(|| ApiError::not_found("post not found"))?;
    let comment = posts::add_comment(&conn, &id, &claims.sub, &req.content, state.config.max_content_len)?;
    if post.author_id != claims.sub {
        notifications::dispatch(
            &conn,
            &state.registry,
            NewNotification {
                recipient_id: post.author_id,
                sender_id: claims.sub,
                kind: NotificationKind::Comment,
                body: "commented on your post".into(),
                reference: Some(NotificationRef::Post(id)),
            },
        );
    }
    for mentioned in posts::scan_mentions(&conn, &claims.sub, &comment.content)? {
        if mentioned != post.author_id {
            notifications::dispatch(
                &conn,
                &state.registry,
                NewNotification {
                    recipient_id: mentioned,
                    sender_id: claims.sub,
                    kind: NotificationKind::Mention,
                    body: "mentioned you in a comment".into(),
                    reference: Some(NotificationRef::Post(id)),
                },
            );
        }
    }
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn list_comments(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    Ok(Json(posts::list_comments(&conn, &id)?))
}

#[derive(Deserialize)]
struct CreateEndorsementReq {
    user_id: Uuid,
    skill: String,
    note: Option<String>,
}

async fn create_endorsement(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Json(req): Json<CreateEndorsementReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let endorsement = social::endorse(
        &conn,
        &claims.sub,
        &req.user_id,
        &req.skill,
        req.note.as_deref(),
    )?;
    notifications::dispatch(
        &conn,
        &state.registry,
        NewNotification {
            recipient_id: req.user_id,
            sender_id: claims.sub,
            kind: NotificationKind::Endorsement,
            body: format!("endorsed your skill: {}", endorsement.skill),
            reference: Some(NotificationRef::Endorsement(endorsement.id)),
        },
    );
    Ok((StatusCode::CREATED, Json(endorsement)))
}

async fn list_endorsements(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    Ok(Json(social::endorsements_for(&conn, &id)?))
}

async fn delete_endorsement(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    social::remove_endorsement(&conn, &id, &claims.sub)?;
    Ok(Json(serde_json::json!({ "message": "endorsement removed" })))
}

#[derive(Deserialize)]
struct CreateBookmarkReq {
    item_kind: BookmarkKind,
    item_id: Uuid,
    collection: Option<String>,
    notes: Option<String>,
}

async fn create_bookmark(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Json(req): Json<CreateBookmarkReq>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    let bookmark = social::add_bookmark(
        &conn,
        &claims.sub,
        req.item_kind,
        &req.item_id,
        req.collection.as_deref(),
        req.notes.as_deref(),
    )?;
    Ok((StatusCode::CREATED, Json(bookmark)))
}

#[derive(Deserialize)]
struct ListBookmarksQuery {
    collection: Option<String>,
}

async fn list_bookmarks(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Query(query): Query<ListBookmarksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    Ok(Json(social::bookmarks_for(
        &conn,
        &claims.sub,
        query.collection.as_deref(),
    )?))
}

async fn delete_bookmark(
    State(state): State<AppState>,
    Extension(claims): Extension<auth::Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.conn()?;
    social::remove_bookmark(&conn, &id, &claims.sub)?;
    Ok(Json(serde_json::json!({ "message": "bookmark removed" })))
}

/// Periodically prune read notifications past the retention window.
fn spawn_housekeeping(state: AppState) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tick.tick().await;
            let keep_days = state.config.notification_keep_days;
            match state.conn() {
                Ok(conn) => match notifications::prune_read(&conn, keep_days) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("pruned {n} read notifications"),
                    Err(err) => tracing::warn!("notification prune failed: {err}"),
                },
                Err(err) => tracing::warn!("notification prune skipped: {err}"),
            }
        }
    });
}

/// Run the HTTP server with the provided configuration.
pub async fn run_http_server(config: Config) -> Result<()> {
    let bind = config.bind.clone();
    let state = AppState::new(config).await?;
    spawn_housekeeping(state.clone());
    let addr: SocketAddr = bind.parse()?;
    tracing::info!("listening on {addr}");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}
