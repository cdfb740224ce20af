//! PeerDrop 信令服务
//!
//! 只负责会话和信令消息的中转，不接触文件内容。会话保存在内存里，
//! 过期后由后台任务清理。

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use peerdrop_core::rendezvous::{
    CreateSessionRequest, CreateSessionResponse, PublishSignalRequest, SessionInfo, SignalQuery,
};
use peerdrop_core::{FileMetadata, SessionStore};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;

/// 共享的会话表
#[derive(Clone)]
pub struct AppState {
    store: Arc<Mutex<SessionStore>>,
}

impl AppState {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 清理过期会话，返回剩余会话数
    pub fn purge_expired(&self) -> usize {
        let mut store = self.lock();
        store.purge_expired();
        store.len()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/session", post(create_session))
        .route("/session/:code", get(get_session).delete(close_session))
        .route("/signal", post(publish_signal))
        .route("/signal/:code", get(fetch_signals))
        .with_state(state)
}

/// 绑定地址并在后台运行服务，返回实际监听地址
pub async fn spawn(addr: SocketAddr, state: AppState) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let app = router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Rendezvous server stopped: {}", e);
        }
    });
    Ok(local)
}

/// 定期清理过期会话
pub async fn run_purge_loop(state: AppState, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let remaining = state.purge_expired();
        tracing::debug!("Purged expired sessions, {} remaining", remaining);
    }
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    if request.file_size == 0 {
        return (StatusCode::BAD_REQUEST, "file must not be empty").into_response();
    }

    let file = FileMetadata::new(request.file_name, request.file_size, request.file_type);
    let session = state.lock().create(file);
    tracing::info!(
        "Session {} opened for '{}' ({} bytes)",
        session.code,
        session.file.name,
        session.file.size
    );

    Json(CreateSessionResponse {
        session_code: session.code,
        transport_config: session.transport,
        created_at: session.created_at,
    })
    .into_response()
}

async fn get_session(State(state): State<AppState>, Path(code): Path<String>) -> impl IntoResponse {
    match state.lock().get(&code) {
        Some(session) => Json(SessionInfo {
            file_metadata: session.file,
            transport_config: session.transport,
            created_at: session.created_at,
        })
        .into_response(),
        None => (StatusCode::NOT_FOUND, "session not found").into_response(),
    }
}

async fn close_session(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    if state.lock().remove(&code) {
        tracing::info!("Session {} closed", code);
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn publish_signal(
    State(state): State<AppState>,
    Json(request): Json<PublishSignalRequest>,
) -> impl IntoResponse {
    let code = request.session_code.clone();
    let role = request.role;
    let message = request.into_message();
    tracing::debug!(
        "Signal {:?} (attempt {}) from {} in {}",
        message.kind,
        message.attempt,
        role,
        code
    );

    if state.lock().publish(&code, role, message) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn fetch_signals(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<SignalQuery>,
) -> impl IntoResponse {
    match state.lock().drain(&code, query.role) {
        Some(messages) => Json(messages).into_response(),
        None => (StatusCode::NOT_FOUND, "session not found").into_response(),
    }
}
