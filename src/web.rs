//! HTTP 层：聊天 SSE 流、会话历史、取消与健康检查
//!
//! POST /api/chat 是唯一入口：消息交给编排器后台处理，HTTP 响应是一条
//! SSE 流，把进度事件逐帧推给前端，最后以哨兵帧收尾。客户端断开时
//! 响应体被丢弃，守卫随即取消在途的工具阶段。

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::stream;
use serde::Deserialize;
use serde_json::json;

use crate::core::Orchestrator;
use crate::session::{SessionCell, SessionStore};
use crate::stream::{EventStream, EventStreamer, END_OF_STREAM};

/// 各路由共享的应用状态
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub orchestrator: Arc<Orchestrator>,
    /// 每会话事件缓冲容量
    pub buffer_size: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/sessions/:id/history", get(history))
        .route("/api/sessions/:id/cancel", post(cancel))
        .route("/api/health", get(health))
        .with_state(state)
}

#[derive(Deserialize)]
struct ChatRequest {
    /// 调用方生成的不透明会话 id，首次出现即创建会话；缺省则服务端生成，
    /// 经 `x-session-id` 响应头返还
    session_id: Option<String>,
    message: String,
}

/// 客户端断开（响应体未读完就被丢弃）时取消在途工具阶段
struct DisconnectGuard {
    cell: Arc<SessionCell>,
    finished: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let cell = Arc::clone(&self.cell);
        tracing::info!("client disconnected, cancelling in-flight tool phase");
        tokio::spawn(async move {
            cell.state.write().await.cancel();
        });
    }
}

enum SseState {
    Open(EventStream, DisconnectGuard),
    Ended(DisconnectGuard),
}

fn sse_frame(payload: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", payload))
}

async fn chat(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> Response {
    let session_id = req
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let cell = state.store.get_or_create(&session_id).await;

    // 序号计数器归会话所有：跨回合接力，会话内严格递增
    let (streamer, events) =
        EventStreamer::channel_with_counter(state.buffer_size, Arc::clone(&cell.seq));
    let orchestrator = Arc::clone(&state.orchestrator);
    let worker_cell = Arc::clone(&cell);
    tokio::spawn(async move {
        orchestrator
            .handle_turn(worker_cell, req.message, &streamer)
            .await;
    });

    let guard = DisconnectGuard {
        cell,
        finished: false,
    };
    let body = stream::unfold(SseState::Open(events, guard), |sse| async move {
        match sse {
            SseState::Open(mut events, guard) => match events.recv().await {
                Some(ev) => Some((
                    Ok::<_, std::convert::Infallible>(sse_frame(&ev.event.frame())),
                    SseState::Open(events, guard),
                )),
                // 通道关闭即回合结束，补发哨兵帧
                None => Some((Ok(sse_frame(END_OF_STREAM)), SseState::Ended(guard))),
            },
            SseState::Ended(mut guard) => {
                guard.finished = true;
                None
            }
        }
    });

    let mut response = (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response();
    if let Ok(value) = header::HeaderValue::from_str(&session_id) {
        response.headers_mut().insert("x-session-id", value);
    }
    response
}

async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let cell = state
        .store
        .get(&id)
        .await
        .map_err(|e| not_found(&e.to_string()))?;
    let session = cell.state.read().await;
    Ok(Json(json!({
        "session_id": session.id,
        "phase": session.phase,
        "pending_clarification": session.pending_clarification,
        "turns": session.turns,
    })))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let cell = state
        .store
        .get(&id)
        .await
        .map_err(|e| not_found(&e.to_string()))?;
    cell.state.write().await.cancel();
    Ok(Json(json!({ "cancelled": true })))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "active_sessions": state.store.active_count().await,
    }))
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockPortalDriver;
    use crate::driver::PortalDriver;
    use crate::llm::{LlmClient, MockLlmClient};
    use crate::retrieval::{KnowledgeStore, VectorKnowledgeBase};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_app(responses: Vec<&str>) -> Router {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(responses));
        let knowledge: Arc<dyn KnowledgeStore> =
            Arc::new(VectorKnowledgeBase::new(None, 3, 0.5, 500, 50));
        let driver: Arc<dyn PortalDriver> = Arc::new(MockPortalDriver::with_default_form());
        let state = Arc::new(AppState {
            store: Arc::new(SessionStore::new(Duration::from_secs(3600))),
            orchestrator: Arc::new(Orchestrator::new(llm, knowledge, driver, 5, 20)),
            buffer_size: 64,
        });
        router(state)
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = test_app(vec![]);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("\"ok\""));
    }

    #[tokio::test]
    async fn test_unknown_session_history_is_404() {
        let app = test_app(vec![]);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/nope/history")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_session_cancel_is_404() {
        let app = test_app(vec![]);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sessions/nope/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_chat_streams_frames_and_sentinel() {
        let app = test_app(vec![
            r#"{"decision": "needs_clarification", "question": "请问目标地区是？"}"#,
        ]);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"session_id": "s-1", "message": "找一些做汽车玻璃的公司"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let text = body_text(response).await;
        assert!(text.contains("data: [STATUS_MSG]"));
        assert!(text.contains("data: [TEXT_RESPONSE]请问目标地区是？"));
        assert!(text.ends_with("data: ---END_OF_STREAM---\n\n"));
    }

    #[tokio::test]
    async fn test_omitted_session_id_is_generated_and_returned() {
        let app = test_app(vec![
            r#"{"decision": "needs_clarification", "question": "请补充条件"}"#,
        ]);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"message": "找一些做汽车玻璃的公司"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let id = response
            .headers()
            .get("x-session-id")
            .expect("generated session id header")
            .to_str()
            .unwrap()
            .to_string();
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn test_chat_then_history_round_trip() {
        let app = test_app(vec![
            r#"{"decision": "needs_clarification", "question": "请补充注册资本门槛"}"#,
        ]);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"session_id": "s-2", "message": "帮我筛选汽车行业企业"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        // 读完整条流，确保回合已结束
        let _ = body_text(response).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/s-2/history")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("帮我筛选汽车行业企业"));
        assert!(text.contains("awaiting_clarification"));
    }
}
