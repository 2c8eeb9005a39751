//! 会话管理
//!
//! 显式会话仓库持有全部生命周期（无进程级可变单例）：按调用方给定的
//! 不透明 id 建会话，闲置超时由后台清扫回收。每会话一把处理闸锁，
//! 工具执行期间到达的新用户消息在闸上排队，绝不交错执行。

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, SessionPhase};
use crate::llm::Message;

/// 回合角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Agent,
}

/// 单个回合，追加后不可变
#[derive(Clone, Debug, Serialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// 单个会话
pub struct Session {
    pub id: String,
    pub turns: Vec<Turn>,
    pub phase: SessionPhase,
    /// 待回答的澄清问题；下一条用户消息即视为回答
    pub pending_clarification: Option<String>,
    /// 当前工具阶段的取消令牌
    pub cancel_token: Option<CancellationToken>,
    pub last_active: Instant,
    pub created_at: Instant,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            turns: Vec::new(),
            phase: SessionPhase::Idle,
            pending_clarification: None,
            cancel_token: None,
            last_active: Instant::now(),
            created_at: Instant::now(),
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(TurnRole::User, text);
    }

    pub fn push_agent(&mut self, text: impl Into<String>) {
        self.push(TurnRole::Agent, text);
    }

    fn push(&mut self, role: TurnRole, text: impl Into<String>) {
        self.turns.push(Turn {
            role,
            text: text.into(),
            at: Utc::now(),
        });
        self.last_active = Instant::now();
    }

    /// 阶段转移；非法转移只告警不中断（状态表本身已有测试守护）
    pub fn transition(&mut self, next: SessionPhase) {
        if !self.phase.can_transition_to(next) {
            tracing::warn!(from = ?self.phase, to = ?next, session = %self.id, "illegal phase transition");
        }
        self.phase = next;
        self.last_active = Instant::now();
    }

    /// 为新的工具阶段创建取消令牌（旧令牌一并取消）
    pub fn new_cancel_token(&mut self) -> CancellationToken {
        self.cancel();
        let token = CancellationToken::new();
        self.cancel_token = Some(token.clone());
        token
    }

    /// 取消当前工具阶段
    pub fn cancel(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }

    /// 把最近 max_turns 轮对话转成 LLM 消息
    pub fn llm_messages(&self, max_turns: usize) -> Vec<Message> {
        let skip = self.turns.len().saturating_sub(max_turns * 2);
        self.turns[skip..]
            .iter()
            .map(|t| match t.role {
                TurnRole::User => Message::user(t.text.clone()),
                TurnRole::Agent => Message::assistant(t.text.clone()),
            })
            .collect()
    }
}

/// 会话 + 处理闸：闸锁住期间即「有一个在途工具调用」
pub struct SessionCell {
    pub state: RwLock<Session>,
    /// 回合处理串行化：持锁者独占整条思考→执行→回复链路
    pub gate: Mutex<()>,
    /// 事件序号计数器，各回合的事件流接力使用，会话内严格递增
    pub seq: Arc<AtomicU64>,
}

/// 会话仓库
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<SessionCell>>>,
    timeout: Duration,
}

impl SessionStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// 获取或创建会话（首条用户消息即创建）
    pub async fn get_or_create(&self, id: &str) -> Arc<SessionCell> {
        if let Some(cell) = self.sessions.read().await.get(id) {
            return Arc::clone(cell);
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(id.to_string()).or_insert_with(|| {
            tracing::info!(session = %id, "session created");
            Arc::new(SessionCell {
                state: RwLock::new(Session::new(id)),
                gate: Mutex::new(()),
                seq: Arc::new(AtomicU64::new(0)),
            })
        }))
    }

    /// 获取已有会话；不存在即 SessionNotFound（直接回给调用方）
    pub async fn get(&self, id: &str) -> Result<Arc<SessionCell>, AgentError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))
    }

    /// 清理过期会话（在途回合的会话跳过），返回清理数
    pub async fn cleanup_expired(&self) -> usize {
        let mut expired = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, cell) in sessions.iter() {
                if cell.gate.try_lock().is_err() {
                    continue;
                }
                if cell.state.read().await.is_expired(self.timeout) {
                    expired.push(id.clone());
                }
            }
        }
        let mut sessions = self.sessions.write().await;
        for id in &expired {
            sessions.remove(id);
            tracing::info!(session = %id, "session expired");
        }
        expired.len()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = SessionStore::new(Duration::from_secs(3600));
        let a = store.get_or_create("s-1").await;
        let b = store.get_or_create("s-1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let store = SessionStore::new(Duration::from_secs(3600));
        assert!(matches!(
            store.get("missing").await,
            Err(AgentError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_sessions_are_swept() {
        let store = SessionStore::new(Duration::from_secs(0));
        store.get_or_create("old").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.cleanup_expired().await, 1);
        assert_eq!(store.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_in_flight_sessions_survive_sweep() {
        let store = SessionStore::new(Duration::from_secs(0));
        let cell = store.get_or_create("busy").await;
        let _guard = cell.gate.lock().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.cleanup_expired().await, 0);
        assert_eq!(store.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_turns_queue_on_the_gate() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let store = SessionStore::new(Duration::from_secs(3600));
        let cell = store.get_or_create("s").await;
        let order = Arc::new(AtomicUsize::new(0));

        let first = cell.gate.lock().await;
        let cell2 = Arc::clone(&cell);
        let order2 = Arc::clone(&order);
        let queued = tokio::spawn(async move {
            let _g = cell2.gate.lock().await;
            order2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::task::yield_now().await;
        assert_eq!(order.load(Ordering::SeqCst), 0);
        drop(first);
        queued.await.unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_turns_serialize_for_history_endpoint() {
        let mut s = Session::new("s");
        s.push_user("你好");
        let json = serde_json::to_value(&s.turns).expect("turns serialize");
        assert_eq!(json[0]["role"], "user");
        assert_eq!(json[0]["text"], "你好");
        // 时间戳以 RFC 3339 字符串入历史响应
        assert!(json[0]["at"].is_string());
    }

    #[test]
    fn test_llm_messages_keeps_recent_turns() {
        let mut s = Session::new("s");
        for i in 0..10 {
            s.push_user(format!("u{}", i));
            s.push_agent(format!("a{}", i));
        }
        let msgs = s.llm_messages(2);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].content, "u8");
    }
}
