//! 事件流：会话内有序、带界缓冲的进度事件
//!
//! 每回合一条有界 mpsc 通道；emit 用 try_send，缓冲写满时丢弃事件并计数，
//! 绝不让编排器阻塞在慢消费者上。序号计数器归会话持有，同一会话的
//! 各回合流接力使用，序号在会话内严格递增；订阅端按序收取，每个事件
//! 至多投递一次。帧标记由前端逐字消费，不可改动。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

/// 流结束哨兵，随最后一帧之后发出
pub const END_OF_STREAM: &str = "---END_OF_STREAM---";

/// 编排器活动事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    /// 阶段性状态（「正在打开门户…」）
    Status { text: String },
    /// LLM 思考内容
    Thinking { text: String },
    /// 知识库命中预览
    RetrievalHit { preview: String },
    /// 面向用户的文本回复（累积分片，接收端拼接）
    Text { chunk: String },
    /// 工具执行开始
    ToolStart { name: String },
    /// 工具执行过程中的单步日志
    LogLine { text: String },
    /// 整页截图（base64 PNG）
    Screenshot { image_base64: String },
    /// 执行总结报告
    FinalReport { text: String },
    Error { text: String },
}

impl LogEvent {
    /// 渲染为前端逐字消费的文本帧
    pub fn frame(&self) -> String {
        match self {
            LogEvent::Status { text } => format!("[STATUS_MSG]{}", text),
            LogEvent::Thinking { text } => format!("[Thinking]{}", text),
            LogEvent::RetrievalHit { preview } => format!("[RAG_HIT]{}", preview),
            LogEvent::Text { chunk } => format!("[TEXT_RESPONSE]{}", chunk),
            LogEvent::ToolStart { name } => format!("[STATUS_MSG]🚀 开始执行：{}", name),
            LogEvent::LogLine { text } => text.clone(),
            LogEvent::Screenshot { image_base64 } => format!("[SCREENSHOT]{}", image_base64),
            LogEvent::FinalReport { text } => format!("[FINAL_REPORT]{}", text),
            LogEvent::Error { text } => format!("[STATUS_MSG]❌ {}", text),
        }
    }
}

/// 带会话内序号的事件
#[derive(Debug, Clone, Serialize)]
pub struct SequencedEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: LogEvent,
}

/// 发送端：编排器持有
pub struct EventStreamer {
    tx: mpsc::Sender<SequencedEvent>,
    /// 会话级序号计数器，跨回合共享
    seq: Arc<AtomicU64>,
    dropped: AtomicU64,
}

/// 订阅端：HTTP 层持有
pub struct EventStream {
    rx: mpsc::Receiver<SequencedEvent>,
}

impl EventStreamer {
    /// 建立一对（发送端, 订阅端），序号从零起（独立计数器）
    pub fn channel(capacity: usize) -> (EventStreamer, EventStream) {
        Self::channel_with_counter(capacity, Arc::new(AtomicU64::new(0)))
    }

    /// 建立一对（发送端, 订阅端），接力会话持有的序号计数器
    pub fn channel_with_counter(
        capacity: usize,
        seq: Arc<AtomicU64>,
    ) -> (EventStreamer, EventStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            EventStreamer {
                tx,
                seq,
                dropped: AtomicU64::new(0),
            },
            EventStream { rx },
        )
    }

    /// 发出一个事件，返回其序号；缓冲已满或订阅端已断开时丢弃并计数
    pub fn emit(&self, event: LogEvent) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(e) = self.tx.try_send(SequencedEvent { seq, event }) {
            let total = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!(seq, dropped_total = total, error = %e, "event dropped");
        }
        seq
    }

    /// 累计丢弃事件数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<SequencedEvent> {
        self.rx.recv().await
    }

    pub fn into_inner(self) -> mpsc::Receiver<SequencedEvent> {
        self.rx
    }
}
