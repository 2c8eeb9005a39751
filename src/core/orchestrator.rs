//! 编排器：会话状态机的唯一推进者
//!
//! 每条用户消息走一遍固定的回合流程：思考循环（路由 → 可选检索，至多
//! max_think_turns 轮）→ 追问挂起或工具执行 → 回复 → 回到 Idle。
//! 会话闸锁保证同会话内回合串行；工具阶段在取消令牌下运行，
//! 无论成功、失败还是取消，门户句柄都会被关闭。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::{recovery_for, AgentError, RecoveryAction, SessionPhase};
use crate::driver::{PortalDriver, PortalHandle};
use crate::llm::{LlmClient, Message};
use crate::page::{
    extract, resolve, selection_schema_json, ConditionEntry, SearchCondition,
};
use crate::parse::repair;
use crate::report::{cancellation_report, error_report, execution_summary};
use crate::retrieval::KnowledgeStore;
use crate::router::{KnowledgeRouter, Route};
use crate::session::SessionCell;
use crate::stream::{EventStreamer, LogEvent};

/// 字段选择提示词：页面模型 + 目标 schema，要求标签逐字取自页面
const SELECTION_PROMPT: &str = r#"你是企业筛选助手。根据对话中用户的需求，从下面的页面筛选字段中选择要勾选的选项。

只输出一个 JSON 对象，键为字段名，值为该字段下要选中的选项标签（字符串或字符串数组）。
规则：
- 选项标签必须逐字取自页面字段清单，禁止自造或改写
- 层级树字段选最贴合需求的最深一层节点
- 自由文本搜索词放在键「关键词」下
- 页面上没有对应选项的需求维度直接省略该字段"#;

const EXHAUSTED_QUESTION: &str =
    "我还需要更多信息才能执行检索，请补充目标地区、注册资本门槛和具体行业方向。";

enum ToolEnd {
    Finished(Result<String, AgentError>),
    Cancelled,
}

/// 编排器，进程内唯一实例，被全部会话共享
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    knowledge: Arc<dyn KnowledgeStore>,
    driver: Arc<dyn PortalDriver>,
    router: KnowledgeRouter,
    max_think_turns: usize,
    max_context_turns: usize,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        knowledge: Arc<dyn KnowledgeStore>,
        driver: Arc<dyn PortalDriver>,
        max_think_turns: usize,
        max_context_turns: usize,
    ) -> Self {
        let router = KnowledgeRouter::new(Arc::clone(&llm));
        Self {
            llm,
            knowledge,
            driver,
            router,
            max_think_turns,
            max_context_turns,
        }
    }

    /// 处理一条用户消息，全部进度经 events 外送。
    /// 同会话并发调用在闸锁上排队，先到先处理。
    pub async fn handle_turn(&self, cell: Arc<SessionCell>, input: String, events: &EventStreamer) {
        let _turn = cell.gate.lock().await;

        let cancel = {
            let mut session = cell.state.write().await;
            if session.phase.is_terminal() {
                events.emit(LogEvent::Error {
                    text: "会话已失效（自动化驱动不可达），请新建会话。".to_string(),
                });
                return;
            }
            session.push_user(&input);
            session.pending_clarification = None;
            session.transition(SessionPhase::Thinking);
            session.new_cancel_token()
        };

        events.emit(LogEvent::Status {
            text: "正在分析请求…".to_string(),
        });

        // 思考循环：检索可以补充上下文并回到路由，但轮数有上限
        let mut extra_context: Vec<Message> = Vec::new();
        for think_turn in 0..self.max_think_turns {
            let mut history = cell.state.read().await.llm_messages(self.max_context_turns);
            history.extend(extra_context.iter().cloned());

            match self.router.route(&history).await {
                Route::Sufficient => {
                    tracing::debug!(think_turn, "router: sufficient, entering tool phase");
                    self.execute_tool(&cell, &history, events, &cancel).await;
                    return;
                }
                Route::NeedsKnowledge { topic } => {
                    cell.state
                        .write()
                        .await
                        .transition(SessionPhase::RetrievingKnowledge);
                    self.retrieve(&topic, &mut extra_context, events).await;
                    cell.state.write().await.transition(SessionPhase::Thinking);
                }
                Route::NeedsClarification { question } => {
                    self.suspend_for_clarification(&cell, question, events).await;
                    return;
                }
            }
        }

        // 轮数耗尽仍未充分：保守收口为一次追问
        tracing::warn!(max = self.max_think_turns, "think loop exhausted");
        self.suspend_for_clarification(&cell, EXHAUSTED_QUESTION.to_string(), events)
            .await;
    }

    /// 检索一轮知识并拼入上下文；失败降级为无检索继续
    async fn retrieve(
        &self,
        topic: &str,
        extra_context: &mut Vec<Message>,
        events: &EventStreamer,
    ) {
        events.emit(LogEvent::Status {
            text: format!("正在查阅资料：{}", topic),
        });
        match self.knowledge.search(topic).await {
            Ok(passages) if !passages.is_empty() => {
                let mut reference = String::from("参考资料（来自知识库，按相关度排序）：\n");
                for p in &passages {
                    events.emit(LogEvent::RetrievalHit {
                        preview: preview_text(&p.text, 120),
                    });
                    reference.push_str(&format!("[{}] {}\n", p.source, p.text));
                }
                extra_context.push(Message::system(reference));
            }
            Ok(_) => {
                extra_context.push(Message::system(
                    "知识库中没有相关资料。依据常识判断，仍不确定时向用户追问。",
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed, continuing without context");
                events.emit(LogEvent::LogLine {
                    text: "⚠️ 知识库暂不可用，跳过检索继续".to_string(),
                });
                extra_context.push(Message::system(
                    "知识库暂不可用。依据常识判断，仍不确定时向用户追问。",
                ));
            }
        }
    }

    /// 进入 AwaitingClarification 并把问题发给用户，回合在此挂起
    async fn suspend_for_clarification(
        &self,
        cell: &SessionCell,
        question: String,
        events: &EventStreamer,
    ) {
        let mut session = cell.state.write().await;
        session.transition(SessionPhase::AwaitingClarification);
        session.pending_clarification = Some(question.clone());
        session.push_agent(&question);
        events.emit(LogEvent::Text { chunk: question });
    }

    /// 工具阶段：打开门户 → 快照/提取 → 选择/解析 → 执行 → 截图 → 报告
    async fn execute_tool(
        &self,
        cell: &SessionCell,
        history: &[Message],
        events: &EventStreamer,
        cancel: &CancellationToken,
    ) {
        cell.state.write().await.transition(SessionPhase::ExecutingTool);
        events.emit(LogEvent::ToolStart {
            name: "高级搜索".to_string(),
        });
        events.emit(LogEvent::Status {
            text: "正在打开门户页面…".to_string(),
        });

        let mut handle = match self.driver.open().await {
            Ok(h) => h,
            Err(e) => {
                self.handle_tool_error(cell, e, events).await;
                return;
            }
        };

        let end = tokio::select! {
            _ = cancel.cancelled() => ToolEnd::Cancelled,
            result = self.drive_search(handle.as_mut(), history, events) => ToolEnd::Finished(result),
        };
        // 句柄在任何出口都要关闭
        handle.close().await;

        match end {
            ToolEnd::Finished(Ok(report)) => {
                events.emit(LogEvent::FinalReport {
                    text: report.clone(),
                });
                self.respond(cell, report).await;
            }
            ToolEnd::Finished(Err(e)) => {
                self.handle_tool_error(cell, e, events).await;
            }
            ToolEnd::Cancelled => {
                tracing::info!("tool phase cancelled");
                let report = cancellation_report();
                events.emit(LogEvent::FinalReport {
                    text: report.clone(),
                });
                self.respond(cell, report).await;
            }
        }
    }

    /// 错误收口：驱动不可达打入 Failed，其余生成错误报告并保持会话可用
    async fn handle_tool_error(&self, cell: &SessionCell, err: AgentError, events: &EventStreamer) {
        tracing::error!(error = %err, "tool phase failed");
        match recovery_for(&err) {
            RecoveryAction::FailSession => {
                cell.state.write().await.transition(SessionPhase::Failed);
                events.emit(LogEvent::Error {
                    text: format!("自动化驱动不可达，会话已终止：{}", err),
                });
            }
            _ => {
                events.emit(LogEvent::Error {
                    text: err.to_string(),
                });
                let report = error_report(&err);
                events.emit(LogEvent::FinalReport {
                    text: report.clone(),
                });
                self.respond(cell, report).await;
            }
        }
    }

    /// Responding → Idle，并把报告记入对话历史
    async fn respond(&self, cell: &SessionCell, report: String) {
        let mut session = cell.state.write().await;
        session.transition(SessionPhase::Responding);
        session.push_agent(report);
        session.transition(SessionPhase::Idle);
    }

    /// 工具阶段主体，任何一步出错直接向上抛
    async fn drive_search(
        &self,
        handle: &mut dyn PortalHandle,
        history: &[Message],
        events: &EventStreamer,
    ) -> Result<String, AgentError> {
        events.emit(LogEvent::Status {
            text: "正在读取页面结构…".to_string(),
        });
        let snapshot = handle.snapshot().await?;
        let mut model = extract(&snapshot)?;
        events.emit(LogEvent::Thinking {
            text: format!("已识别 {} 个筛选字段，正在匹配需求…", model.fields.len()),
        });

        // 字段选择
        let mut messages = vec![Message::system(format!(
            "{}\n\n页面字段清单：\n{}\n输出须符合的 JSON Schema：\n{}",
            SELECTION_PROMPT,
            model.to_prompt_text(),
            selection_schema_json()
        ))];
        messages.extend(history.iter().cloned());
        let raw = self
            .llm
            .complete(&messages)
            .await
            .map_err(AgentError::LlmError)?;
        let proposed = repair(&raw)?;

        // 逐字段解析，树字段做深者优先互斥
        let mut condition = SearchCondition::default();
        let mut unmatched: Vec<(String, String)> = Vec::new();
        for field in &mut model.fields {
            let labels = proposed.labels(&field.name);
            if labels.is_empty() {
                continue;
            }
            let resolution = resolve(&mut field.forest, labels);
            for label in resolution.unmatched {
                unmatched.push((field.name.clone(), label));
            }
            for &id in &resolution.excluded {
                tracing::debug!(
                    field = %field.name,
                    label = %field.forest.node(id).label,
                    "ancestor superseded by deeper selection"
                );
            }
            let values: Vec<String> = resolution
                .selected
                .iter()
                .map(|&id| field.forest.node(id).label.clone())
                .collect();
            if !values.is_empty() {
                condition.entries.push(ConditionEntry {
                    field: field.name.clone(),
                    values,
                });
            }
        }
        condition.keyword = proposed.labels("关键词").first().cloned();

        if condition.is_empty() {
            return Err(AgentError::ParseFailed(
                "模型未给出任何可执行的筛选条件".to_string(),
            ));
        }

        events.emit(LogEvent::Status {
            text: "正在页面上执行筛选…".to_string(),
        });
        let steps = match handle.apply(&condition).await {
            Ok(steps) => steps,
            // 表单操作失败重试一次，再失败上报
            Err(AgentError::ToolExecutionFailed(first)) => {
                tracing::warn!(error = %first, "apply failed, retrying once");
                events.emit(LogEvent::LogLine {
                    text: "⚠️ 页面操作失败，正在重试…".to_string(),
                });
                handle.apply(&condition).await?
            }
            Err(e) => return Err(e),
        };
        for step in &steps {
            events.emit(LogEvent::LogLine {
                text: format!("✔ {}：{}", step.field, step.detail),
            });
        }

        // 截图失败只降级，不影响报告
        match handle.screenshot().await {
            Ok(image_base64) => {
                events.emit(LogEvent::Screenshot { image_base64 });
            }
            Err(e) => tracing::warn!(error = %e, "screenshot failed, skipping"),
        }

        Ok(execution_summary(&condition, &steps, &unmatched))
    }
}

fn preview_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
