//! Agent 错误类型与处理策略
//!
//! 与编排器配合：根据 AgentError 决定 ReportAndRespond / RetryAction / DegradeAndContinue 等。
//! 只有自动化驱动不可达会把会话打入 Failed，其余错误都回落为一条用户可见的回复。

use thiserror::Error;

/// Agent 运行过程中可能出现的错误（提取、解析、表单操作、检索、会话等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 页面结构无法识别（筛选表单容器缺失等），工具阶段中止
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    /// 结构化输出修复管线耗尽，同一原始输出不再重试
    #[error("Parse failed after repair: {0}")]
    ParseFailed(String),

    /// 表单操作失败（点击/输入/确认），同一动作重试一次后上报
    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    /// 知识库检索失败：降级为无检索上下文继续，不致命
    #[error("Retrieval failed: {0}")]
    RetrievalFailed(String),

    /// 调用方引用了不存在或已过期的会话
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 自动化驱动不可达（浏览器无法启动/连接），会话进入 Failed
    #[error("Automation driver unreachable: {0}")]
    DriverUnreachable(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

/// 编排器对各类错误的处理动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 生成错误报告并进入 Responding，会话保持可用
    ReportAndRespond,
    /// 对同一动作重试一次，再失败则上报
    RetryAction,
    /// 降级继续（如无检索上下文），记一条警告事件
    DegradeAndContinue,
    /// 会话不可用，进入 Failed
    FailSession,
    /// 直接回给调用方（如 404），不进编排循环
    SurfaceToClient,
}

/// 错误到处理动作的映射
pub fn recovery_for(err: &AgentError) -> RecoveryAction {
    match err {
        AgentError::ExtractionFailed(_) => RecoveryAction::ReportAndRespond,
        AgentError::ParseFailed(_) => RecoveryAction::ReportAndRespond,
        AgentError::ToolExecutionFailed(_) => RecoveryAction::RetryAction,
        AgentError::RetrievalFailed(_) => RecoveryAction::DegradeAndContinue,
        AgentError::SessionNotFound(_) => RecoveryAction::SurfaceToClient,
        AgentError::DriverUnreachable(_) => RecoveryAction::FailSession,
        AgentError::LlmError(_) => RecoveryAction::ReportAndRespond,
        AgentError::ConfigError(_) => RecoveryAction::ReportAndRespond,
    }
}
