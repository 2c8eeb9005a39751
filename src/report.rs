//! 执行总结报告
//!
//! 前端按 `||NEWLINE||` 拆行渲染；跳过项用 `||REASON||` 携带原因说明。
//! 这些分隔符是前端协议的一部分，不可改动。

use crate::core::AgentError;
use crate::page::{AppliedStep, SearchCondition};

const LINE_SEP: &str = "||NEWLINE||";
const REASON_SEP: &str = "||REASON||";

/// 成功路径的执行总结
pub fn execution_summary(
    condition: &SearchCondition,
    steps: &[AppliedStep],
    unmatched: &[(String, String)],
) -> String {
    let mut lines = vec!["EXECUTION_SUMMARY".to_string()];

    if let Some(keyword) = &condition.keyword {
        lines.push(format!("✅ 关键词：{}", keyword));
    }
    for entry in &condition.entries {
        lines.push(format!("✅ {}：{}", entry.field, entry.values.join("、")));
    }
    lines.push(format!("共执行 {} 步页面操作", steps.len()));
    for (field, label) in unmatched {
        lines.push(format!(
            "⚠️ {}：{}{}页面类目中未找到对应选项，已跳过",
            field, label, REASON_SEP
        ));
    }

    lines.join(LINE_SEP)
}

/// 工具阶段出错时的报告（会话保持可用）
pub fn error_report(err: &AgentError) -> String {
    let reason = match err {
        AgentError::ExtractionFailed(msg) => format!("页面结构无法识别：{}", msg),
        AgentError::ParseFailed(msg) => format!("模型输出无法解析：{}", msg),
        AgentError::ToolExecutionFailed(msg) => format!("页面操作失败（已重试）：{}", msg),
        other => other.to_string(),
    };
    [
        "EXECUTION_SUMMARY".to_string(),
        format!("❌ 本次检索未完成{}{}", REASON_SEP, reason),
        "会话仍可用，请调整条件后重试。".to_string(),
    ]
    .join(LINE_SEP)
}

/// 客户端断开导致取消时的报告
pub fn cancellation_report() -> String {
    [
        "EXECUTION_SUMMARY".to_string(),
        format!("⚠️ 检索已取消{}客户端断开连接，页面操作已中止", REASON_SEP),
    ]
    .join(LINE_SEP)
}
