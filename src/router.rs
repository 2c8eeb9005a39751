//! 知识路由：逐轮判定「信息够不够、缺什么」
//!
//! 纯分类步骤，除决策外无副作用；返回的分支唯一决定编排器的下一个转移。
//! 判定必须保守：被请求的实体（地区、资金门槛、行业）缺失或互相矛盾时，
//! 宁可追问一轮，也不触发一次昂贵的完整工具调用。

use std::sync::Arc;

use serde::Deserialize;

use crate::llm::{LlmClient, Message};
use crate::parse::repair_value;

/// 路由决策
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// 三要素齐备，可以进入工具执行
    Sufficient,
    /// 缺门户/领域背景知识，先检索
    NeedsKnowledge { topic: String },
    /// 请求有歧义或要素缺失，向用户追问
    NeedsClarification { question: String },
}

const CLASSIFIER_PROMPT: &str = r#"你是企业筛选助手的决策器。用户想在企业信息门户上执行一次高级搜索。
根据对话判断当前信息是否足以填写搜索表单。完整的请求通常包含三类要素：
地区（省/市）、资金门槛（如注册资本下限）、行业或产品关键词。

只输出一个 JSON 对象，不要任何解释：
{"decision": "sufficient" | "needs_knowledge" | "needs_clarification",
 "topic": "需要检索的知识主题（仅 needs_knowledge 时）",
 "question": "向用户追问的问题（仅 needs_clarification 时）"}

规则：
- 三要素齐备且无矛盾 → sufficient
- 对门户字段口径/行业类目归属不确定，查资料能解决 → needs_knowledge
- 要素缺失、含糊或互相矛盾 → needs_clarification（宁可追问，不要猜测）"#;

#[derive(Deserialize)]
struct Decision {
    decision: String,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    question: Option<String>,
}

const DEFAULT_QUESTION: &str =
    "请补充筛选条件：目标地区、注册资本门槛，以及具体行业或产品方向。";

/// 路由器：快速规则在前，LLM 分类在后
pub struct KnowledgeRouter {
    llm: Arc<dyn LlmClient>,
}

impl KnowledgeRouter {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 对当前对话做一次路由判定
    pub async fn route(&self, history: &[Message]) -> Route {
        if let Some(route) = self.fast_match(history) {
            return route;
        }
        self.llm_route(history).await
    }

    /// 快速规则：只拦显然无法行动的输入（寒暄/空请求），其余交给 LLM
    fn fast_match(&self, history: &[Message]) -> Option<Route> {
        let last_user = history
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::llm::Role::User))?;
        let text = last_user.content.trim();
        let greeting = ["你好", "hi", "hello", "在吗", "您好"]
            .iter()
            .any(|g| text.eq_ignore_ascii_case(g));
        if greeting || text.chars().count() < 4 {
            return Some(Route::NeedsClarification {
                question: DEFAULT_QUESTION.to_string(),
            });
        }
        None
    }

    async fn llm_route(&self, history: &[Message]) -> Route {
        let mut messages = vec![Message::system(CLASSIFIER_PROMPT)];
        messages.extend(history.iter().cloned());

        let raw = match self.llm.complete(&messages).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "router LLM call failed, asking for clarification");
                return Route::NeedsClarification {
                    question: DEFAULT_QUESTION.to_string(),
                };
            }
        };

        let decision: Option<Decision> = repair_value(&raw)
            .ok()
            .and_then(|v| serde_json::from_value(v).ok());

        match decision {
            Some(d) => match d.decision.as_str() {
                "sufficient" => Route::Sufficient,
                "needs_knowledge" => Route::NeedsKnowledge {
                    topic: d
                        .topic
                        .filter(|t| !t.trim().is_empty())
                        .unwrap_or_else(|| "企业筛选门户字段说明".to_string()),
                },
                "needs_clarification" => Route::NeedsClarification {
                    question: d
                        .question
                        .filter(|q| !q.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_QUESTION.to_string()),
                },
                other => {
                    tracing::warn!(decision = %other, "unknown router decision, degrading");
                    Route::NeedsClarification {
                        question: DEFAULT_QUESTION.to_string(),
                    }
                }
            },
            // 解析失败同样保守处理
            None => Route::NeedsClarification {
                question: DEFAULT_QUESTION.to_string(),
            },
        }
    }
}
