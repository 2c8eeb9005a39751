//! sift - 企业筛选智能体
//!
//! 把自然语言的企业筛选需求转成企业信息门户高级搜索页上的真实表单操作，
//! 全程以流式事件向前端汇报进度。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复策略、会话阶段状态机、编排器
//! - **driver**: 门户自动化驱动（headless_chrome 实现与脚本化实现）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、嵌入与重试
//! - **page**: 页面语义化（快照 → 字段选项森林）与类目树解析
//! - **parse**: LLM 结构化输出修复管线
//! - **report**: 执行总结报告
//! - **retrieval**: 知识库检索（向量 + 关键词混合）
//! - **router**: 知识路由（够不够、缺什么）
//! - **session**: 会话仓库与回合串行化
//! - **stream**: 会话事件流与前端帧协议
//! - **web**: HTTP 层（聊天 SSE、历史、取消、健康检查）

pub mod config;
pub mod core;
pub mod driver;
pub mod llm;
pub mod page;
pub mod parse;
pub mod report;
pub mod retrieval;
pub mod router;
pub mod session;
pub mod stream;
pub mod web;
