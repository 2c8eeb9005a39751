//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SIFT__*` 覆盖（双下划线表示嵌套，如 `SIFT__LLM__MODEL=gpt-4o`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub server: ServerSection,
    pub llm: LlmSection,
    pub portal: PortalSection,
    pub retrieval: RetrievalSection,
    pub stream: StreamSection,
    pub session: SessionSection,
}

/// [app] 段：思考轮数与上下文上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 单条用户消息允许的思考循环次数（路由→检索→再路由）
    pub max_think_turns: usize,
    /// 送入 LLM 的对话历史保留轮数
    pub max_context_turns: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_think_turns: 5,
            max_context_turns: 20,
        }
    }
}

/// [server] 段：HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

/// [llm] 段：OpenAI 兼容端点与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: Option<String>,
    pub embedding_model: String,
    /// LLM 调用最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 指数退避基数（秒）
    pub backoff_base_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            embedding_model: "text-embedding-3-small".to_string(),
            max_attempts: 3,
            backoff_base_secs: 2,
        }
    }
}

/// [portal] 段：目标门户
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortalSection {
    /// 高级搜索页 URL
    pub url: String,
    /// 单次页面动作超时（秒）
    pub action_timeout_secs: u64,
}

impl Default for PortalSection {
    fn default() -> Self {
        Self {
            url: "https://www.qcc.com/web/search/advance".to_string(),
            action_timeout_secs: 30,
        }
    }
}

/// [retrieval] 段：知识库检索参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    /// 知识文档目录（.txt/.md），未设置则知识库为空
    pub knowledge_dir: Option<PathBuf>,
    pub top_k: usize,
    /// 低于该相似度的段落不返回
    pub score_threshold: f32,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            knowledge_dir: None,
            top_k: 3,
            score_threshold: 0.5,
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

/// [stream] 段：事件缓冲
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// 每会话事件缓冲容量，写满后丢弃并计数
    pub buffer_size: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

/// [session] 段：过期与清扫
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            sweep_interval_secs: 300,
        }
    }
}

/// 从 config 目录加载配置，环境变量 SIFT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SIFT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SIFT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
