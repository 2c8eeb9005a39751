//! 核心层：错误与恢复策略、会话阶段状态机、编排器

pub mod error;
pub mod orchestrator;
pub mod state;

pub use error::{recovery_for, AgentError, RecoveryAction};
pub use orchestrator::Orchestrator;
pub use state::SessionPhase;
