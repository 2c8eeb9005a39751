//! 会话阶段状态机
//!
//! `Idle → Thinking → {AwaitingClarification | RetrievingKnowledge | ExecutingTool} → Responding → Idle`，
//! 任意非终态可进入终态 Failed。Idle 为初始态；Responding→Idle 与 Failed 是仅有的收束转移。

use serde::Serialize;

/// 会话所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Thinking,
    /// 已发出澄清问题，挂起等待下一条用户消息（本层不设超时）
    AwaitingClarification,
    RetrievingKnowledge,
    ExecutingTool,
    Responding,
    /// 终态：仅自动化驱动不可达时进入
    Failed,
}

impl SessionPhase {
    /// 该阶段是否允许转移到 `next`
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        // 任意非终态都可进入 Failed
        if next == Failed {
            return self != Failed;
        }
        matches!(
            (self, next),
            (Idle, Thinking)
                | (AwaitingClarification, Thinking)
                | (Thinking, AwaitingClarification)
                | (Thinking, RetrievingKnowledge)
                | (Thinking, ExecutingTool)
                | (Thinking, Responding)
                | (RetrievingKnowledge, Thinking)
                | (ExecutingTool, Responding)
                | (Responding, Idle)
        )
    }

    /// 是否处于可接收新用户消息的阶段
    pub fn accepts_user_turn(self) -> bool {
        matches!(self, SessionPhase::Idle | SessionPhase::AwaitingClarification)
    }

    pub fn is_terminal(self) -> bool {
        self == SessionPhase::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::SessionPhase::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(Idle.can_transition_to(Thinking));
        assert!(Thinking.can_transition_to(ExecutingTool));
        assert!(ExecutingTool.can_transition_to(Responding));
        assert!(Responding.can_transition_to(Idle));
    }

    #[test]
    fn test_retrieval_loops_back_to_thinking() {
        assert!(Thinking.can_transition_to(RetrievingKnowledge));
        assert!(RetrievingKnowledge.can_transition_to(Thinking));
        assert!(!RetrievingKnowledge.can_transition_to(ExecutingTool));
    }

    #[test]
    fn test_clarification_suspends_until_next_turn() {
        assert!(Thinking.can_transition_to(AwaitingClarification));
        assert!(AwaitingClarification.can_transition_to(Thinking));
        assert!(AwaitingClarification.accepts_user_turn());
        assert!(!ExecutingTool.accepts_user_turn());
    }

    #[test]
    fn test_failed_is_absorbing() {
        assert!(ExecutingTool.can_transition_to(Failed));
        assert!(Idle.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Idle));
        assert!(!Failed.can_transition_to(Thinking));
        assert!(Failed.is_terminal());
    }

    #[test]
    fn test_no_shortcuts() {
        assert!(!Idle.can_transition_to(ExecutingTool));
        assert!(!ExecutingTool.can_transition_to(Idle));
        assert!(!Responding.can_transition_to(Thinking));
    }
}
