//! 传输状态

use crate::error::FailureContext;
use std::fmt;

/// 传输状态
///
/// `COMPLETED` / `FALLBACK` / `FAILED` 是一次传输的终态；重新调用
/// `create_session` / `join_session` 会开始新的传输。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Idle,
    CreatingRoom,
    WaitingForPeer,
    Connecting,
    Transferring,
    Verifying,
    Completed,
    Failed,
    Fallback,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Fallback
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferState::Idle => "IDLE",
            TransferState::CreatingRoom => "CREATING_ROOM",
            TransferState::WaitingForPeer => "WAITING_FOR_PEER",
            TransferState::Connecting => "CONNECTING",
            TransferState::Transferring => "TRANSFERRING",
            TransferState::Verifying => "VERIFYING",
            TransferState::Completed => "COMPLETED",
            TransferState::Failed => "FAILED",
            TransferState::Fallback => "FALLBACK",
        }
    }

    /// 状态图中的合法转换
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;

        match (self, next) {
            // 取消在任何状态下都回到 IDLE
            (_, Idle) => true,
            (Idle | Completed | Failed | Fallback, CreatingRoom) => true,
            (CreatingRoom, WaitingForPeer) => true,
            (WaitingForPeer, Connecting | Transferring) => true,
            (Connecting, Transferring) => true,
            (Transferring, Verifying) => true,
            (Verifying, Completed) => true,
            // 重试从建房重新开始
            (WaitingForPeer | Connecting | Transferring | Verifying, CreatingRoom) => true,
            (from, Failed | Fallback) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 随状态变化一起上报的上下文
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateContext {
    /// 当前会话码
    pub session_code: Option<String>,
    /// 本次传输已经发生的连接失败次数
    pub retry_count: u32,
    /// `FAILED` 时的失败阶段
    pub failure: Option<FailureContext>,
    /// 失败或回退的原始错误信息
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::TransferState::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            Idle,
            CreatingRoom,
            WaitingForPeer,
            Connecting,
            Transferring,
            Verifying,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(Completed.is_terminal());
        assert!(Fallback.is_terminal());
        assert!(!Verifying.is_terminal());
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Fallback.can_transition_to(Transferring));
        assert!(Failed.can_transition_to(CreatingRoom));
    }

    #[test]
    fn test_failure_reachable_from_non_terminal() {
        for state in [CreatingRoom, WaitingForPeer, Connecting, Transferring, Verifying] {
            assert!(state.can_transition_to(Failed));
            assert!(state.can_transition_to(Fallback));
            assert!(state.can_transition_to(Idle));
        }
        assert!(!CreatingRoom.can_transition_to(Transferring));
    }

    #[test]
    fn test_display_names() {
        assert_eq!(WaitingForPeer.to_string(), "WAITING_FOR_PEER");
        assert_eq!(Fallback.to_string(), "FALLBACK");
    }
}
