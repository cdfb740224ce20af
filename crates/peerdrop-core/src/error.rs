//! 错误类型
//!
//! 传输核心的错误分类。连接类错误由重试策略内部吸收，其余错误在首次出现时
//! 通过状态回调上报给调用方。

use std::fmt;
use thiserror::Error;

/// 失败发生的阶段，随 `FAILED` 状态一起上报
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureContext {
    /// 创建/加入会话
    Session,
    /// 连接协商
    Connect,
    /// 读取本地文件
    Read,
    /// 发送数据块
    Send,
    /// 接收数据块
    Receive,
    /// 组装与校验
    Verify,
}

impl FailureContext {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureContext::Session => "session",
            FailureContext::Connect => "connect",
            FailureContext::Read => "read",
            FailureContext::Send => "send",
            FailureContext::Receive => "receive",
            FailureContext::Verify => "verify",
        }
    }
}

impl fmt::Display for FailureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传输错误
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to create session: {0}")]
    SessionCreate(String),

    #[error("session not found or expired: {0}")]
    SessionNotFound(String),

    #[error("connection timed out after {0}s")]
    Timeout(u64),

    #[error("connectivity failure: {0}")]
    Connectivity(String),

    #[error("integrity check failed: expected {expected} bytes, received {received}")]
    Integrity { expected: u64, received: u64 },

    #[error("peer rejected the transfer: {0}")]
    PeerRejected(String),

    #[error("local resource error during {context}: {source}")]
    LocalResource {
        context: FailureContext,
        #[source]
        source: std::io::Error,
    },

    #[error("signaling protocol error: {0}")]
    Protocol(String),
}

impl TransferError {
    /// 是否属于重试策略处理的连接类错误
    pub fn is_connectivity(&self) -> bool {
        matches!(self, TransferError::Timeout(_) | TransferError::Connectivity(_))
    }

    pub fn local(context: FailureContext, source: std::io::Error) -> Self {
        TransferError::LocalResource { context, source }
    }

    /// 默认的失败阶段，调用方可按实际阶段覆盖
    pub fn context(&self) -> FailureContext {
        match self {
            TransferError::SessionCreate(_) | TransferError::SessionNotFound(_) => {
                FailureContext::Session
            }
            TransferError::Timeout(_)
            | TransferError::Connectivity(_)
            | TransferError::Protocol(_) => FailureContext::Connect,
            TransferError::Integrity { .. } | TransferError::PeerRejected(_) => {
                FailureContext::Verify
            }
            TransferError::LocalResource { context, .. } => *context,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(TransferError::Timeout(30).is_connectivity());
        assert!(TransferError::Connectivity("ice failed".into()).is_connectivity());
        assert!(
            !TransferError::Integrity {
                expected: 10,
                received: 9
            }
            .is_connectivity()
        );
        assert!(!TransferError::SessionNotFound("ABC123".into()).is_connectivity());
    }

    #[test]
    fn test_local_resource_keeps_context() {
        let err = TransferError::local(
            FailureContext::Read,
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.context(), FailureContext::Read);
        assert!(err.to_string().contains("during read"));
    }

    #[test]
    fn test_context_names() {
        let contexts = [FailureContext::Session, FailureContext::Verify];
        let names: Vec<&str> = contexts.iter().copied().map(FailureContext::as_str).collect();
        assert_eq!(names, vec!["session", "verify"]);
        assert_eq!(FailureContext::Connect.to_string(), "connect");
    }
}
