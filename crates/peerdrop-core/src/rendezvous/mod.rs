//! 信令服务客户端
//!
//! 包含:
//! - 会话 (房间) 与信令消息的数据结构
//! - 信令服务抽象 `RendezvousApi`
//! - HTTP 实现 (reqwest) 与进程内实现
//! - 面向状态机的 `RendezvousClient`，负责轮询和发布信令
//!
//! # 协议
//!
//! - `POST /session` 创建会话，返回会话码和传输配置
//! - `GET /session/{code}` 查询会话
//! - `DELETE /session/{code}` 关闭会话
//! - `POST /signal` 发布信令消息
//! - `GET /signal/{code}?role=` 取回发给该角色、尚未投递的消息

pub mod client;
pub mod code;
pub mod http;
pub mod memory;

pub use client::{RendezvousClient, SignalChannel};
pub use code::{generate_session_code, is_valid_session_code, normalize_session_code};
pub use http::HttpRendezvous;
pub use memory::{MemoryRendezvous, SessionStore};

use crate::error::Result;
use crate::transfer::FileMetadata;
use crate::transport::TransportConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 会话 (房间)，由信令服务持有，本地只保存副本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub code: String,
    pub file: FileMetadata,
    pub transport: TransportConfig,
    /// 创建时间 (Unix 毫秒)
    pub created_at: u64,
}

/// 会话中的角色
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Sender,
    Receiver,
}

impl PeerRole {
    /// 对端角色
    pub fn counterpart(self) -> Self {
        match self {
            PeerRole::Sender => PeerRole::Receiver,
            PeerRole::Receiver => PeerRole::Sender,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Sender => "sender",
            PeerRole::Receiver => "receiver",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 信令消息类型
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// 信令消息
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: Value,
    /// 连接尝试序号，重试时用来丢弃上一次尝试遗留的消息
    #[serde(default)]
    pub attempt: u32,
}

impl SignalMessage {
    pub fn new(kind: SignalKind, data: Value) -> Self {
        Self {
            kind,
            data,
            attempt: 0,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// `POST /session` 请求体
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
}

impl From<&FileMetadata> for CreateSessionRequest {
    fn from(file: &FileMetadata) -> Self {
        Self {
            file_name: file.name.clone(),
            file_size: file.size,
            file_type: file.mime_type.clone(),
        }
    }
}

/// `POST /session` 响应体
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_code: String,
    #[serde(default)]
    pub transport_config: TransportConfig,
    #[serde(default)]
    pub created_at: u64,
}

/// `GET /session/{code}` 响应体
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub file_metadata: FileMetadata,
    #[serde(default)]
    pub transport_config: TransportConfig,
    #[serde(default)]
    pub created_at: u64,
}

/// `POST /signal` 请求体
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PublishSignalRequest {
    pub session_code: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: Value,
    /// 发布者角色，服务据此投递给对端
    pub role: PeerRole,
    #[serde(default)]
    pub attempt: u32,
}

impl PublishSignalRequest {
    pub fn into_message(self) -> SignalMessage {
        SignalMessage {
            kind: self.kind,
            data: self.data,
            attempt: self.attempt,
        }
    }
}

/// `GET /signal/{code}` 查询参数
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct SignalQuery {
    pub role: PeerRole,
}

/// 信令服务抽象
#[async_trait]
pub trait RendezvousApi: Send + Sync {
    async fn create_session(&self, file: &FileMetadata) -> Result<Session>;

    async fn join_session(&self, code: &str) -> Result<Session>;

    /// 以 `role` 身份发布一条消息给对端
    async fn publish(&self, code: &str, role: PeerRole, message: SignalMessage) -> Result<()>;

    /// 取回发给 `role` 的未投递消息，按发布顺序
    async fn fetch(&self, code: &str, role: PeerRole) -> Result<Vec<SignalMessage>>;

    async fn close_session(&self, code: &str) -> Result<()>;
}
