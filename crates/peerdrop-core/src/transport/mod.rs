//! 点对点传输层
//!
//! 包含:
//! - 传输抽象 (`PeerConnector` / `PeerLink` / `DataChannel`)
//! - WebRTC 实现 (webrtc-rs)
//! - 进程内回环实现 (测试与本地演示)
//! - 连接协商器 (offer/answer/candidate 交换)

pub mod memory;
pub mod negotiator;
pub mod rtc;

pub use memory::{Fault, MemoryNetwork};
pub use negotiator::{Connection, NegotiationStep, Negotiator, Role, SignalInbox};
pub use rtc::WebRtcConnector;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// NAT 穿透服务器描述 (STUN/TURN)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// 信令服务下发的传输配置
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

impl TransportConfig {
    /// 公共 STUN 服务器，信令服务未下发配置时使用
    pub fn public_stun() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
        }
    }
}

/// 数据通道上的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// 控制消息 (JSON)
    Text(String),
    /// 文件数据块
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// 失败或断开，两者同等处理
    Failed,
}

/// 传输层向上报告的事件
pub enum LinkEvent {
    /// 发现本地候选地址，需要通过信令发布
    Candidate(Value),
    State(LinkState),
    /// 数据通道已打开
    ChannelOpen(Arc<dyn DataChannel>),
    /// 数据通道收到消息
    Frame(Frame),
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::Candidate(c) => f.debug_tuple("Candidate").field(c).finish(),
            LinkEvent::State(s) => f.debug_tuple("State").field(s).finish(),
            LinkEvent::ChannelOpen(_) => f.write_str("ChannelOpen"),
            LinkEvent::Frame(frame) => f.debug_tuple("Frame").field(&frame.len()).finish(),
        }
    }
}

pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// 可靠、有序、面向消息的数据通道
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<()>;

    /// 已提交但尚未发出的字节数
    async fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// 一次连接尝试的对端链路
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// 发起方：创建数据通道并生成 offer
    async fn create_offer(&self) -> Result<Value>;

    /// 应答方：应用 offer 并生成 answer
    async fn accept_offer(&self, offer: Value) -> Result<Value>;

    /// 发起方：应用 answer
    async fn apply_answer(&self, answer: Value) -> Result<()>;

    /// 应用对端候选地址
    async fn add_candidate(&self, candidate: Value) -> Result<()>;

    async fn close(&self);
}

/// 链路工厂，每次连接尝试创建一条新链路
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(&self, config: &TransportConfig) -> Result<(Box<dyn PeerLink>, LinkEvents)>;
}
