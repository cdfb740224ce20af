//! PeerDrop Core Library
//!
//! 点对点文件传输核心：用一个短会话码建立点对点可靠通道，分块流式发送文件，
//! 校验完整性；连不上对端时把原始文件交还给集中式上传流程。
//!
//! # 模块
//!
//! - **rendezvous**: 信令服务客户端 (创建/加入会话、发布和轮询信令)
//! - **transport**: 传输抽象、WebRTC 实现与连接协商
//! - **transfer**: 分块发送、背压、接收与组装
//! - **workflow**: 传输状态机、重试策略与回退桥
//!
//! # 使用示例
//!
//! ## 发送文件
//!
//! ```ignore
//! use peerdrop_core::{HttpRendezvous, OutgoingFile, TransferMachine, WebRtcConnector};
//!
//! let api = Arc::new(HttpRendezvous::new("http://127.0.0.1:8787")?);
//! let mut machine = TransferMachine::new(
//!     api,
//!     Arc::new(WebRtcConnector::new()),
//!     TransferConfig::default(),
//!     observer,
//! );
//!
//! let file = OutgoingFile::from_path("report.pdf").await?;
//! match machine.create_session(file).await? {
//!     TransferOutcome::Completed(_) => println!("done"),
//!     TransferOutcome::Fallback(request) => upload(request.file),
//!     TransferOutcome::Cancelled => {}
//! }
//! ```
//!
//! ## 接收文件
//!
//! ```ignore
//! if let TransferOutcome::Completed(Some(file)) = machine.join_session("K7QX2M").await? {
//!     file.save_to(download_dir).await?;
//! }
//! ```

pub mod config;
pub mod error;
pub mod rendezvous;
pub mod transfer;
pub mod transport;
pub mod workflow;

// Config re-exports
pub use config::{AppSettings, TransferConfig};

// Error re-exports
pub use error::{FailureContext, Result, TransferError};

// Rendezvous re-exports
pub use rendezvous::{
    HttpRendezvous, MemoryRendezvous, PeerRole, RendezvousApi, RendezvousClient, Session,
    SessionStore, SignalKind, SignalMessage,
};

// Transfer re-exports
pub use transfer::{FileMetadata, OutgoingFile, Progress, ReceivedFile};

// Transport re-exports
pub use transport::{MemoryNetwork, PeerConnector, TransportConfig, WebRtcConnector};

// Workflow re-exports
pub use workflow::{
    CancelHandle, ChannelObserver, FallbackHandler, FallbackRequest, FileReady, StateContext,
    TransferEvent, TransferMachine, TransferObserver, TransferOutcome, TransferState,
};
