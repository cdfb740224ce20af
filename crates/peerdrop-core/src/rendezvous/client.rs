//! 面向状态机的信令客户端
//!
//! `RendezvousClient` 负责创建/加入会话并保存会话副本；
//! `SignalChannel` 是绑定到某个会话和角色的信令收发端，交给协商器使用。

use log::{debug, warn};

use crate::error::{Result, TransferError};
use crate::rendezvous::{PeerRole, RendezvousApi, Session, SignalKind, SignalMessage};
use crate::transfer::FileMetadata;
use crate::transport::TransportConfig;
use futures_util::StreamExt;
use futures_util::future;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;

/// 信令客户端
pub struct RendezvousClient {
    api: Arc<dyn RendezvousApi>,
    poll_interval: Duration,
    session: Option<Session>,
    role: PeerRole,
}

impl RendezvousClient {
    pub fn new(api: Arc<dyn RendezvousApi>, poll_interval: Duration) -> Self {
        Self {
            api,
            poll_interval,
            session: None,
            role: PeerRole::Sender,
        }
    }

    /// 发送端：创建新会话，返回会话码
    pub async fn create_session(&mut self, file: &FileMetadata) -> Result<String> {
        if file.size == 0 {
            return Err(TransferError::SessionCreate(
                "file must not be empty".to_string(),
            ));
        }
        let session = self.api.create_session(file).await?;
        let code = session.code.clone();
        self.session = Some(session);
        self.role = PeerRole::Sender;
        Ok(code)
    }

    /// 发送端重试时调用：会话仍然有效就沿用，否则重新创建
    pub async fn reopen_session(&mut self, file: &FileMetadata) -> Result<String> {
        if let Some(session) = &self.session {
            match self.api.join_session(&session.code).await {
                Ok(_) => return Ok(session.code.clone()),
                Err(e) => debug!("Session {} no longer usable: {}", session.code, e),
            }
        }
        self.create_session(file).await
    }

    /// 接收端：加入已有会话，返回发送端声明的文件元数据
    pub async fn join_session(&mut self, code: &str) -> Result<FileMetadata> {
        let session = self.api.join_session(code).await.map_err(|e| match e {
            TransferError::SessionNotFound(_) => e,
            other => TransferError::SessionNotFound(format!("{}: {}", code, other)),
        })?;
        let file = session.file.clone();
        self.session = Some(session);
        self.role = PeerRole::Receiver;
        Ok(file)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// 信令服务下发的传输配置
    pub fn transport_config(&self) -> TransportConfig {
        self.session
            .as_ref()
            .map(|s| s.transport.clone())
            .unwrap_or_default()
    }

    /// 当前会话的信令收发端
    pub fn channel(&self) -> Option<SignalChannel> {
        self.session.as_ref().map(|session| SignalChannel {
            api: self.api.clone(),
            code: session.code.clone(),
            role: self.role,
            poll_interval: self.poll_interval,
        })
    }

    /// 发布信令消息，尽力而为
    pub async fn send_signal(&self, kind: SignalKind, payload: Value) {
        if let Some(channel) = self.channel() {
            channel.send_signal(kind, payload).await;
        }
    }

    /// 轮询对端消息；未加入会话时返回空流
    pub fn poll_signals(&self) -> BoxStream<'static, SignalMessage> {
        match self.channel() {
            Some(channel) => channel.poll_signals(),
            None => stream::empty().boxed(),
        }
    }

    /// 关闭并遗忘当前会话（尽力而为）
    pub async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Closing session {}", session.code);
            if let Err(e) = self.api.close_session(&session.code).await {
                warn!("Failed to close session {}: {}", session.code, e);
            }
        }
    }
}

/// 绑定到会话和角色的信令收发端
#[derive(Clone)]
pub struct SignalChannel {
    api: Arc<dyn RendezvousApi>,
    code: String,
    role: PeerRole,
    poll_interval: Duration,
}

impl SignalChannel {
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// 发布信令消息；失败只记录日志，不影响调用方
    pub async fn send_signal(&self, kind: SignalKind, payload: Value) {
        self.publish(SignalMessage::new(kind, payload)).await;
    }

    /// 发布一条已构造好的消息，同样尽力而为
    pub async fn publish(&self, message: SignalMessage) {
        let kind = message.kind;
        if let Err(e) = self.api.publish(&self.code, self.role, message).await {
            warn!("Failed to publish {:?} for session {}: {}", kind, self.code, e);
        }
    }

    /// 惰性的对端消息流
    ///
    /// 第一次轮询立即发出，之后按固定间隔轮询。每次调用返回一个新的流，
    /// 丢弃流即停止轮询。会话不存在 (已关闭或过期) 时流结束。
    pub fn poll_signals(&self) -> BoxStream<'static, SignalMessage> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let channel = self.clone();
        IntervalStream::new(ticker)
            .then(move |_| {
                let channel = channel.clone();
                async move { channel.fetch().await }
            })
            .take_while(|batch| future::ready(batch.is_some()))
            .flat_map(|batch| stream::iter(batch.unwrap_or_default()))
            .boxed()
    }

    /// 单次轮询；会话不存在时返回 `None`，其他失败记录日志并返回空批次
    async fn fetch(&self) -> Option<Vec<SignalMessage>> {
        match self.api.fetch(&self.code, self.role).await {
            Ok(messages) => Some(messages),
            Err(TransferError::SessionNotFound(_)) => {
                debug!("Session {} is gone, stopping signal poll", self.code);
                None
            }
            Err(e) => {
                warn!("Signal poll for session {} failed: {}", self.code, e);
                Some(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::MemoryRendezvous;
    use serde_json::json;

    fn client(api: &MemoryRendezvous) -> RendezvousClient {
        RendezvousClient::new(Arc::new(api.clone()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_create_rejects_empty_file() {
        let api = MemoryRendezvous::default();
        let err = client(&api)
            .create_session(&FileMetadata::new("empty.txt", 0, "text/plain"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SessionCreate(_)));
    }

    #[tokio::test]
    async fn test_join_returns_declared_metadata() {
        let api = MemoryRendezvous::default();
        let file = FileMetadata::new("notes.txt", 42, "text/plain");

        let mut sender = client(&api);
        let code = sender.create_session(&file).await.unwrap();

        let mut receiver = client(&api);
        assert_eq!(receiver.join_session(&code).await.unwrap(), file);
        assert_eq!(receiver.role(), PeerRole::Receiver);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_delivers_messages_in_order() {
        let api = MemoryRendezvous::default();
        let mut sender = client(&api);
        let code = sender
            .create_session(&FileMetadata::new("a.bin", 1, "application/octet-stream"))
            .await
            .unwrap();
        let mut receiver = client(&api);
        receiver.join_session(&code).await.unwrap();

        sender.send_signal(SignalKind::Offer, json!({ "n": 1 })).await;
        sender.send_signal(SignalKind::Candidate, json!({ "n": 2 })).await;

        let mut stream = receiver.poll_signals();
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.kind, SignalKind::Offer);
        assert_eq!(second.data["n"], 2);

        // 之后发布的消息在下一次轮询时到达
        sender.send_signal(SignalKind::Candidate, json!({ "n": 3 })).await;
        let third = stream.next().await.unwrap();
        assert_eq!(third.data["n"], 3);
    }

    #[tokio::test]
    async fn test_reopen_keeps_live_session() {
        let api = MemoryRendezvous::default();
        let file = FileMetadata::new("a.bin", 1, "application/octet-stream");
        let mut sender = client(&api);
        let code = sender.create_session(&file).await.unwrap();
        assert_eq!(sender.reopen_session(&file).await.unwrap(), code);

        // 会话被删除后重新创建
        api.close_session(&code).await.unwrap();
        let fresh = sender.reopen_session(&file).await.unwrap();
        assert_ne!(fresh, code);
        assert_eq!(api.session_count(), 1);
    }

    #[tokio::test]
    async fn test_close_session_forgets_session() {
        let api = MemoryRendezvous::default();
        let mut sender = client(&api);
        sender
            .create_session(&FileMetadata::new("a.bin", 1, "application/octet-stream"))
            .await
            .unwrap();
        assert_eq!(api.session_count(), 1);

        sender.close_session().await;
        assert!(sender.session().is_none());
        assert_eq!(api.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_ends_when_session_closes() {
        let api = MemoryRendezvous::default();
        let mut sender = client(&api);
        let code = sender
            .create_session(&FileMetadata::new("a.bin", 1, "application/octet-stream"))
            .await
            .unwrap();
        let mut receiver = client(&api);
        receiver.join_session(&code).await.unwrap();

        sender.send_signal(SignalKind::Offer, json!({ "n": 1 })).await;
        let mut stream = receiver.poll_signals();
        assert_eq!(stream.next().await.unwrap().kind, SignalKind::Offer);

        sender.close_session().await;
        assert!(stream.next().await.is_none());
    }
}
