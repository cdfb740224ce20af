//! 进程内信令服务
//!
//! `SessionStore` 是会话表本身：会话码、文件元数据、按角色分开的待投递队列，
//! 以及过期清理。`MemoryRendezvous` 直接包装它实现 `RendezvousApi`，
//! HTTP 信令服务也复用同一个结构。

use crate::error::{Result, TransferError};
use crate::rendezvous::{
    PeerRole, RendezvousApi, Session, SignalMessage, generate_session_code,
    normalize_session_code,
};
use crate::transfer::FileMetadata;
use crate::transport::TransportConfig;
use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// 会话默认有效期
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(10 * 60);

struct StoredSession {
    file: FileMetadata,
    created: Instant,
    created_at: u64,
    to_sender: VecDeque<SignalMessage>,
    to_receiver: VecDeque<SignalMessage>,
}

impl StoredSession {
    fn inbox(&mut self, role: PeerRole) -> &mut VecDeque<SignalMessage> {
        match role {
            PeerRole::Sender => &mut self.to_sender,
            PeerRole::Receiver => &mut self.to_receiver,
        }
    }
}

/// 会话表
pub struct SessionStore {
    sessions: HashMap<String, StoredSession>,
    ttl: Duration,
    transport: TransportConfig,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL, TransportConfig::public_stun())
    }
}

impl SessionStore {
    pub fn new(ttl: Duration, transport: TransportConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            ttl,
            transport,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// 创建会话，返回分配的会话码
    pub fn create(&mut self, file: FileMetadata) -> Session {
        self.purge_expired();

        let mut code = generate_session_code();
        while self.sessions.contains_key(&code) {
            code = generate_session_code();
        }

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();

        debug!("Session {} created for '{}'", code, file.name);
        self.sessions.insert(
            code.clone(),
            StoredSession {
                file: file.clone(),
                created: Instant::now(),
                created_at,
                to_sender: VecDeque::new(),
                to_receiver: VecDeque::new(),
            },
        );

        Session {
            code,
            file,
            transport: self.transport.clone(),
            created_at,
        }
    }

    /// 查询会话，过期的会话视为不存在
    pub fn get(&mut self, code: &str) -> Option<Session> {
        let code = normalize_session_code(code);
        let stored = self.live(&code)?;
        let (file, created_at) = (stored.file.clone(), stored.created_at);
        Some(Session {
            code,
            file,
            transport: self.transport.clone(),
            created_at,
        })
    }

    /// 把 `from` 发布的消息放入对端队列；会话不存在时返回 false
    pub fn publish(&mut self, code: &str, from: PeerRole, message: SignalMessage) -> bool {
        let code = normalize_session_code(code);
        match self.live(&code) {
            Some(stored) => {
                stored.inbox(from.counterpart()).push_back(message);
                true
            }
            None => false,
        }
    }

    /// 取走发给 `role` 的全部消息
    pub fn drain(&mut self, code: &str, role: PeerRole) -> Option<Vec<SignalMessage>> {
        let code = normalize_session_code(code);
        self.live(&code)
            .map(|stored| stored.inbox(role).drain(..).collect())
    }

    pub fn remove(&mut self, code: &str) -> bool {
        self.sessions
            .remove(&normalize_session_code(code))
            .is_some()
    }

    /// 清理过期会话
    pub fn purge_expired(&mut self) {
        let ttl = self.ttl;
        self.sessions
            .retain(|_, stored| stored.created.elapsed() < ttl);
    }

    fn live(&mut self, code: &str) -> Option<&mut StoredSession> {
        let expired = self
            .sessions
            .get(code)
            .is_some_and(|stored| stored.created.elapsed() >= self.ttl);
        if expired {
            debug!("Session {} expired", code);
            self.sessions.remove(code);
        }
        self.sessions.get_mut(code)
    }
}

/// 进程内信令服务
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    store: Arc<Mutex<SessionStore>>,
}

impl MemoryRendezvous {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// 当前存活的会话数
    pub fn session_count(&self) -> usize {
        let mut store = self.lock();
        store.purge_expired();
        store.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionStore> {
        self.store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl RendezvousApi for MemoryRendezvous {
    async fn create_session(&self, file: &FileMetadata) -> Result<Session> {
        Ok(self.lock().create(file.clone()))
    }

    async fn join_session(&self, code: &str) -> Result<Session> {
        self.lock()
            .get(code)
            .ok_or_else(|| TransferError::SessionNotFound(code.to_string()))
    }

    async fn publish(&self, code: &str, role: PeerRole, message: SignalMessage) -> Result<()> {
        if self.lock().publish(code, role, message) {
            Ok(())
        } else {
            Err(TransferError::SessionNotFound(code.to_string()))
        }
    }

    async fn fetch(&self, code: &str, role: PeerRole) -> Result<Vec<SignalMessage>> {
        self.lock()
            .drain(code, role)
            .ok_or_else(|| TransferError::SessionNotFound(code.to_string()))
    }

    async fn close_session(&self, code: &str) -> Result<()> {
        self.lock().remove(code);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::SignalKind;
    use serde_json::json;

    fn sample_file() -> FileMetadata {
        FileMetadata::new("photo.jpg", 1024, "image/jpeg")
    }

    #[test]
    fn test_messages_route_to_counterpart() {
        let mut store = SessionStore::default();
        let session = store.create(sample_file());

        let offer = SignalMessage::new(SignalKind::Offer, json!({ "sdp": "offer" }));
        assert!(store.publish(&session.code, PeerRole::Sender, offer.clone()));

        assert_eq!(
            store.drain(&session.code, PeerRole::Sender).unwrap(),
            Vec::<SignalMessage>::new()
        );
        assert_eq!(
            store.drain(&session.code, PeerRole::Receiver).unwrap(),
            vec![offer]
        );
        // 已投递的消息不会重复返回
        assert!(store.drain(&session.code, PeerRole::Receiver).unwrap().is_empty());
    }

    #[test]
    fn test_lookup_normalizes_code() {
        let mut store = SessionStore::default();
        let session = store.create(sample_file());
        let typed = format!(" {} ", session.code.to_lowercase());
        assert_eq!(store.get(&typed).unwrap().file, sample_file());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_expire() {
        let mut store = SessionStore::new(Duration::from_secs(60), TransportConfig::default());
        let session = store.create(sample_file());
        assert!(store.get(&session.code).is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get(&session.code).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_rendezvous_unknown_code() {
        let rendezvous = MemoryRendezvous::default();
        let err = rendezvous.join_session("ZZZZZZ").await.unwrap_err();
        assert!(matches!(err, TransferError::SessionNotFound(_)));
    }
}
