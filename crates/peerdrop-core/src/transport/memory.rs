//! 进程内回环传输
//!
//! 在同一进程内把两条 `MemoryLink` 配对成一个有序可靠的通道，不经过网络。
//! 用于集成测试和本地演示，并支持注入连接故障。
//!
//! offer/answer 载荷只携带端点编号：`{"type":"offer","endpoint":N}`。
//! 配对在发起方应用 answer 时完成，此时按顺序消费一个预置的故障。

use crate::error::{Result, TransferError};
use crate::transport::{
    DataChannel, Frame, LinkEvent, LinkEvents, LinkState, PeerConnector, PeerLink,
    TransportConfig,
};
use async_trait::async_trait;
use log::debug;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// 注入的连接故障
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// 协商完成后立即报告失败
    Fail,
    /// 永远停留在连接中（触发超时）
    Stall,
    /// 连接成功，但在发送方发出 N 条消息后断开
    DisconnectAfter(usize),
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    pending_offers: HashMap<u64, Arc<Endpoint>>,
    faults: VecDeque<Fault>,
    established: usize,
}

/// 回环网络，克隆后共享同一状态
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为后续的连接尝试依次预置故障
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// 已成功建立的连接数
    pub fn established(&self) -> usize {
        self.lock().established
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl PeerConnector for MemoryNetwork {
    async fn open(&self, _config: &TransportConfig) -> Result<(Box<dyn PeerLink>, LinkEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            state.next_id
        };
        let endpoint = Arc::new(Endpoint {
            id,
            events: tx,
            peer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let link = MemoryLink {
            network: self.clone(),
            endpoint,
            channel: Mutex::new(None),
        };
        Ok((Box::new(link), rx))
    }
}

struct Endpoint {
    id: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
    peer: Mutex<Option<Arc<Endpoint>>>,
    closed: AtomicBool,
}

impl Endpoint {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn peer(&self) -> Option<Arc<Endpoint>> {
        self.peer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_peer(&self, peer: Arc<Endpoint>) {
        *self
            .peer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(peer);
    }

    fn announce_candidate(&self) {
        self.emit(LinkEvent::Candidate(json!({
            "candidate": format!("candidate:memory {} udp loopback", self.id),
            "sdpMid": "0",
        })));
    }
}

fn endpoint_id(payload: &Value, kind: &str) -> Result<u64> {
    if payload.get("type").and_then(Value::as_str) != Some(kind) {
        return Err(TransferError::Protocol(format!("expected {kind} payload")));
    }
    payload
        .get("endpoint")
        .and_then(Value::as_u64)
        .ok_or_else(|| TransferError::Protocol(format!("{kind} without endpoint")))
}

struct MemoryLink {
    network: MemoryNetwork,
    endpoint: Arc<Endpoint>,
    channel: Mutex<Option<Arc<MemoryChannel>>>,
}

impl MemoryLink {
    fn store_channel(&self, channel: Arc<MemoryChannel>) {
        *self
            .channel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(channel);
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_offer(&self) -> Result<Value> {
        self.network
            .lock()
            .pending_offers
            .insert(self.endpoint.id, self.endpoint.clone());
        self.endpoint.announce_candidate();
        Ok(json!({ "type": "offer", "endpoint": self.endpoint.id }))
    }

    async fn accept_offer(&self, offer: Value) -> Result<Value> {
        let remote_id = endpoint_id(&offer, "offer")?;
        let remote = self
            .network
            .lock()
            .pending_offers
            .remove(&remote_id)
            .ok_or_else(|| TransferError::Connectivity(format!("unknown endpoint {remote_id}")))?;

        remote.set_peer(self.endpoint.clone());
        self.endpoint.set_peer(remote);
        self.endpoint.emit(LinkEvent::State(LinkState::Connecting));
        self.endpoint.announce_candidate();
        Ok(json!({ "type": "answer", "endpoint": self.endpoint.id }))
    }

    async fn apply_answer(&self, answer: Value) -> Result<()> {
        let remote_id = endpoint_id(&answer, "answer")?;
        let remote = self
            .endpoint
            .peer()
            .filter(|peer| peer.id == remote_id)
            .ok_or_else(|| TransferError::Connectivity(format!("unpaired endpoint {remote_id}")))?;

        self.endpoint.emit(LinkEvent::State(LinkState::Connecting));

        let fault = self.network.lock().faults.pop_front();
        debug!(
            "Memory link {} <-> {} negotiated (fault: {:?})",
            self.endpoint.id, remote.id, fault
        );

        let budget = match fault {
            Some(Fault::Fail) => {
                self.endpoint.emit(LinkEvent::State(LinkState::Failed));
                remote.emit(LinkEvent::State(LinkState::Failed));
                return Ok(());
            }
            Some(Fault::Stall) => return Ok(()),
            Some(Fault::DisconnectAfter(n)) => Some(n),
            None => None,
        };

        self.network.lock().established += 1;

        let open = Arc::new(AtomicBool::new(true));
        let local_channel = Arc::new(MemoryChannel {
            local: self.endpoint.clone(),
            remote: remote.clone(),
            open: open.clone(),
            budget: budget.map(AtomicUsize::new),
        });
        let remote_channel = Arc::new(MemoryChannel {
            local: remote.clone(),
            remote: self.endpoint.clone(),
            open,
            budget: None,
        });
        self.store_channel(local_channel.clone());

        for (endpoint, channel) in [(&self.endpoint, local_channel), (&remote, remote_channel)] {
            endpoint.emit(LinkEvent::State(LinkState::Connected));
            endpoint.emit(LinkEvent::ChannelOpen(channel));
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: Value) -> Result<()> {
        if candidate.get("candidate").is_none() {
            return Err(TransferError::Protocol("malformed candidate".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.endpoint.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.network
            .lock()
            .pending_offers
            .remove(&self.endpoint.id);
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(channel) = channel {
            channel.open.store(false, Ordering::SeqCst);
        }
        if let Some(peer) = self.endpoint.peer()
            && !peer.closed.load(Ordering::SeqCst)
        {
            peer.emit(LinkEvent::State(LinkState::Failed));
        }
    }
}

struct MemoryChannel {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    open: Arc<AtomicBool>,
    /// 断开前剩余可发送的消息数
    budget: Option<AtomicUsize>,
}

impl MemoryChannel {
    fn sever(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.local.emit(LinkEvent::State(LinkState::Failed));
        self.remote.emit(LinkEvent::State(LinkState::Failed));
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(TransferError::Connectivity("channel closed".to_string()));
        }
        if let Some(budget) = &self.budget {
            let exhausted = budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err();
            if exhausted {
                self.sever();
                return Err(TransferError::Connectivity("peer disconnected".to_string()));
            }
        }
        if self.remote.closed.load(Ordering::SeqCst) {
            return Err(TransferError::Connectivity("peer closed".to_string()));
        }
        self.remote.emit(LinkEvent::Frame(frame));
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_channel(events: &mut LinkEvents) -> Arc<dyn DataChannel> {
        while let Some(event) = events.recv().await {
            if let LinkEvent::ChannelOpen(channel) = event {
                return channel;
            }
        }
        panic!("link closed without opening a channel");
    }

    #[tokio::test]
    async fn test_pairs_links_and_delivers_in_order() {
        let network = MemoryNetwork::new();
        let config = TransportConfig::default();
        let (initiator, mut initiator_events) = network.open(&config).await.unwrap();
        let (responder, mut responder_events) = network.open(&config).await.unwrap();

        let offer = initiator.create_offer().await.unwrap();
        let answer = responder.accept_offer(offer).await.unwrap();
        initiator.apply_answer(answer).await.unwrap();

        let tx = next_channel(&mut initiator_events).await;
        let _rx = next_channel(&mut responder_events).await;
        assert_eq!(network.established(), 1);

        tx.send(Frame::Text("first".into())).await.unwrap();
        tx.send(Frame::Binary(bytes::Bytes::from_static(b"second")))
            .await
            .unwrap();

        let mut frames = Vec::new();
        while frames.len() < 2 {
            if let Some(LinkEvent::Frame(frame)) = responder_events.recv().await {
                frames.push(frame);
            }
        }
        assert_eq!(frames[0], Frame::Text("first".into()));
        assert_eq!(frames[1], Frame::Binary(bytes::Bytes::from_static(b"second")));
    }

    #[tokio::test]
    async fn test_injected_failure_reports_failed_state() {
        let network = MemoryNetwork::new();
        network.inject(Fault::Fail);
        let config = TransportConfig::default();
        let (initiator, mut events) = network.open(&config).await.unwrap();
        let (responder, _responder_events) = network.open(&config).await.unwrap();

        let answer = responder
            .accept_offer(initiator.create_offer().await.unwrap())
            .await
            .unwrap();
        initiator.apply_answer(answer).await.unwrap();

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LinkEvent::State(LinkState::Failed)) {
                saw_failed = true;
            }
            assert!(!matches!(event, LinkEvent::ChannelOpen(_)));
        }
        assert!(saw_failed);
        assert_eq!(network.established(), 0);
    }

    #[tokio::test]
    async fn test_unknown_offer_is_rejected() {
        let network = MemoryNetwork::new();
        let (responder, _events) = network.open(&TransportConfig::default()).await.unwrap();
        let err = responder
            .accept_offer(json!({ "type": "offer", "endpoint": 42 }))
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
    }
}
