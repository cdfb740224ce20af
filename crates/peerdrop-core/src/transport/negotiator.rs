//! 连接协商器
//!
//! 通过信令交换 offer / answer / candidate，直到数据通道打开。
//!
//! - 发起方 (发送端) 创建 offer 并打开本地数据通道，消费第一个 answer
//! - 应答方 (接收端) 等待 offer，发布 answer，等对端打开的通道到达
//!
//! 双方都发布本地发现的每一个候选地址。远端描述应用之前到达的候选地址
//! 先缓存，之后再应用。重复的 offer/answer 直接忽略。
//!
//! 每条信令消息带有连接尝试序号。发起方只接受本次尝试的消息；应答方
//! 采用已到达消息中序号最大的 offer，丢弃更早尝试的消息。
//!
//! 信令流结束说明会话已被关闭，协商以 `SessionNotFound` 结束。

use log::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::rendezvous::{SignalChannel, SignalKind, SignalMessage};
use crate::transport::{
    DataChannel, LinkEvent, LinkEvents, LinkState, PeerConnector, PeerLink, TransportConfig,
};
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// 协商中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// 协商进展
pub enum NegotiationStep {
    /// 看到了对端 (发起方收到 answer / 应答方收到 offer)
    PeerSeen,
    /// 链路已连接且数据通道已打开
    Connected(Connection),
}

/// 建立好的连接
pub struct Connection {
    pub link: Box<dyn PeerLink>,
    pub channel: Arc<dyn DataChannel>,
    /// 链路的后续事件，数据帧从这里读取
    pub events: LinkEvents,
}

impl Connection {
    /// 关闭数据通道和链路
    pub async fn close(&self) {
        self.channel.close().await;
        self.link.close().await;
    }
}

/// 信令收件箱
///
/// 在同一会话的多次连接尝试之间共享，被读出但属于下一次尝试的消息
/// 会放回这里。
pub struct SignalInbox {
    stream: BoxStream<'static, SignalMessage>,
    pushed_back: VecDeque<SignalMessage>,
}

impl SignalInbox {
    pub fn new(signals: &SignalChannel) -> Self {
        Self {
            stream: signals.poll_signals(),
            pushed_back: VecDeque::new(),
        }
    }

    async fn next(&mut self) -> Option<SignalMessage> {
        if let Some(message) = self.pushed_back.pop_front() {
            return Some(message);
        }
        self.stream.next().await
    }

    fn push_back(&mut self, message: SignalMessage) {
        self.pushed_back.push_front(message);
    }

    /// 在已经到达、无需等待的消息里找序号更大的 offer 替换 `offer`
    ///
    /// 其余消息按原顺序放回。
    fn newest_offer(&mut self, offer: SignalMessage) -> SignalMessage {
        let mut ready: Vec<SignalMessage> = self.pushed_back.drain(..).collect();
        while let Some(Some(message)) = self.stream.next().now_or_never() {
            ready.push(message);
        }

        let newer = ready
            .iter()
            .enumerate()
            .filter(|(_, m)| m.kind == SignalKind::Offer && m.attempt > offer.attempt)
            .max_by_key(|(_, m)| m.attempt)
            .map(|(index, _)| index);
        let chosen = match newer {
            Some(index) => {
                let newer = ready.remove(index);
                debug!(
                    "Skipping stale offer from attempt {} in favour of attempt {}",
                    offer.attempt, newer.attempt
                );
                newer
            }
            None => offer,
        };

        for message in ready.into_iter().rev() {
            self.push_back(message);
        }
        chosen
    }
}

enum Input {
    Link(Option<LinkEvent>),
    Signal(Option<SignalMessage>),
}

fn negotiation_failed(e: TransferError) -> TransferError {
    if e.is_connectivity() {
        e
    } else {
        TransferError::Connectivity(format!("negotiation failed: {}", e))
    }
}

/// 一次连接尝试的协商器
pub struct Negotiator {
    role: Role,
    /// 发起方：本次尝试的序号；应答方：采用的 offer 序号
    attempt: Option<u32>,
    min_attempt: u32,
    signals: SignalChannel,
    link: Option<Box<dyn PeerLink>>,
    events: Option<LinkEvents>,
    channel: Option<Arc<dyn DataChannel>>,
    remote_applied: bool,
    pending_candidates: Vec<(u32, Value)>,
    peer_seen: bool,
    peer_reported: bool,
}

impl Negotiator {
    /// 打开新链路并开始协商；发起方立即发布 offer
    pub async fn start(
        connector: &dyn PeerConnector,
        transport: &TransportConfig,
        signals: SignalChannel,
        role: Role,
        attempt: u32,
    ) -> Result<Self> {
        let (link, events) = connector.open(transport).await.map_err(negotiation_failed)?;

        let mut negotiator = Self {
            role,
            attempt: None,
            min_attempt: attempt,
            signals,
            link: Some(link),
            events: Some(events),
            channel: None,
            remote_applied: false,
            pending_candidates: Vec::new(),
            peer_seen: false,
            peer_reported: false,
        };

        if role == Role::Initiator {
            negotiator.attempt = Some(attempt);
            let offer = negotiator
                .link()?
                .create_offer()
                .await
                .map_err(negotiation_failed)?;
            negotiator.publish(SignalKind::Offer, offer).await;
            debug!(
                "Offer published for session {} (attempt {})",
                negotiator.signals.code(),
                attempt
            );
        }

        Ok(negotiator)
    }

    /// 推进协商，直到出现下一个可观察的进展
    ///
    /// 返回 `Connected` 之后协商器不再可用。链路失败返回连接错误。
    pub async fn next_step(&mut self, inbox: &mut SignalInbox) -> Result<NegotiationStep> {
        loop {
            if self.peer_seen && !self.peer_reported {
                self.peer_reported = true;
                return Ok(NegotiationStep::PeerSeen);
            }
            if let Some(channel) = self.channel.take() {
                let link = self.link.take();
                let events = self.events.take();
                if let (Some(link), Some(events)) = (link, events) {
                    info!("Peer connected on session {}", self.signals.code());
                    return Ok(NegotiationStep::Connected(Connection {
                        link,
                        channel,
                        events,
                    }));
                }
                return Err(TransferError::Connectivity(
                    "negotiator already finished".to_string(),
                ));
            }

            let input = {
                let events = self.events.as_mut().ok_or_else(|| {
                    TransferError::Connectivity("negotiator already finished".to_string())
                })?;
                tokio::select! {
                    biased;
                    event = events.recv() => Input::Link(event),
                    message = inbox.next() => Input::Signal(message),
                }
            };

            match input {
                Input::Link(Some(event)) => self.on_link_event(event).await?,
                Input::Link(None) => {
                    return Err(TransferError::Connectivity("peer link dropped".to_string()));
                }
                Input::Signal(Some(message)) => self.on_signal(message, inbox).await?,
                Input::Signal(None) => {
                    info!("Session {} closed by the peer", self.signals.code());
                    return Err(TransferError::SessionNotFound(
                        self.signals.code().to_string(),
                    ));
                }
            }
        }
    }

    /// 放弃本次尝试并关闭链路
    pub async fn abort(mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }

    /// 本次协商采用的尝试序号；应答方收到 offer 之前为 `None`
    pub fn attempt(&self) -> Option<u32> {
        self.attempt
    }

    fn link(&self) -> Result<&dyn PeerLink> {
        self.link
            .as_deref()
            .ok_or_else(|| TransferError::Connectivity("negotiator already finished".to_string()))
    }

    fn current_attempt(&self) -> u32 {
        self.attempt.unwrap_or(self.min_attempt)
    }

    async fn publish(&self, kind: SignalKind, data: Value) {
        let message = SignalMessage::new(kind, data).with_attempt(self.current_attempt());
        self.signals.publish(message).await;
    }

    async fn on_link_event(&mut self, event: LinkEvent) -> Result<()> {
        match event {
            LinkEvent::Candidate(candidate) => {
                self.publish(SignalKind::Candidate, candidate).await;
            }
            LinkEvent::State(LinkState::Failed) => {
                warn!(
                    "Peer connection failed on session {} (attempt {})",
                    self.signals.code(),
                    self.current_attempt()
                );
                return Err(TransferError::Connectivity(
                    "peer connection failed".to_string(),
                ));
            }
            LinkEvent::State(state) => debug!("Peer connection state: {:?}", state),
            LinkEvent::ChannelOpen(channel) => {
                debug!("Data channel open");
                self.channel = Some(channel);
            }
            LinkEvent::Frame(frame) => {
                warn!("Dropping {} byte frame received before channel open", frame.len());
            }
        }
        Ok(())
    }

    async fn on_signal(&mut self, message: SignalMessage, inbox: &mut SignalInbox) -> Result<()> {
        if message.attempt < self.min_attempt {
            debug!(
                "Dropping stale {:?} from attempt {}",
                message.kind, message.attempt
            );
            return Ok(());
        }

        match (self.role, message.kind) {
            (Role::Initiator, SignalKind::Answer) => {
                if message.attempt != self.current_attempt() {
                    debug!("Dropping answer for attempt {}", message.attempt);
                } else if self.remote_applied {
                    debug!("Ignoring duplicate answer");
                } else {
                    self.link()?
                        .apply_answer(message.data)
                        .await
                        .map_err(negotiation_failed)?;
                    self.remote_description_applied().await;
                }
            }
            (Role::Responder, SignalKind::Offer) => match self.attempt {
                None => {
                    let message = inbox.newest_offer(message);
                    self.attempt = Some(message.attempt);
                    let answer = self
                        .link()?
                        .accept_offer(message.data)
                        .await
                        .map_err(negotiation_failed)?;
                    self.publish(SignalKind::Answer, answer).await;
                    self.remote_description_applied().await;
                }
                Some(current) if message.attempt <= current => {
                    debug!("Ignoring offer from attempt {}", message.attempt);
                }
                Some(_) => {
                    // 发起方已经开始新的尝试，这条 offer 留给下一个协商器
                    inbox.push_back(message);
                    return Err(TransferError::Connectivity(
                        "peer restarted negotiation".to_string(),
                    ));
                }
            },
            (_, SignalKind::Candidate) => {
                if self.remote_applied {
                    if message.attempt == self.current_attempt() {
                        self.apply_candidate(message.data).await;
                    }
                } else {
                    self.pending_candidates.push((message.attempt, message.data));
                }
            }
            (role, kind) => {
                debug!("Ignoring unexpected {:?} as {:?}", kind, role);
            }
        }
        Ok(())
    }

    async fn remote_description_applied(&mut self) {
        self.remote_applied = true;
        self.peer_seen = true;

        let attempt = self.current_attempt();
        let pending = std::mem::take(&mut self.pending_candidates);
        for (candidate_attempt, candidate) in pending {
            if candidate_attempt == attempt {
                self.apply_candidate(candidate).await;
            }
        }
    }

    async fn apply_candidate(&self, candidate: Value) {
        if let Some(link) = &self.link
            && let Err(e) = link.add_candidate(candidate).await
        {
            warn!("Failed to apply remote candidate: {}", e);
        }
    }
}
