//! WebRTC 传输实现
//!
//! 基于 webrtc-rs 的 `RTCPeerConnection` + 单个有序可靠数据通道。
//! 候选地址采用 trickle 方式逐个上报，不等待 ICE 收集完成。

use crate::error::{Result, TransferError};
use crate::transport::{
    DataChannel, Frame, LinkEvent, LinkEvents, LinkState, PeerConnector, PeerLink,
    TransportConfig,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// 文件数据通道标签
const CHANNEL_LABEL: &str = "file";

fn rtc_error(e: impl std::fmt::Display) -> TransferError {
    TransferError::Connectivity(e.to_string())
}

fn protocol_error(e: impl std::fmt::Display) -> TransferError {
    TransferError::Protocol(e.to_string())
}

/// WebRTC 链路工厂
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcConnector;

impl WebRtcConnector {
    pub fn new() -> Self {
        Self
    }

    fn ice_servers(config: &TransportConfig) -> Vec<RTCIceServer> {
        let source = if config.ice_servers.is_empty() {
            TransportConfig::public_stun()
        } else {
            config.clone()
        };
        source
            .ice_servers
            .into_iter()
            .map(|server| RTCIceServer {
                urls: server.urls,
                username: server.username.unwrap_or_default(),
                credential: server.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect()
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn open(&self, config: &TransportConfig) -> Result<(Box<dyn PeerLink>, LinkEvents)> {
        let mut media_engine = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(rtc_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: Self::ice_servers(config),
                ..Default::default()
            })
            .await
            .map_err(rtc_error)?,
        );

        let (tx, rx) = mpsc::unbounded_channel();

        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                // None 表示本地收集结束
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_value(init) {
                        Ok(value) => {
                            let _ = tx.send(LinkEvent::Candidate(value));
                        }
                        Err(e) => warn!("Failed to encode ICE candidate: {}", e),
                    },
                    Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let state_tx = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
                    RTCPeerConnectionState::Connected => {
                        info!("WebRTC connection established");
                        Some(LinkState::Connected)
                    }
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        warn!("WebRTC connection lost: {:?}", state);
                        Some(LinkState::Failed)
                    }
                    _ => None,
                };
                if let Some(mapped) = mapped {
                    let _ = tx.send(LinkEvent::State(mapped));
                }
            })
        }));

        // 应答方在对端打开通道时收到它
        let remote_tx = tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = remote_tx.clone();
            Box::pin(async move {
                debug!("Remote data channel '{}' announced", dc.label());
                attach_channel(&dc, tx);
            })
        }));

        let link = WebRtcLink { pc, events: tx };
        Ok((Box::new(link), rx))
    }
}

/// 注册数据通道回调，打开后通过事件上报
fn attach_channel(dc: &Arc<RTCDataChannel>, tx: mpsc::UnboundedSender<LinkEvent>) {
    let open_tx = tx.clone();
    let open_dc = dc.clone();
    dc.on_open(Box::new(move || {
        let tx = open_tx.clone();
        let dc = open_dc.clone();
        Box::pin(async move {
            debug!("Data channel '{}' open", dc.label());
            let channel: Arc<dyn DataChannel> = Arc::new(WebRtcChannel { dc });
            let _ = tx.send(LinkEvent::ChannelOpen(channel));
        })
    }));

    let message_tx = tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = message_tx.clone();
        Box::pin(async move {
            let frame = if msg.is_string {
                Frame::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                Frame::Binary(msg.data)
            };
            let _ = tx.send(LinkEvent::Frame(frame));
        })
    }));

    let close_tx = tx;
    dc.on_close(Box::new(move || {
        let tx = close_tx.clone();
        Box::pin(async move {
            let _ = tx.send(LinkEvent::State(LinkState::Failed));
        })
    }));
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl WebRtcLink {
    async fn local_description(&self) -> Result<Value> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| rtc_error("no local description"))?;
        serde_json::to_value(desc).map_err(protocol_error)
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<Value> {
        let dc = self
            .pc
            .create_data_channel(
                CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(rtc_error)?;
        attach_channel(&dc, self.events.clone());

        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(rtc_error)?;
        self.local_description().await
    }

    async fn accept_offer(&self, offer: Value) -> Result<Value> {
        let desc: RTCSessionDescription = serde_json::from_value(offer).map_err(protocol_error)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(rtc_error)?;

        let answer = self.pc.create_answer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(rtc_error)?;
        self.local_description().await
    }

    async fn apply_answer(&self, answer: Value) -> Result<()> {
        let desc: RTCSessionDescription =
            serde_json::from_value(answer).map_err(protocol_error)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(rtc_error)
    }

    async fn add_candidate(&self, candidate: Value) -> Result<()> {
        let init: RTCIceCandidateInit =
            serde_json::from_value(candidate).map_err(protocol_error)?;
        self.pc.add_ice_candidate(init).await.map_err(rtc_error)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Peer connection close error: {}", e);
        }
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    async fn send(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Text(text) => self.dc.send_text(text).await.map_err(rtc_error)?,
            Frame::Binary(data) => self.dc.send(&data).await.map_err(rtc_error)?,
        };
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!("Data channel close error: {}", e);
        }
    }
}
