//! 工作流模块
//!
//! `TransferMachine` 是传输状态的唯一持有者：负责状态转换、连接计时、
//! 重试计数和回退决策。
//!
//! 发送端: `create_session(file)`；接收端: `join_session(code)`。
//! 两者都一直运行到终态 (或被取消) 才返回。

pub mod fallback;
pub mod observer;
pub mod receiver;
pub mod sender;
pub mod state;

pub use fallback::{FallbackBridge, FallbackHandler, FallbackRequest};
pub use observer::{ChannelObserver, FileReady, NoopObserver, TransferEvent, TransferObserver};
pub use state::{StateContext, TransferState};

use log::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::{FailureContext, Result, TransferError};
use crate::rendezvous::{RendezvousApi, RendezvousClient};
use crate::transfer::ReceivedFile;
use crate::transport::{
    Connection, NegotiationStep, Negotiator, PeerConnector, Role, SignalInbox,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// 一次传输的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// 发送端为 `None`，接收端为校验通过的文件
    Completed(Option<ReceivedFile>),
    /// 点对点传输放弃，原始文件已交给回退桥
    Fallback(FallbackRequest),
    /// 调用方取消
    Cancelled,
}

/// 取消句柄，可以克隆后交给其他任务
///
/// 重复调用 `cancel` 没有额外效果。
#[derive(Clone, Default)]
pub struct CancelHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.lock().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().is_cancelled()
    }

    /// 为新的传输换一个新的令牌
    fn renew(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.lock() = token.clone();
        token
    }

    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 一次连接尝试持有的资源，尝试结束后统一释放
#[derive(Default)]
struct AttemptResources {
    negotiator: Option<Negotiator>,
    connection: Option<Connection>,
    /// 应答方采用的尝试序号
    adopted_attempt: Option<u32>,
    /// 本次尝试是否到达过 `CONNECTED`
    connected: bool,
}

impl AttemptResources {
    async fn teardown(&mut self) {
        if let Some(negotiator) = self.negotiator.take() {
            negotiator.abort().await;
        }
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| TransferError::Connectivity("no open connection".to_string()))
    }
}

/// 传输状态机
pub struct TransferMachine {
    api: Arc<dyn RendezvousApi>,
    connector: Arc<dyn PeerConnector>,
    config: TransferConfig,
    observer: Arc<dyn TransferObserver>,
    bridge: FallbackBridge,
    state: Mutex<TransferState>,
    context: Mutex<StateContext>,
    retry_count: u32,
    cancel: CancelHandle,
}

impl TransferMachine {
    pub fn new(
        api: Arc<dyn RendezvousApi>,
        connector: Arc<dyn PeerConnector>,
        config: TransferConfig,
        observer: Arc<dyn TransferObserver>,
    ) -> Self {
        Self {
            api,
            connector,
            config,
            observer,
            bridge: FallbackBridge::new(),
            state: Mutex::new(TransferState::Idle),
            context: Mutex::new(StateContext::default()),
            retry_count: 0,
            cancel: CancelHandle::default(),
        }
    }

    /// 设置回退上传处理器
    pub fn with_fallback_handler(mut self, handler: Arc<dyn FallbackHandler>) -> Self {
        self.bridge = FallbackBridge::with_handler(handler);
        self
    }

    pub fn state(&self) -> TransferState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前传输的连接失败次数
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// 取消当前传输；空闲时只把状态置为 `IDLE`
    pub fn cancel(&self) {
        self.cancel.cancel();
        if self.state() != TransferState::Idle {
            self.transition(TransferState::Idle);
        }
    }

    /// 新传输开始：重置计数器和上下文，换新的取消令牌
    fn begin(&mut self) -> CancellationToken {
        self.retry_count = 0;
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = StateContext::default();
        self.cancel.renew()
    }

    fn rendezvous(&self) -> RendezvousClient {
        RendezvousClient::new(self.api.clone(), self.config.signal_poll_interval())
    }

    fn update_context(&self, update: impl FnOnce(&mut StateContext)) {
        update(&mut self.context.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn transition(&self, next: TransferState) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = *state;
            *state = next;
            previous
        };
        if !previous.can_transition_to(next) {
            warn!("Unexpected transition {} -> {}", previous, next);
        }
        debug!("State {} -> {}", previous, next);

        let context = self
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.observer.on_state_change(next, &context);
    }

    /// 非连接类错误：进入 `FAILED`
    fn fail(&self, context: FailureContext, error: &TransferError) {
        warn!("Transfer failed during {}: {}", context, error);
        self.update_context(|ctx| {
            ctx.failure = Some(context);
            ctx.message = Some(error.to_string());
        });
        self.transition(TransferState::Failed);
    }

    /// 记录一次连接失败，返回是否已经用完重试次数
    ///
    /// 计数的是连续失败。已经连通过的尝试中途断开会清零计数，本身不计入，
    /// 所以连通之后不会直接回退。
    fn record_connectivity_failure(&mut self, error: &TransferError, connected: bool) -> bool {
        if connected {
            self.retry_count = 0;
            warn!("Connection lost after connecting, retrying: {}", error);
        } else {
            self.retry_count = (self.retry_count + 1).min(self.config.max_retries);
            warn!(
                "Connection attempt failed ({}/{}): {}",
                self.retry_count, self.config.max_retries, error
            );
        }
        let retries = self.retry_count;
        self.update_context(|ctx| {
            ctx.retry_count = retries;
            ctx.message = Some(error.to_string());
        });
        !connected && retries >= self.config.max_retries
    }

    /// 开始协商并等待连接建立
    ///
    /// 对端出现时进入 `CONNECTING`。从开始到数据通道打开受连接计时器约束。
    async fn connect(
        &self,
        rendezvous: &RendezvousClient,
        inbox: &mut SignalInbox,
        resources: &mut AttemptResources,
        role: Role,
        attempt: u32,
    ) -> Result<()> {
        let signals = rendezvous
            .channel()
            .ok_or_else(|| TransferError::SessionNotFound("no active session".to_string()))?;
        let transport = rendezvous.transport_config();
        let timeout = self.config.connect_timeout();

        let negotiate = async {
            let negotiator = Negotiator::start(
                self.connector.as_ref(),
                &transport,
                signals,
                role,
                attempt,
            )
            .await?;
            resources.negotiator = Some(negotiator);

            loop {
                let negotiator = resources.negotiator.as_mut().ok_or_else(|| {
                    TransferError::Connectivity("negotiation not started".to_string())
                })?;
                match negotiator.next_step(inbox).await? {
                    NegotiationStep::PeerSeen => {
                        if resources.adopted_attempt.is_none() {
                            resources.adopted_attempt = negotiator.attempt();
                        }
                        self.transition(TransferState::Connecting);
                    }
                    NegotiationStep::Connected(connection) => {
                        resources.adopted_attempt = negotiator.attempt();
                        resources.connected = true;
                        resources.negotiator = None;
                        resources.connection = Some(connection);
                        return Ok::<(), TransferError>(());
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, negotiate).await {
            Ok(result) => result,
            Err(_) => {
                info!("No peer connection within {:?}", timeout);
                Err(TransferError::Timeout(timeout.as_secs()))
            }
        }
    }

    fn inbox(&self, rendezvous: &RendezvousClient) -> Result<SignalInbox> {
        rendezvous
            .channel()
            .map(|signals| SignalInbox::new(&signals))
            .ok_or_else(|| TransferError::SessionNotFound("no active session".to_string()))
    }

    /// 取消后的清理：关闭会话，状态回到 `IDLE`
    async fn cancelled(&self, rendezvous: &mut RendezvousClient) -> TransferOutcome {
        info!("Transfer cancelled");
        rendezvous.close_session().await;
        self.transition(TransferState::Idle);
        TransferOutcome::Cancelled
    }
}
