//! 接收端工作流
//!
//! 1. 用会话码加入会话，取得文件元数据
//! 2. 作为应答方协商连接
//! 3. 累积数据块，完成后校验长度并回复确认；文件名和大小以会话中
//!    声明的元数据为准
//!
//! 接收端没有可以交给回退流程的文件：连接失败时重新加入同一会话重试，
//! 连续失败用完重试次数后进入 `FAILED`。发送端关闭会话时立即以
//! `session` 阶段失败。

use log::{debug, info, warn};

use crate::error::{FailureContext, Result, TransferError};
use crate::rendezvous::RendezvousClient;
use crate::transfer::{
    ChunkAssembler, ControlMessage, FileMetadata, ReceiveStep, ReceivedFile, flush,
};
use crate::transport::{DataChannel, LinkEvent, LinkState, Role, SignalInbox};
use crate::workflow::{
    AttemptResources, FileReady, TransferMachine, TransferOutcome, TransferState,
};

impl TransferMachine {
    /// 用会话码接收文件
    ///
    /// 一直运行到 `COMPLETED`、`FAILED` 或被取消。
    pub async fn join_session(&mut self, code: &str) -> Result<TransferOutcome> {
        let token = self.begin();
        let mut rendezvous = self.rendezvous();

        self.transition(TransferState::CreatingRoom);
        let joined = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(self.cancelled(&mut rendezvous).await),
            result = rendezvous.join_session(code) => result,
        };
        let metadata = match joined {
            Ok(metadata) => metadata,
            Err(e) => {
                self.fail(FailureContext::Session, &e);
                return Err(e);
            }
        };
        let session_code = rendezvous
            .session()
            .map(|session| session.code.clone())
            .unwrap_or_else(|| code.to_string());
        info!(
            "Joined session {}: {} ({} bytes)",
            session_code, metadata.name, metadata.size
        );
        self.update_context(|ctx| ctx.session_code = Some(session_code.clone()));

        let mut inbox = self.inbox(&rendezvous)?;
        let mut min_attempt: u32 = 0;

        loop {
            self.transition(TransferState::WaitingForPeer);

            let mut resources = AttemptResources::default();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = self.receive_attempt(&rendezvous, &mut inbox, &mut resources, &metadata, min_attempt) => Some(result),
            };
            let connected = resources.connected;
            if let Some(adopted) = resources.adopted_attempt {
                min_attempt = min_attempt.max(adopted + 1);
            }
            resources.teardown().await;

            let error = match result {
                None => return Ok(self.cancelled(&mut rendezvous).await),
                Some(Ok(file)) => {
                    self.transition(TransferState::Completed);
                    self.observer
                        .on_file_ready(&FileReady::Received(file.clone()));
                    return Ok(TransferOutcome::Completed(Some(file)));
                }
                Some(Err(e)) => e,
            };

            if !error.is_connectivity() {
                let context = match &error {
                    TransferError::Integrity { .. } => FailureContext::Verify,
                    TransferError::Protocol(_) => FailureContext::Receive,
                    other => other.context(),
                };
                self.fail(context, &error);
                return Err(error);
            }

            if self.record_connectivity_failure(&error, connected) {
                self.fail(FailureContext::Connect, &error);
                return Err(error);
            }

            self.transition(TransferState::CreatingRoom);
            let rejoined = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(self.cancelled(&mut rendezvous).await),
                result = rendezvous.join_session(&session_code) => result,
            };
            if let Err(e) = rejoined {
                // 发送端已经放弃或会话过期
                self.fail(FailureContext::Session, &e);
                return Err(e);
            }
        }
    }

    async fn receive_attempt(
        &self,
        rendezvous: &RendezvousClient,
        inbox: &mut SignalInbox,
        resources: &mut AttemptResources,
        declared: &FileMetadata,
        min_attempt: u32,
    ) -> Result<ReceivedFile> {
        self.connect(rendezvous, inbox, resources, Role::Responder, min_attempt)
            .await?;
        self.transition(TransferState::Transferring);

        let connection = resources.connection()?;
        let channel = connection.channel.clone();
        let mut assembler = ChunkAssembler::expecting(declared.clone());

        let outcome = async {
            loop {
                let event = connection.events.recv().await.ok_or_else(|| {
                    TransferError::Connectivity("peer link dropped during transfer".to_string())
                })?;
                match event {
                    LinkEvent::Frame(frame) => match assembler.handle_frame(frame)? {
                        ReceiveStep::Started(metadata) => {
                            debug!("Transfer of {} started", metadata.name);
                        }
                        ReceiveStep::Progress(progress) => self.observer.on_progress(progress),
                        ReceiveStep::Completed { total_chunks } => {
                            debug!("Sender finished after {} chunks", total_chunks);
                            break;
                        }
                        ReceiveStep::Ignored => {}
                    },
                    LinkEvent::State(LinkState::Failed) => {
                        return Err(TransferError::Connectivity(
                            "peer disconnected during transfer".to_string(),
                        ));
                    }
                    _ => {}
                }
            }

            self.transition(TransferState::Verifying);
            assembler.assemble()
        }
        .await;

        match outcome {
            Ok(file) => {
                channel.send(ControlMessage::Verified.to_frame()).await?;
                self.drain(channel.as_ref()).await;
                Ok(file)
            }
            Err(e) => {
                assembler.discard();
                if !e.is_connectivity() {
                    self.reject(channel.as_ref(), &e).await;
                }
                Err(e)
            }
        }
    }

    /// 通知发送端校验失败
    async fn reject(&self, channel: &dyn DataChannel, error: &TransferError) {
        let message = ControlMessage::Error {
            message: error.to_string(),
        };
        if let Err(e) = channel.send(message.to_frame()).await {
            warn!("Failed to notify sender of rejection: {}", e);
            return;
        }
        self.drain(channel).await;
    }

    async fn drain(&self, channel: &dyn DataChannel) {
        flush(
            channel,
            self.config.flush_timeout(),
            self.config.drain_poll_interval(),
        )
        .await;
    }
}
