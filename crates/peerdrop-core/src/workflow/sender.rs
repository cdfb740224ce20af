//! 发送端工作流
//!
//! 1. 创建会话 (房间)
//! 2. 作为发起方协商连接，30 秒内未连通按连接失败处理
//! 3. 流式发送文件，等待接收端确认
//! 4. 连接失败时在同一会话内重试，连续失败用完重试次数后回退

use log::{debug, info, warn};

use crate::error::{FailureContext, Result, TransferError};
use crate::rendezvous::RendezvousClient;
use crate::transfer::{ControlMessage, OutgoingFile, flush, send_file};
use crate::transport::{Frame, LinkEvent, LinkEvents, LinkState, Role, SignalInbox};
use crate::workflow::{
    AttemptResources, FileReady, TransferMachine, TransferOutcome, TransferState,
};

impl TransferMachine {
    /// 发送文件
    ///
    /// 一直运行到 `COMPLETED`、`FALLBACK`、`FAILED` 或被取消。`FAILED` 时
    /// 返回对应的错误。
    pub async fn create_session(&mut self, file: OutgoingFile) -> Result<TransferOutcome> {
        let token = self.begin();
        let mut rendezvous = self.rendezvous();

        self.transition(TransferState::CreatingRoom);
        let code = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(self.cancelled(&mut rendezvous).await),
            result = rendezvous.create_session(file.metadata()) => result,
        };
        let mut code = match code {
            Ok(code) => code,
            Err(e) => {
                self.fail(FailureContext::Session, &e);
                return Err(e);
            }
        };
        info!("Session {} created for {}", code, file.metadata().name);

        let mut inbox = self.inbox(&rendezvous)?;
        let mut attempt: u32 = 0;

        loop {
            let session_code = code.clone();
            self.update_context(|ctx| ctx.session_code = Some(session_code));
            self.transition(TransferState::WaitingForPeer);

            let mut resources = AttemptResources::default();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = self.send_attempt(&rendezvous, &mut inbox, &mut resources, &file, attempt) => Some(result),
            };
            let connected = resources.connected;
            resources.teardown().await;

            let error = match result {
                None => return Ok(self.cancelled(&mut rendezvous).await),
                Some(Ok(())) => {
                    self.transition(TransferState::Completed);
                    rendezvous.close_session().await;
                    return Ok(TransferOutcome::Completed(None));
                }
                Some(Err(e)) => e,
            };

            if !error.is_connectivity() {
                let context = match &error {
                    TransferError::PeerRejected(_) | TransferError::Integrity { .. } => {
                        FailureContext::Verify
                    }
                    TransferError::Protocol(_) => FailureContext::Send,
                    other => other.context(),
                };
                self.fail(context, &error);
                rendezvous.close_session().await;
                return Err(error);
            }

            if self.record_connectivity_failure(&error, connected) {
                self.transition(TransferState::Fallback);
                rendezvous.close_session().await;
                let request = self
                    .bridge
                    .hand_over(error.to_string(), self.retry_count, file);
                self.observer
                    .on_file_ready(&FileReady::Fallback(request.clone()));
                return Ok(TransferOutcome::Fallback(request));
            }

            self.transition(TransferState::CreatingRoom);
            let reopened = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(self.cancelled(&mut rendezvous).await),
                result = rendezvous.reopen_session(file.metadata()) => result,
            };
            match reopened {
                Ok(reopened) if reopened == code => {}
                Ok(reopened) => {
                    warn!("Session {} expired, continuing on {}", code, reopened);
                    code = reopened;
                    inbox = self.inbox(&rendezvous)?;
                }
                Err(e) => {
                    self.fail(FailureContext::Session, &e);
                    return Err(e);
                }
            }
            attempt += 1;
        }
    }

    async fn send_attempt(
        &self,
        rendezvous: &RendezvousClient,
        inbox: &mut SignalInbox,
        resources: &mut AttemptResources,
        file: &OutgoingFile,
        attempt: u32,
    ) -> Result<()> {
        self.connect(rendezvous, inbox, resources, Role::Initiator, attempt)
            .await?;
        self.transition(TransferState::Transferring);

        let connection = resources.connection()?;
        let observer = self.observer.clone();
        send_file(connection.channel.as_ref(), file, &self.config, |progress| {
            observer.on_progress(progress);
        })
        .await?;

        self.transition(TransferState::Verifying);
        wait_for_verification(&mut connection.events).await?;

        flush(
            connection.channel.as_ref(),
            self.config.flush_timeout(),
            self.config.drain_poll_interval(),
        )
        .await;
        Ok(())
    }
}

/// 等待接收端确认
async fn wait_for_verification(events: &mut LinkEvents) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Frame(Frame::Text(text)) => match ControlMessage::parse(&text) {
                Some(ControlMessage::Verified) => {
                    debug!("Receiver verified the file");
                    return Ok(());
                }
                Some(ControlMessage::Error { message }) => {
                    return Err(TransferError::PeerRejected(message));
                }
                _ => debug!("Ignoring text frame while waiting for verification"),
            },
            LinkEvent::State(LinkState::Failed) => {
                return Err(TransferError::Connectivity(
                    "peer disconnected before verification".to_string(),
                ));
            }
            _ => {}
        }
    }
    Err(TransferError::Connectivity(
        "peer link dropped before verification".to_string(),
    ))
}
