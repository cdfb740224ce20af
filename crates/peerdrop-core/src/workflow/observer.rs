//! 传输回调

use crate::transfer::{Progress, ReceivedFile};
use crate::workflow::{FallbackRequest, StateContext, TransferState};
use tokio::sync::mpsc;

/// 终态时交给调用方的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileReady {
    /// 接收完成并通过校验的文件
    Received(ReceivedFile),
    /// 点对点传输放弃，原始文件交回调用方上传
    Fallback(FallbackRequest),
}

/// 传输回调
pub trait TransferObserver: Send + Sync {
    /// 状态变化
    fn on_state_change(&self, state: TransferState, context: &StateContext);
    /// 进度更新
    fn on_progress(&self, progress: Progress);
    /// `COMPLETED` (接收端) 或 `FALLBACK` 时调用一次
    fn on_file_ready(&self, file: &FileReady);
}

/// 什么都不做的回调
pub struct NoopObserver;

impl TransferObserver for NoopObserver {
    fn on_state_change(&self, _state: TransferState, _context: &StateContext) {}

    fn on_progress(&self, _progress: Progress) {}

    fn on_file_ready(&self, _file: &FileReady) {}
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    State {
        state: TransferState,
        context: StateContext,
    },
    Progress(Progress),
    FileReady(FileReady),
}

/// 把回调转成事件流的简单实现
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TransferObserver for ChannelObserver {
    fn on_state_change(&self, state: TransferState, context: &StateContext) {
        let _ = self.tx.send(TransferEvent::State {
            state,
            context: context.clone(),
        });
    }

    fn on_progress(&self, progress: Progress) {
        let _ = self.tx.send(TransferEvent::Progress(progress));
    }

    fn on_file_ready(&self, file: &FileReady) {
        let _ = self.tx.send(TransferEvent::FileReady(file.clone()));
    }
}
