//! 发送端：按块读取文件并写入数据通道
//!
//! 每个数据块发送前检查通道缓冲，超过水位线时暂停，等缓冲排空到水位线
//! 以下再继续。文件内容不会整体载入内存。

use log::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::{FailureContext, Result, TransferError};
use crate::transfer::{ControlMessage, OutgoingFile, Progress};
use crate::transport::{DataChannel, Frame};
use std::time::Duration;
use tokio::time::Instant;

/// 发送整个文件，返回发送的数据块数
///
/// 顺序为 `metadata`、数据块、`complete`。每个数据块写入通道后回调一次进度。
pub async fn send_file<F>(
    channel: &dyn DataChannel,
    file: &OutgoingFile,
    config: &TransferConfig,
    mut on_progress: F,
) -> Result<u32>
where
    F: FnMut(Progress) + Send,
{
    let metadata = file.metadata();
    let total = metadata.size;
    let watermark = config.buffer_watermark();
    let poll = config.drain_poll_interval();

    info!(
        "Sending {} ({} bytes, {} byte chunks)",
        metadata.name, total, config.chunk_size
    );
    channel
        .send(ControlMessage::Metadata(metadata.clone()).to_frame())
        .await?;

    let mut reader = file.open().await?;
    let mut sent: u64 = 0;
    let mut chunks: u32 = 0;

    loop {
        wait_for_drain(channel, watermark, poll).await?;

        let Some(chunk) = reader
            .next_chunk(config.chunk_size)
            .await
            .map_err(|e| TransferError::local(FailureContext::Read, e))?
        else {
            break;
        };

        sent += chunk.len() as u64;
        channel.send(Frame::Binary(chunk)).await?;
        chunks += 1;
        on_progress(Progress::new(sent, total));
    }

    channel
        .send(ControlMessage::Complete { total_chunks: chunks }.to_frame())
        .await?;
    debug!("Sent {} chunks ({} bytes)", chunks, sent);

    Ok(chunks)
}

/// 等待通道缓冲降到水位线以下
///
/// 通道在等待期间关闭时返回连接错误。
pub async fn wait_for_drain(
    channel: &dyn DataChannel,
    watermark: usize,
    poll: Duration,
) -> Result<()> {
    loop {
        if !channel.is_open() {
            return Err(TransferError::Connectivity(
                "data channel closed while sending".to_string(),
            ));
        }
        let buffered = channel.buffered_amount().await;
        if buffered <= watermark {
            return Ok(());
        }
        debug!("Send buffer at {} bytes, waiting for drain", buffered);
        tokio::time::sleep(poll).await;
    }
}

/// 关闭通道前等待缓冲清空，返回是否在超时前排空
pub async fn flush(channel: &dyn DataChannel, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while channel.is_open() {
        if channel.buffered_amount().await == 0 {
            return true;
        }
        if Instant::now() >= deadline {
            warn!("Data channel still buffered after {:?}, closing anyway", timeout);
            return false;
        }
        tokio::time::sleep(poll).await;
    }
    false
}
