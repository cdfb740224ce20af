//! 接收端：累积数据块并组装文件

use log::{debug, warn};

use crate::error::{Result, TransferError};
use crate::transfer::{ControlMessage, FileMetadata, Progress, ReceivedFile};
use crate::transport::Frame;
use bytes::{Bytes, BytesMut};

/// 处理一帧之后的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveStep {
    /// 收到元数据，开始新一轮接收
    Started(FileMetadata),
    /// 收到一个数据块
    Progress(Progress),
    /// 发送端声明发送完毕
    Completed { total_chunks: u32 },
    /// 与接收无关的帧
    Ignored,
}

/// 数据块累加器
///
/// 已接收字节数任何时候都不超过声明的文件大小。用 `expecting` 创建时，
/// 元数据帧必须与会话中声明的文件一致。
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    expected: Option<FileMetadata>,
    metadata: Option<FileMetadata>,
    chunks: Vec<Bytes>,
    received: u64,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以会话声明的文件元数据为准
    pub fn expecting(expected: FileMetadata) -> Self {
        Self {
            expected: Some(expected),
            ..Self::default()
        }
    }

    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.metadata.as_ref()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    pub fn handle_frame(&mut self, frame: Frame) -> Result<ReceiveStep> {
        match frame {
            Frame::Text(text) => self.handle_control(&text),
            Frame::Binary(chunk) => self.push_chunk(chunk).map(ReceiveStep::Progress),
        }
    }

    fn handle_control(&mut self, text: &str) -> Result<ReceiveStep> {
        match ControlMessage::parse(text) {
            Some(ControlMessage::Metadata(metadata)) => {
                debug!(
                    "Receiving {} ({} bytes, {})",
                    metadata.name, metadata.size, metadata.mime_type
                );
                self.discard();
                self.check_declared(&metadata)?;
                self.metadata = Some(metadata.clone());
                Ok(ReceiveStep::Started(metadata))
            }
            Some(ControlMessage::Complete { total_chunks }) => {
                if self.metadata.is_none() {
                    return Err(TransferError::Protocol(
                        "completion before metadata".to_string(),
                    ));
                }
                if total_chunks as usize != self.chunks.len() {
                    warn!(
                        "Sender reported {} chunks, received {}",
                        total_chunks,
                        self.chunks.len()
                    );
                }
                Ok(ReceiveStep::Completed { total_chunks })
            }
            Some(other) => {
                debug!("Ignoring control message on receiving side: {:?}", other);
                Ok(ReceiveStep::Ignored)
            }
            None => {
                debug!("Ignoring unrecognized text frame ({} bytes)", text.len());
                Ok(ReceiveStep::Ignored)
            }
        }
    }

    fn check_declared(&self, metadata: &FileMetadata) -> Result<()> {
        let Some(expected) = &self.expected else {
            return Ok(());
        };
        if metadata.size != expected.size {
            return Err(TransferError::Integrity {
                expected: expected.size,
                received: metadata.size,
            });
        }
        if metadata.name != expected.name {
            return Err(TransferError::Protocol(format!(
                "sender announced '{}' but the session declared '{}'",
                metadata.name, expected.name
            )));
        }
        Ok(())
    }

    fn push_chunk(&mut self, chunk: Bytes) -> Result<Progress> {
        let Some(metadata) = &self.metadata else {
            return Err(TransferError::Protocol("chunk before metadata".to_string()));
        };
        let total = metadata.size;
        let received = self.received + chunk.len() as u64;
        if received > total {
            return Err(TransferError::Integrity {
                expected: total,
                received,
            });
        }
        self.received = received;
        self.chunks.push(chunk);
        Ok(Progress::new(received, total))
    }

    /// 组装文件；长度不等于声明大小时返回完整性错误
    ///
    /// 无论成功与否，累积的数据块都会被释放。
    pub fn assemble(&mut self) -> Result<ReceivedFile> {
        let metadata = self
            .metadata
            .take()
            .ok_or_else(|| TransferError::Protocol("nothing to assemble".to_string()))?;
        let chunks = std::mem::take(&mut self.chunks);
        let received = std::mem::take(&mut self.received);

        if received != metadata.size {
            return Err(TransferError::Integrity {
                expected: metadata.size,
                received,
            });
        }

        let data = if chunks.len() == 1 {
            chunks.into_iter().next().unwrap_or_default()
        } else {
            let mut buf = BytesMut::with_capacity(usize::try_from(received).unwrap_or(0));
            for chunk in chunks {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        };

        Ok(ReceivedFile { metadata, data })
    }

    /// 丢弃已接收的数据
    pub fn discard(&mut self) {
        self.metadata = None;
        self.chunks.clear();
        self.received = 0;
    }
}
