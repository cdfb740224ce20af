//! 分块传输引擎
//!
//! 包含:
//! - 文件元数据与文件来源 (磁盘路径 / 内存缓冲)
//! - 数据通道上的控制消息格式
//! - 发送端：按块读取、背压等待、流式发送
//! - 接收端：累积数据块、校验长度并组装

pub mod file;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use file::{ChunkReader, FileMetadata, FileSource, OutgoingFile, ReceivedFile};
pub use protocol::ControlMessage;
pub use receiver::{ChunkAssembler, ReceiveStep};
pub use sender::{flush, send_file, wait_for_drain};

/// 传输进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// 百分比 `[0, 100]`
    pub percent: u8,
    /// 已传输字节数
    pub bytes: u64,
    /// 文件总字节数
    pub total: u64,
}

impl Progress {
    /// `min(100, round(bytes / total * 100))`
    pub fn new(bytes: u64, total: u64) -> Self {
        let percent = if total == 0 {
            100
        } else {
            let scaled = (u128::from(bytes) * 200 + u128::from(total)) / (u128::from(total) * 2);
            u8::try_from(scaled.min(100)).unwrap_or(100)
        };
        Self {
            percent,
            bytes,
            total,
        }
    }
}
