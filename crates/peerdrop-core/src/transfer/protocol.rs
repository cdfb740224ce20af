//! 数据通道消息格式
//!
//! 控制消息是 JSON 文本帧，以 `type` 字段区分；文件数据块是二进制帧，
//! 不带序号，顺序由通道保证。
//!
//! 发送顺序: `metadata` -> 数据块* -> `complete`，接收端校验后回复
//! `verified`，校验失败回复 `error`。

use crate::transfer::FileMetadata;
use crate::transport::Frame;
use serde::{Deserialize, Serialize};

/// 控制消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// 文件元数据，在第一个数据块之前发送
    Metadata(FileMetadata),
    /// 发送完毕
    #[serde(rename_all = "camelCase")]
    Complete { total_chunks: u32 },
    /// 接收端确认文件完整
    Verified,
    /// 接收端校验失败
    Error { message: String },
}

impl ControlMessage {
    /// 解析文本帧，无法识别时返回 `None`
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn to_frame(&self) -> Frame {
        // 枚举只含字符串和整数字段，序列化不会失败
        Frame::Text(serde_json::to_string(self).unwrap_or_default())
    }
}
