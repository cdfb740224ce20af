//! 回退桥接
//!
//! 点对点传输放弃后，把原始文件交还给调用方的集中式上传流程。
//! 这里只负责交接，不做任何上传。

use log::info;

use crate::transfer::{FileMetadata, OutgoingFile};
use std::sync::Arc;

/// 回退请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRequest {
    /// 最后一次连接失败的原因
    pub reason: String,
    /// 放弃前的失败次数
    pub retries: u32,
    /// 原始文件，未经任何修改
    pub file: OutgoingFile,
}

impl FallbackRequest {
    pub fn metadata(&self) -> &FileMetadata {
        self.file.metadata()
    }
}

/// 外部上传流程
pub trait FallbackHandler: Send + Sync {
    fn handle(&self, request: &FallbackRequest);
}

impl<F> FallbackHandler for F
where
    F: Fn(&FallbackRequest) + Send + Sync,
{
    fn handle(&self, request: &FallbackRequest) {
        self(request)
    }
}

/// 回退桥
#[derive(Clone, Default)]
pub struct FallbackBridge {
    handler: Option<Arc<dyn FallbackHandler>>,
}

impl FallbackBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(handler: Arc<dyn FallbackHandler>) -> Self {
        Self {
            handler: Some(handler),
        }
    }

    /// 构造回退请求并交给处理器
    pub fn hand_over(&self, reason: String, retries: u32, file: OutgoingFile) -> FallbackRequest {
        let request = FallbackRequest {
            reason,
            retries,
            file,
        };
        info!(
            "Handing {} ({} bytes) to fallback upload after {} failed attempts",
            request.metadata().name,
            request.metadata().size,
            retries
        );
        if let Some(handler) = &self.handler {
            handler.handle(&request);
        }
        request
    }
}
