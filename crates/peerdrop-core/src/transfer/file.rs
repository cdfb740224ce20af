//! 文件元数据与文件来源

use crate::error::{FailureContext, Result, TransferError};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// 文件元数据，由发送端在传输开始时声明一次
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        }
    }

    /// 按文件名猜测 MIME 类型
    pub fn guess(name: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        let mime_type = mime_guess::from_path(&name)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Self {
            name,
            size,
            mime_type,
        }
    }
}

/// 文件内容来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// 磁盘文件，只读、顺序读取
    Path(PathBuf),
    /// 内存缓冲
    Memory(Bytes),
}

/// 待发送的文件；回退上传时原样交还给调用方
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    metadata: FileMetadata,
    source: FileSource,
}

impl OutgoingFile {
    /// 从磁盘路径创建
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| TransferError::local(FailureContext::Read, e))?;
        if !meta.is_file() {
            return Err(TransferError::local(
                FailureContext::Read,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            metadata: FileMetadata::guess(name, meta.len()),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    /// 从内存缓冲创建
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            metadata: FileMetadata::guess(name, data.len() as u64),
            source: FileSource::Memory(data),
        }
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn source(&self) -> &FileSource {
        &self.source
    }

    /// 打开顺序读取器，读取量以声明的大小为上限
    pub async fn open(&self) -> Result<ChunkReader> {
        let inner = match &self.source {
            FileSource::Path(path) => ReaderInner::File(
                File::open(path)
                    .await
                    .map_err(|e| TransferError::local(FailureContext::Read, e))?,
            ),
            FileSource::Memory(data) => ReaderInner::Memory(data.clone()),
        };
        Ok(ChunkReader {
            inner,
            remaining: self.metadata.size,
        })
    }
}

enum ReaderInner {
    File(File),
    Memory(Bytes),
}

/// 按块顺序读取文件
pub struct ChunkReader {
    inner: ReaderInner,
    remaining: u64,
}

impl ChunkReader {
    /// 读取下一块，最多 `chunk_size` 字节；读完返回 `None`
    ///
    /// 文件在读取期间变短时返回 `UnexpectedEof`。
    pub async fn next_chunk(&mut self, chunk_size: usize) -> std::io::Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let want = usize::try_from(self.remaining)
            .unwrap_or(usize::MAX)
            .min(chunk_size);

        let chunk = match &mut self.inner {
            ReaderInner::Memory(data) => {
                if data.len() < want {
                    return Err(std::io::ErrorKind::UnexpectedEof.into());
                }
                data.split_to(want)
            }
            ReaderInner::File(file) => {
                let mut buf = BytesMut::zeroed(want);
                let mut filled = 0;
                while filled < want {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        return Err(std::io::ErrorKind::UnexpectedEof.into());
                    }
                    filled += n;
                }
                buf.freeze()
            }
        };

        self.remaining -= chunk.len() as u64;
        Ok(Some(chunk))
    }
}

/// 接收端组装完成的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

impl ReceivedFile {
    /// 保存到目录，文件名只保留最后一个路径分量
    pub async fn save_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| TransferError::local(FailureContext::Receive, e))?;

        let output_path = dir.join(safe_file_name(&self.metadata.name));
        tokio::fs::write(&output_path, &self.data)
            .await
            .map_err(|e| TransferError::local(FailureContext::Receive, e))?;
        Ok(output_path)
    }
}

/// 去掉路径分隔符和 `..`，避免写出目标目录
fn safe_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let base = normalized
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .next_back()
        .unwrap_or("");
    if base.is_empty() {
        "file".to_string()
    } else {
        base.to_string()
    }
}
