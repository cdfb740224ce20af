//! 应用配置和持久化
//!
//! 提供信令服务地址、下载目录以及传输参数的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// 单个数据块大小 (16 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// 缓冲水位线 = 块大小的倍数
pub const DEFAULT_BUFFER_WATERMARK_CHUNKS: usize = 10;

/// 连接失败后放弃点对点传输之前的最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 传输参数
///
/// 默认值即协议常量；配置文件可以覆盖它们（主要用于调试和测试）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// 数据块大小（字节）
    pub chunk_size: usize,
    /// 发送缓冲超过 `chunk_size * buffer_watermark_chunks` 时暂停发送
    pub buffer_watermark_chunks: usize,
    /// 缓冲排空检查间隔（毫秒）
    pub drain_poll_ms: u64,
    /// 信令轮询间隔（毫秒）
    pub signal_poll_ms: u64,
    /// 等待对端连接的超时（秒）
    pub connect_timeout_secs: u64,
    /// 最大重试次数
    pub max_retries: u32,
    /// 关闭通道前等待缓冲排空的上限（毫秒）
    pub flush_timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_watermark_chunks: DEFAULT_BUFFER_WATERMARK_CHUNKS,
            drain_poll_ms: 50,
            signal_poll_ms: 1000,
            connect_timeout_secs: 30,
            max_retries: DEFAULT_MAX_RETRIES,
            flush_timeout_ms: 5000,
        }
    }
}

impl TransferConfig {
    /// 缓冲水位线（字节）
    pub fn buffer_watermark(&self) -> usize {
        self.chunk_size * self.buffer_watermark_chunks
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }

    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.signal_poll_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// 应用设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 信令服务地址
    pub rendezvous_url: String,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 详细日志模式
    pub verbose: bool,
    /// 传输参数
    pub transfer: TransferConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            rendezvous_url: "http://127.0.0.1:8787".to_string(),
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            verbose: false,
            transfer: TransferConfig::default(),
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("peerdrop");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }
}
