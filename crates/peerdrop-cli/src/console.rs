//! 终端输出的传输观察者

use peerdrop_core::{FileReady, Progress, StateContext, TransferObserver, TransferState};
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};

const BAR_WIDTH: usize = 30;

pub struct ConsoleObserver {
    last_percent: AtomicU8,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self {
            last_percent: AtomicU8::new(u8::MAX),
        }
    }
}

impl Default for ConsoleObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferObserver for ConsoleObserver {
    fn on_state_change(&self, state: TransferState, context: &StateContext) {
        match state {
            TransferState::Idle => println!("⏹️  已停止"),
            TransferState::CreatingRoom if context.retry_count > 0 => {
                println!("🔁 第 {} 次重试...", context.retry_count);
            }
            TransferState::CreatingRoom => println!("🏠 准备会话..."),
            TransferState::WaitingForPeer => {
                if let Some(code) = &context.session_code {
                    println!("🔑 会话码: {}", code);
                }
                println!("⏳ 等待对端...");
            }
            TransferState::Connecting => println!("🔗 正在建立连接..."),
            TransferState::Transferring => {
                self.last_percent.store(u8::MAX, Ordering::Relaxed);
                println!("🚀 开始传输");
            }
            TransferState::Verifying => println!("\n🔍 校验中..."),
            TransferState::Completed => println!("✅ 传输完成"),
            TransferState::Failed => {
                let stage = context
                    .failure
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!(
                    "❌ 传输失败 ({}): {}",
                    stage,
                    context.message.as_deref().unwrap_or("")
                );
            }
            TransferState::Fallback => println!("☁️  无法直连，转为服务器中转"),
        }
    }

    fn on_progress(&self, progress: Progress) {
        if self.last_percent.swap(progress.percent, Ordering::Relaxed) == progress.percent {
            return;
        }
        let filled = usize::from(progress.percent) * BAR_WIDTH / 100;
        print!(
            "\r   [{}{}] {:>3}% ({}/{} bytes)",
            "█".repeat(filled),
            "░".repeat(BAR_WIDTH - filled),
            progress.percent,
            progress.bytes,
            progress.total
        );
        let _ = std::io::stdout().flush();
    }

    fn on_file_ready(&self, file: &FileReady) {
        match file {
            FileReady::Received(file) => {
                println!("📦 收到 {} ({} bytes)", file.metadata.name, file.data.len());
            }
            FileReady::Fallback(request) => {
                println!(
                    "📤 {} 已交给上传流程 (重试 {} 次: {})",
                    request.metadata().name,
                    request.retries,
                    request.reason
                );
            }
        }
    }
}
