//! PeerDrop CLI
//!
//! 命令行客户端：用会话码点对点收发文件

mod console;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::ConsoleObserver;
use peerdrop_core::{
    AppSettings, HttpRendezvous, OutgoingFile, TransferMachine, TransferOutcome, WebRtcConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerdrop", version, about = "PeerDrop - 点对点文件传输")]
struct Cli {
    /// 信令服务地址 (覆盖配置文件)
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 发送文件
    Send {
        /// 要发送的文件路径
        file: PathBuf,
    },
    /// 用会话码接收文件
    Receive {
        /// 发送端显示的会话码
        code: String,
        /// 保存目录 (默认: 配置中的下载目录)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 查看或修改配置
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 显示当前配置
    Show,
    /// 设置信令服务地址
    SetServer { url: String },
    /// 设置下载目录
    SetDownloadDir { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = AppSettings::load();
    if let Some(server) = &cli.server {
        settings.rendezvous_url.clone_from(server);
    }
    init_logging(cli.verbose || settings.verbose);

    match cli.command {
        Commands::Send { file } => send(&settings, file).await,
        Commands::Receive { code, output } => {
            let dir = output.unwrap_or_else(|| settings.download_dir.clone());
            receive(&settings, &code, dir).await
        }
        Commands::Config { action } => config(settings, action.unwrap_or(ConfigAction::Show)),
    }
}

fn init_logging(verbose: bool) {
    let _ = tracing_log::LogTracer::init();

    let default = if verbose {
        "info,peerdrop_core=debug"
    } else {
        "warn"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn machine(settings: &AppSettings) -> Result<TransferMachine> {
    let api = HttpRendezvous::new(&settings.rendezvous_url)?;
    Ok(TransferMachine::new(
        Arc::new(api),
        Arc::new(WebRtcConnector::new()),
        settings.transfer.clone(),
        Arc::new(ConsoleObserver::new()),
    ))
}

/// Ctrl-C 取消当前传输
fn cancel_on_ctrl_c(machine: &TransferMachine) {
    let handle = machine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
}

async fn send(settings: &AppSettings, path: PathBuf) -> Result<()> {
    let file = OutgoingFile::from_path(&path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    println!(
        "📤 发送文件: {} ({} bytes, {})",
        file.metadata().name,
        file.metadata().size,
        file.metadata().mime_type
    );

    let mut machine = machine(settings)?;
    cancel_on_ctrl_c(&machine);

    match machine.create_session(file).await? {
        TransferOutcome::Completed(_) => {}
        TransferOutcome::Fallback(request) => {
            tracing::warn!(
                "Direct transfer of {} gave up after {} attempts",
                request.metadata().name,
                request.retries
            );
            println!("   请改用服务器上传: {}", path.display());
        }
        TransferOutcome::Cancelled => println!("   传输已取消"),
    }
    Ok(())
}

async fn receive(settings: &AppSettings, code: &str, dir: PathBuf) -> Result<()> {
    println!("📥 接收模式 (保存到: {})", dir.display());

    let mut machine = machine(settings)?;
    cancel_on_ctrl_c(&machine);

    match machine.join_session(code).await? {
        TransferOutcome::Completed(Some(file)) => {
            let saved = file.save_to(&dir).await?;
            println!("💾 已保存: {}", saved.display());
        }
        TransferOutcome::Cancelled => println!("   传输已取消"),
        TransferOutcome::Completed(None) | TransferOutcome::Fallback(_) => {}
    }
    Ok(())
}

fn config(mut settings: AppSettings, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("配置文件: {}", AppSettings::config_path().display());
            println!("信令服务: {}", settings.rendezvous_url);
            println!("下载目录: {}", settings.download_dir.display());
            println!(
                "分块大小: {} bytes, 连接超时: {}s, 最大重试: {}",
                settings.transfer.chunk_size,
                settings.transfer.connect_timeout_secs,
                settings.transfer.max_retries
            );
            return Ok(());
        }
        ConfigAction::SetServer { url } => settings.rendezvous_url = url,
        ConfigAction::SetDownloadDir { path } => settings.download_dir = path,
    }
    settings.save()?;
    println!("✅ 配置已保存");
    Ok(())
}
