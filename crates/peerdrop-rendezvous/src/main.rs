//! PeerDrop Rendezvous
//!
//! 信令服务进程：
//! - 会话创建、查询与关闭
//! - 信令消息按角色排队，接收方轮询取走
//! - 后台清理过期会话

use anyhow::Result;
use clap::Parser;
use peerdrop_core::rendezvous::memory::DEFAULT_SESSION_TTL;
use peerdrop_core::{SessionStore, TransportConfig};
use peerdrop_rendezvous::AppState;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerdrop-rendezvous")]
#[command(about = "Signaling relay for PeerDrop transfers", long_about = None)]
struct Args {
    /// 监听地址
    #[arg(short, long, default_value = "0.0.0.0:8787")]
    bind: SocketAddr,

    /// 会话有效期 (秒)
    #[arg(long, default_value_t = DEFAULT_SESSION_TTL.as_secs())]
    ttl: u64,

    /// 不下发公共 STUN 服务器
    #[arg(long)]
    no_stun: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（peerdrop-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,peerdrop_core=debug")),
        )
        .try_init();

    let args = Args::parse();

    let transport = if args.no_stun {
        TransportConfig::default()
    } else {
        TransportConfig::public_stun()
    };
    let ttl = Duration::from_secs(args.ttl);
    let state = AppState::new(SessionStore::new(ttl, transport));

    let addr = peerdrop_rendezvous::spawn(args.bind, state.clone()).await?;
    tracing::info!("PeerDrop rendezvous listening on {}", addr);

    let purge = tokio::spawn(peerdrop_rendezvous::run_purge_loop(
        state,
        (ttl / 4).max(Duration::from_secs(1)),
    ));

    tokio::select! {
        res = purge => {
            tracing::error!("Purge task exited: {:?}", res);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
