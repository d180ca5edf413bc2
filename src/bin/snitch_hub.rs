//! snitch-hub - 防火墙节点控制面
//!
//! - `serve`: 启动 Hub
//! - `status`: 查询 Hub 状态（可等待首个节点接入）
//! - `firewall`: 启停全部节点的拦截
//! - `nodes`: 列出在线节点

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use snitch_hub::{
    cleanup_stale_hub, is_hub_running, Action, Hub, HubClient, HubClientConfig, HubConfig,
    ListenAddr, NodeInfo, NotificationAction, QueryType,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "snitch-hub", version, about = "Fleet control plane for outbound-firewall nodes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动 Hub
    Serve {
        /// 监听地址：tcp://host:port、host:port 或 unix:///path
        #[arg(long, env = "SNITCH_HUB_LISTEN")]
        listen: Option<ListenAddr>,

        /// SQLite 数据库路径，不指定则不落库
        #[arg(long, env = "SNITCH_HUB_DB")]
        db: Option<PathBuf>,

        /// 无人值守：AskRule 直接返回兜底规则
        #[arg(long, action = clap::ArgAction::SetTrue)]
        headless: bool,

        /// AskRule 等待裁决的秒数
        #[arg(long)]
        ask_timeout: Option<u64>,

        /// 兜底动作：allow / deny
        #[arg(long)]
        default_action: Option<Action>,
    },

    /// 查询 Hub 状态
    Status {
        #[arg(long, env = "SNITCH_HUB_LISTEN")]
        listen: Option<ListenAddr>,

        /// 等待至少一个节点接入
        #[arg(long, action = clap::ArgAction::SetTrue)]
        wait: bool,
    },

    /// 启停全部节点的拦截
    Firewall {
        state: FirewallState,

        #[arg(long, env = "SNITCH_HUB_LISTEN")]
        listen: Option<ListenAddr>,
    },

    /// 列出在线节点
    Nodes {
        #[arg(long, env = "SNITCH_HUB_LISTEN")]
        listen: Option<ListenAddr>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FirewallState {
    Load,
    Unload,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("snitch_hub=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            listen,
            db,
            headless,
            ask_timeout,
            default_action,
        } => {
            let mut config = HubConfig::from_env()?;
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(db) = db {
                config.db_path = Some(db);
            }
            if headless {
                config.headless = true;
            }
            if let Some(secs) = ask_timeout {
                config.ask_timeout = Duration::from_secs(secs);
            }
            if let Some(action) = default_action {
                config.fallback.action = action;
            }
            serve(config).await
        }
        Command::Status { listen, wait } => status(client_config(listen)?, wait).await,
        Command::Firewall { state, listen } => firewall(client_config(listen)?, state).await,
        Command::Nodes { listen } => nodes(client_config(listen)?).await,
    }
}

async fn serve(config: HubConfig) -> Result<()> {
    tracing::info!("🚀 snitch-hub v{}", env!("CARGO_PKG_VERSION"));

    // 检查是否已有 Hub 运行
    if is_hub_running(&config) {
        tracing::error!("❌ Hub is already running, exiting");
        std::process::exit(1);
    }

    // 清理残留状态
    if let Err(e) = cleanup_stale_hub(&config) {
        tracing::warn!("Failed to cleanup stale state: {}", e);
    }

    if config.headless {
        tracing::info!(
            "🤖 无人值守模式，兜底规则: {} / {}",
            config.fallback.action,
            config.fallback.duration
        );
    }

    let hub = Arc::new(Hub::new(config)?);
    hub.run().await?;

    tracing::info!("👋 snitch-hub exiting");
    Ok(())
}

fn client_config(listen: Option<ListenAddr>) -> Result<HubClientConfig> {
    let mut config = HubClientConfig::from_env()?;
    if let Some(listen) = listen {
        config.listen = listen;
    }
    Ok(config)
}

async fn status(config: HubClientConfig, wait: bool) -> Result<()> {
    let mut client = HubClient::connect(config).await?;

    let mut data = client.query(QueryType::Status).await?;
    if wait && data["nodes"].as_u64() == Some(0) {
        println!("Waiting for nodes...");
        while data["nodes"].as_u64() == Some(0) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            data = client.query(QueryType::Status).await?;
        }
    }

    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

async fn firewall(config: HubClientConfig, state: FirewallState) -> Result<()> {
    let action = match state {
        FirewallState::Load => NotificationAction::LoadFirewall,
        FirewallState::Unload => NotificationAction::UnloadFirewall,
    };
    let mut client = HubClient::connect(config).await?;
    let (delivered, failed) = client.firewall(action).await?;
    println!("{:?}: delivered={}, failed={}", action, delivered, failed);
    Ok(())
}

async fn nodes(config: HubClientConfig) -> Result<()> {
    let mut client = HubClient::connect(config).await?;
    let data = client.query(QueryType::Nodes).await?;
    let nodes: Vec<NodeInfo> = serde_json::from_value(data).context("节点列表格式错误")?;

    if nodes.is_empty() {
        println!("No nodes connected yet");
        return Ok(());
    }
    for node in nodes {
        println!(
            "{:<24} {:<16} {:<10} {:<8} firewall={} last_seen={}",
            node.address,
            node.name,
            node.version,
            node.status,
            node.is_firewall_running,
            node.last_seen.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
