//! 聊天同步 CLI 客户端（测试版）
//!
//! 非交互式 CLI，用于测试和展示会话保持与缓存同步
//! 启动时从配置文件 / 环境变量加载账号，自动连接，只展示接收到的事件

use anyhow::{Context, Result};
use chat_sync_core::im::connection::{ConnectionStatus, SessionListener};
use chat_sync_core::im::readstate::ReadStateListener;
use chat_sync_core::im::sync::{SyncListener, SyncPath};
use chat_sync_core::im::types::SyncResource;
use chat_sync_core::{ChatClient, ClientConfig};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// 聊天同步 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "chat-sync-cli")]
#[command(about = "聊天同步 CLI 客户端 - 用于测试会话保持与缓存同步", long_about = None)]
struct Args {
    /// 配置文件（TOML），环境变量 CHAT_SYNC__* 可覆盖其中的值
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖配置中的用户 ID
    #[arg(short, long)]
    user: Option<String>,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 标记已读：会话ID:消息ID:时间戳，可重复
    #[arg(long = "mark-read")]
    mark_read: Vec<String>,

    /// 日志级别（默认: info,chat_sync_core=debug）
    #[arg(long, default_value = "info,chat_sync_core=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 创建日志文件（追加模式）
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .context("无法创建日志文件 debug.log")?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
    Ok(())
}

/// 设置监听器（输出所有接收到的事件）
fn setup_listeners(client: &ChatClient) {
    struct CliSessionListener;
    #[async_trait::async_trait]
    impl SessionListener for CliSessionListener {
        async fn on_status_changed(&self, status: ConnectionStatus) {
            info!("[CLI/Session] 🔗 连接状态: {:?}", status);
        }

        async fn on_connected(&self, reconnected: bool) {
            info!("[CLI/Session] ✅ 已连接: reconnected={}", reconnected);
        }

        async fn on_connection_failed(&self, reason: String, fatal: bool) {
            if fatal {
                error!("[CLI/Session] ❌ 连接失败（不再重试）: {}", reason);
            } else {
                warn!("[CLI/Session] ⚠️ 连接失败: {}", reason);
            }
        }

        async fn on_sign_out_required(&self) {
            error!("[CLI/Session] ⚠️ 授权已失效，需要重新登录");
        }

        async fn on_api_token_refreshed(&self, _token: String) {
            info!("[CLI/Session] 🔑 API token 已刷新");
        }
    }
    client.set_session_listener(Arc::new(CliSessionListener));

    struct CliSyncListener;
    #[async_trait::async_trait]
    impl SyncListener for CliSyncListener {
        async fn on_sync_started(&self, resource: SyncResource) {
            info!("[CLI/Sync] 🔄 {} 同步开始", resource);
        }

        async fn on_sync_finished(&self, resource: SyncResource, path: SyncPath, record_count: usize) {
            info!(
                "[CLI/Sync] ✅ {} 同步完成: {:?}, 共 {} 条",
                resource, path, record_count
            );
        }

        async fn on_sync_failed(&self, resource: SyncResource, error: String) {
            error!("[CLI/Sync] ❌ {} 同步失败: {}", resource, error);
        }

        async fn on_records_changed(&self, resource: SyncResource, records_json: String) {
            info!("[CLI/Sync] 📋 {} 变更: {}", resource, records_json);
        }
    }
    client.set_sync_listener(Arc::new(CliSyncListener));

    struct CliReadStateListener;
    #[async_trait::async_trait]
    impl ReadStateListener for CliReadStateListener {
        async fn on_read_state_updated(&self, positions_json: String) {
            info!("[CLI/ReadState] 📖 已读状态: {}", positions_json);
        }

        async fn on_read_state_disabled(&self, reason: String) {
            error!("[CLI/ReadState] ⛔ 已读同步已停用: {}", reason);
        }
    }
    client.set_read_state_listener(Arc::new(CliReadStateListener));
}

/// 解析 `会话ID:消息ID:时间戳`
fn parse_mark_read(raw: &str) -> Result<(String, String, i64)> {
    let mut parts = raw.rsplitn(3, ':');
    let timestamp = parts
        .next()
        .context("缺少时间戳")?
        .parse::<i64>()
        .context("时间戳不是整数")?;
    let message_id = parts.next().context("缺少消息ID")?.to_string();
    let conversation = parts.next().context("缺少会话ID")?.to_string();
    Ok((conversation, message_id, timestamp))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level)?;

    info!("[CLI] 🚀 聊天同步 CLI 客户端（测试模式）");
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(user) = args.user {
        config.user_id = user;
    }
    info!("[CLI] 👤 用户: {}, JID: {}", config.user_id, config.jid);

    let client = ChatClient::new(config).await?;
    setup_listeners(&client);

    info!("[CLI] 🔗 正在连接服务器...");
    client
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("连接失败: {}", e))?;
    info!("[CLI] ✅ 连接成功！");

    for raw in &args.mark_read {
        let (conversation, message_id, timestamp) = parse_mark_read(raw)
            .with_context(|| format!("无法解析 --mark-read {}", raw))?;
        client
            .update_read_position(&conversation, &message_id, timestamp)
            .await
            .map_err(|e| anyhow::anyhow!("标记已读失败: {}", e))?;
        info!("[CLI] 📖 已标记 {} 读到 {}", conversation, message_id);
    }

    info!("[CLI] 💡 提示：程序将持续运行并显示接收到的所有事件");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        tokio::signal::ctrl_c().await.context("等待 Ctrl+C 失败")?;
    }

    let contacts = client.contacts().await;
    let rooms = client.rooms().await;
    info!(
        "[CLI] 📋 本地缓存: 联系人 {} 个, 房间 {} 个",
        contacts.len(),
        rooms.len()
    );

    client.shutdown().await;
    info!("[CLI] 👋 程序退出");
    Ok(())
}
