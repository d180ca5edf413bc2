//! Hub 服务器
//!
//! TCP / Unix Socket 服务，每个连接一个任务，连接内请求顺序处理。

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf,
};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::Notify;

use super::broadcaster::Broadcaster;
use super::broker::{BrokerConfig, DecisionBroker};
use super::handler::Handler;
use super::registry::{NodeRegistry, PeerInfo};
use super::writer::{StorageWriter, WRITE_QUEUE_CAPACITY};
use crate::config::{HubConfig, ListenAddr};
use crate::db::SqliteStorage;
use crate::error::Error;
use crate::protocol::{code, to_line, Push, Request, Response};

/// 已绑定的监听器
pub enum Listener {
    Tcp(TcpListener),
    /// Unix Socket 及其路径（退出时删除）
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// 实际监听地址（端口为 0 时返回系统分配的端口）
    pub fn local_addr(&self) -> std::io::Result<ListenAddr> {
        match self {
            Listener::Tcp(listener) => Ok(ListenAddr::Tcp(listener.local_addr()?.to_string())),
            Listener::Unix(_, path) => Ok(ListenAddr::Unix(path.clone())),
        }
    }

    async fn accept(&self) -> std::io::Result<(Conn, PeerInfo)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Conn::Tcp(stream), PeerInfo::tcp(addr)))
            }
            Listener::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok((Conn::Unix(stream), PeerInfo::unix()))
            }
        }
    }
}

enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

type LineReader<S> = Lines<BufReader<ReadHalf<S>>>;

/// Hub 服务
pub struct Hub {
    config: HubConfig,
    registry: Arc<NodeRegistry>,
    broker: Arc<DecisionBroker>,
    broadcaster: Arc<Broadcaster>,
    handler: Arc<Handler>,
    shutdown: Notify,
}

impl Hub {
    /// 创建 Hub
    pub fn new(config: HubConfig) -> Result<Self> {
        let writer = match &config.db_path {
            Some(path) => {
                let db = SqliteStorage::open(path)
                    .with_context(|| format!("打开数据库失败: {:?}", path))?;
                let writer = StorageWriter::spawn(Arc::new(db), WRITE_QUEUE_CAPACITY)
                    .context("启动写库线程失败")?;
                Some(writer)
            }
            None => None,
        };

        let registry = NodeRegistry::new();
        let broker = DecisionBroker::new(BrokerConfig::from(&config));
        let broadcaster = Broadcaster::new(registry.clone(), config.notification_timeout);
        let handler = Arc::new(Handler::new(
            registry.clone(),
            broker.clone(),
            broadcaster.clone(),
            writer,
            config.listen.to_string(),
        ));

        Ok(Self {
            config,
            registry,
            broker,
            broadcaster,
            handler,
            shutdown: Notify::new(),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<DecisionBroker> {
        &self.broker
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// 绑定监听地址并写入 PID 文件
    ///
    /// Unix Socket 已被存活实例占用时返回 `Error::AlreadyRunning`，残留的 socket 文件会被删除。
    pub async fn bind(&self) -> Result<Listener> {
        fs::create_dir_all(&self.config.data_dir).context("创建数据目录失败")?;

        let listener = match &self.config.listen {
            ListenAddr::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("绑定地址失败: {}", addr))?;
                Listener::Tcp(listener)
            }
            ListenAddr::Unix(path) => {
                ensure_socket_free(path).await?;
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent).context("创建 socket 目录失败")?;
                    }
                }
                let listener = UnixListener::bind(path).context("绑定 socket 失败")?;

                // 设置 socket 权限为 0600
                fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
                Listener::Unix(listener, path.clone())
            }
        };

        self.write_pid_file()?;
        tracing::info!("🚀 Hub 启动: {}", listener.local_addr()?);
        Ok(listener)
    }

    /// 绑定并运行，直到收到中断信号或 `shutdown()`
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// 在已绑定的监听器上接受连接
    pub async fn serve(self: Arc<Self>, listener: Listener) -> Result<()> {
        let waiter = {
            let registry = self.registry.clone();
            tokio::spawn(async move {
                tracing::info!("⏳ 等待节点接入...");
                registry.wait_for_nodes().await;
                tracing::info!("✅ 首个节点已接入");
            })
        };

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((conn, peer)) => {
                            let hub = self.clone();
                            tokio::spawn(async move {
                                let res = match conn {
                                    Conn::Tcp(stream) => hub.handle_connection(stream, peer).await,
                                    Conn::Unix(stream) => hub.handle_connection(stream, peer).await,
                                };
                                if let Err(e) = res {
                                    tracing::error!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("收到中断信号，准备退出...");
                    break;
                }
                _ = self.shutdown.notified() => {
                    tracing::info!("收到退出请求，准备退出...");
                    break;
                }
            }
        }

        waiter.abort();
        self.handler.flush().await;
        self.cleanup(&listener);
        Ok(())
    }

    /// 请求退出（serve 尚未开始时也会生效）
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// 处理单个连接
    async fn handle_connection<S>(&self, stream: S, peer: PeerInfo) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        tracing::debug!("📥 新连接: {}", peer);

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("读取失败: {}, {}", peer, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let request: Request = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("解析请求失败: {}, {}", peer, e);
                    let response = Response::error(code::BAD_REQUEST, format!("Invalid JSON: {}", e));
                    writer.write_all(to_line(&response)?.as_bytes()).await?;
                    continue;
                }
            };

            if matches!(request, Request::Notifications) {
                return self.stream_notifications(&peer, lines, writer).await;
            }

            // 等待裁决期间同时监视连接，操作员断开即放弃等待
            let response = if matches!(request, Request::NextConnection) {
                tokio::select! {
                    response = self.handler.handle(&peer, request) => response,
                    _ = wait_peer_closed(&peer, &mut lines) => {
                        tracing::info!("🧑‍⚖️ 操作员在等待裁决时断开: {}", peer);
                        break;
                    }
                }
            } else {
                self.handler.handle(&peer, request).await
            };
            if let Err(e) = writer.write_all(to_line(&response)?.as_bytes()).await {
                tracing::debug!("发送响应失败: {}, {}", peer, e);
                break;
            }
        }

        tracing::debug!("📤 连接关闭: {}", peer);
        Ok(())
    }

    /// 通知流：把会话发件箱里的通知推给节点，直到任意一端结束
    ///
    /// 流结束即节点下线。
    async fn stream_notifications<S>(
        &self,
        peer: &PeerInfo,
        mut lines: LineReader<S>,
        mut writer: WriteHalf<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Some(session) = self.registry.lookup(peer) else {
            tracing::warn!("⚠️ 通知流: 节点未注册 {}", peer);
            let response = Response::error(code::NOT_FOUND, "节点未注册，请先 Subscribe");
            writer.write_all(to_line(&response)?.as_bytes()).await?;
            return Ok(());
        };
        let Some(mut outbox) = session.attach_stream() else {
            tracing::warn!("⚠️ 通知流已存在: {}", session.addr());
            let response = Response::error(code::CONFLICT, "通知流已存在");
            writer.write_all(to_line(&response)?.as_bytes()).await?;
            return Ok(());
        };
        tracing::info!("📡 通知流打开: {}", session.addr());

        loop {
            tokio::select! {
                next = outbox.next() => {
                    let Some(notification) = next else {
                        tracing::debug!("会话已关闭: {}", session.addr());
                        break;
                    };
                    let line = to_line(&Push::Notification(notification))?;
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        tracing::debug!("推送失败: {}, {}", session.addr(), e);
                        break;
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => match serde_json::from_str::<Request>(&line) {
                            Ok(Request::NotificationReply { id, code, data }) => {
                                tracing::debug!(
                                    "📨 通知回执: node={}, id={}, code={}, data={}",
                                    session.addr(),
                                    id,
                                    code,
                                    data
                                );
                            }
                            Ok(other) => {
                                tracing::warn!("通知流上的意外请求: {}, {:?}", session.addr(), other);
                            }
                            Err(e) => {
                                tracing::warn!("解析通知回执失败: {}, {}", session.addr(), e);
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!("通知流读取失败: {}, {}", session.addr(), e);
                            break;
                        }
                    }
                }
            }
        }

        self.registry.remove_session(&session);
        tracing::info!("📡 通知流关闭: {}", session.addr());
        Ok(())
    }

    /// 写入 PID 文件
    ///
    /// PID 文件指向其它存活进程时拒绝启动。
    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let pid_path = self.config.pid_path();
        if let Some(other) = read_pid(&pid_path) {
            if other != pid as i32 && process_alive(other) {
                return Err(Error::AlreadyRunning(pid_path).into());
            }
        }
        fs::write(&pid_path, pid.to_string())?;
        fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600))?;
        tracing::debug!("📝 写入 PID 文件: {} (pid={})", pid_path.display(), pid);
        Ok(())
    }

    /// 清理资源
    fn cleanup(&self, listener: &Listener) {
        if let Listener::Unix(_, path) = listener {
            if path.exists() {
                let _ = fs::remove_file(path);
            }
        }

        let pid_path = self.config.pid_path();
        if read_pid(&pid_path) == Some(std::process::id() as i32) {
            let _ = fs::remove_file(&pid_path);
        }

        tracing::info!("🧹 Hub 清理完成");
    }
}

/// socket 文件存在时探测是否有存活实例；无人监听则视为残留并删除
async fn ensure_socket_free(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(Error::AlreadyRunning(path.to_path_buf()).into());
    }
    fs::remove_file(path).with_context(|| format!("删除残留 socket 失败: {:?}", path))?;
    tracing::info!("🧹 删除残留 socket: {:?}", path);
    Ok(())
}

/// 等待对端关闭连接；期间收到的请求不处理
async fn wait_peer_closed<S>(peer: &PeerInfo, lines: &mut LineReader<S>)
where
    S: AsyncRead,
{
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::warn!("等待裁决期间收到请求，忽略: {}, {}", peer, line);
            }
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("读取失败: {}, {}", peer, e);
                return;
            }
        }
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// 检查 Hub 是否正在运行
pub fn is_hub_running(config: &HubConfig) -> bool {
    read_pid(&config.pid_path()).is_some_and(process_alive)
}

/// 清理残留的 PID 文件
///
/// socket 文件不在这里删除：`Hub::bind` 先探测是否有存活实例，确认无人监听后才删除。
pub fn cleanup_stale_hub(config: &HubConfig) -> Result<()> {
    let pid_path = config.pid_path();

    if pid_path.exists() {
        fs::remove_file(&pid_path)?;
        tracing::debug!("🧹 删除残留 PID 文件: {:?}", pid_path);
    }

    Ok(())
}
