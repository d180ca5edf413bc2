//! Hub Client 连接逻辑
//!
//! 节点和操作员共用同一套 JSONL 协议，连接建立后请求 / 响应一一对应。

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::config::ListenAddr;
use crate::protocol::{to_line, ConnectionPrompt, Push, QueryType, Request, Response};
use crate::types::{
    ClientConfig, ConnectionRequest, Notification, NotificationAction, Rule, Statistics,
};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Client 配置
#[derive(Debug, Clone)]
pub struct HubClientConfig {
    /// Hub 地址
    pub listen: ListenAddr,
    /// 连接重试次数
    pub connect_retries: u32,
    /// 重试间隔（毫秒）
    pub retry_interval_ms: u64,
}

impl Default for HubClientConfig {
    fn default() -> Self {
        Self {
            listen: ListenAddr::Tcp(crate::config::DEFAULT_LISTEN.to_string()),
            connect_retries: 3,
            retry_interval_ms: 500,
        }
    }
}

impl HubClientConfig {
    pub fn new(listen: ListenAddr) -> Self {
        Self {
            listen,
            ..Default::default()
        }
    }

    /// 读取 SNITCH_HUB_LISTEN
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(listen) = std::env::var("SNITCH_HUB_LISTEN") {
            config.listen = listen.parse()?;
        }
        Ok(config)
    }
}

/// Hub Client
pub struct HubClient {
    config: HubClientConfig,
    /// 写入端
    writer: BoxedWriter,
    /// 响应 / 推送接收通道
    line_rx: mpsc::Receiver<String>,
}

impl HubClient {
    /// 连接 Hub（重试 `connect_retries` 次）
    pub async fn connect(config: HubClientConfig) -> Result<Self> {
        let retries = config.connect_retries.max(1);
        let mut last_err = None;

        for attempt in 1..=retries {
            match open_stream(&config.listen).await {
                Ok((reader, writer)) => {
                    tracing::debug!("连接 Hub 成功: {} (attempt={})", config.listen, attempt);
                    return Ok(finish_connect(config, reader, writer));
                }
                Err(e) => {
                    tracing::debug!("连接 Hub 失败 (attempt={}): {}", attempt, e);
                    last_err = Some(e);
                    if attempt < retries {
                        sleep(Duration::from_millis(config.retry_interval_ms)).await;
                    }
                }
            }
        }

        let err = last_err.map_or_else(|| anyhow::anyhow!("未尝试连接"), anyhow::Error::from);
        Err(err.context(format!("无法连接 Hub: {}", config.listen)))
    }

    /// 以默认重试策略连接
    pub async fn connect_to(listen: ListenAddr) -> Result<Self> {
        Self::connect(HubClientConfig::new(listen)).await
    }

    pub fn listen(&self) -> &ListenAddr {
        &self.config.listen
    }

    /// 发送请求并等待响应
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        self.send(request).await?;

        let line = self
            .line_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("Connection closed"))?;
        let response: Response = serde_json::from_str(&line)
            .with_context(|| format!("响应格式错误: {}", line))?;
        Ok(response)
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        self.writer.write_all(to_line(request)?.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// 节点注册
    pub async fn subscribe(&mut self, config: ClientConfig) -> Result<ClientConfig> {
        match self.request(&Request::Subscribe(config)).await? {
            Response::Config(config) => Ok(config),
            other => Err(unexpected("Subscribe", other)),
        }
    }

    /// 心跳 + 统计，返回回显的 id
    pub async fn ping(&mut self, id: u64, stats: Option<Statistics>) -> Result<u64> {
        match self.request(&Request::Ping { id, stats }).await? {
            Response::Pong { id } => Ok(id),
            other => Err(unexpected("Ping", other)),
        }
    }

    /// 请求裁决（阻塞直到裁决或超时兜底）
    pub async fn ask_rule(&mut self, connection: ConnectionRequest) -> Result<Rule> {
        match self.request(&Request::AskRule(connection)).await? {
            Response::Rule { rule } => Ok(rule),
            other => Err(unexpected("AskRule", other)),
        }
    }

    /// 操作员：等待下一条待裁决连接
    pub async fn next_connection(&mut self) -> Result<ConnectionPrompt> {
        match self.request(&Request::NextConnection).await? {
            Response::Prompt { prompt } => Ok(prompt),
            other => Err(unexpected("NextConnection", other)),
        }
    }

    /// 操作员：提交裁决
    pub async fn resolve_connection(&mut self, id: u64, rule: Rule) -> Result<()> {
        match self.request(&Request::ResolveConnection { id, rule }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("ResolveConnection", other)),
        }
    }

    /// 操作员：启停全部节点的拦截，返回 (送达数, 失败数)
    pub async fn firewall(&mut self, action: NotificationAction) -> Result<(usize, usize)> {
        match self.request(&Request::Firewall { action }).await? {
            Response::Broadcast { delivered, failed } => Ok((delivered, failed)),
            other => Err(unexpected("Firewall", other)),
        }
    }

    pub async fn query(&mut self, query: QueryType) -> Result<serde_json::Value> {
        match self.request(&Request::Query { query }).await? {
            Response::QueryResult { data } => Ok(data),
            other => Err(unexpected("Query", other)),
        }
    }

    pub async fn heartbeat(&mut self) -> Result<()> {
        match self.request(&Request::Heartbeat).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("Heartbeat", other)),
        }
    }

    /// 把本连接转为通知流
    ///
    /// 节点须先在另一条连接上 Subscribe。
    pub async fn open_notifications(mut self) -> Result<NotificationStream> {
        self.send(&Request::Notifications).await?;
        Ok(NotificationStream {
            writer: self.writer,
            line_rx: self.line_rx,
        })
    }
}

/// 通知流（节点侧）
pub struct NotificationStream {
    writer: BoxedWriter,
    line_rx: mpsc::Receiver<String>,
}

impl NotificationStream {
    /// 接收下一条通知；Hub 关闭流时返回 None
    pub async fn recv_push(&mut self) -> Result<Option<Notification>> {
        let Some(line) = self.line_rx.recv().await else {
            return Ok(None);
        };
        if let Ok(Push::Notification(notification)) = serde_json::from_str::<Push>(&line) {
            return Ok(Some(notification));
        }
        match serde_json::from_str::<Response>(&line) {
            Ok(Response::Error { code, message }) => {
                Err(anyhow::anyhow!("通知流被拒绝: {} (code={})", message, code))
            }
            _ => Err(anyhow::anyhow!("无法解析推送: {}", line)),
        }
    }

    /// 回执
    pub async fn reply(&mut self, id: u64, code: i32, data: impl Into<String>) -> Result<()> {
        let request = Request::NotificationReply {
            id,
            code,
            data: data.into(),
        };
        self.writer.write_all(to_line(&request)?.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// 获取推送接收器（用于 select!）
    pub fn push_receiver(&mut self) -> &mut mpsc::Receiver<String> {
        &mut self.line_rx
    }
}

fn unexpected(op: &str, response: Response) -> anyhow::Error {
    match response {
        Response::Error { code, message } => {
            anyhow::anyhow!("{} failed: {} (code={})", op, message, code)
        }
        other => anyhow::anyhow!("{}: unexpected response {:?}", op, other),
    }
}

async fn open_stream(
    listen: &ListenAddr,
) -> std::io::Result<(Box<dyn AsyncRead + Send + Unpin>, BoxedWriter)> {
    match listen {
        ListenAddr::Tcp(addr) => {
            // 监听全部地址时连本机
            let addr = match addr.strip_prefix("0.0.0.0:") {
                Some(port) => format!("127.0.0.1:{}", port),
                None => addr.clone(),
            };
            let (reader, writer) = TcpStream::connect(addr).await?.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        ListenAddr::Unix(path) => {
            let (reader, writer) = UnixStream::connect(path).await?.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}

/// 启动读取任务
fn finish_connect(
    config: HubClientConfig,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: BoxedWriter,
) -> HubClient {
    let (line_tx, line_rx) = mpsc::channel(100);

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    HubClient {
        config,
        writer,
        line_rx,
    }
}
