//! Hub 配置

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{Action, RuleDuration};

/// 默认监听地址
pub const DEFAULT_LISTEN: &str = "0.0.0.0:50051";

/// AskRule 裁决超时（与节点侧写死的超时一致）
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(120);

/// 单条通知入队的最长等待
pub const DEFAULT_NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// 监听地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP `host:port`
    Tcp(String),
    /// Unix Socket 路径
    Unix(PathBuf),
}

impl ListenAddr {
    /// Unix Socket 路径（TCP 时为 None）
    pub fn socket_path(&self) -> Option<&PathBuf> {
        match self {
            ListenAddr::Unix(path) => Some(path),
            ListenAddr::Tcp(_) => None,
        }
    }
}

impl FromStr for ListenAddr {
    type Err = Error;

    /// 支持：`tcp://host:port`、`host:port`、`:port`、`unix:///path`、`unix:/path`、`/path`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("监听地址为空".into()));
        }
        if let Some(path) = s.strip_prefix("unix://").or_else(|| s.strip_prefix("unix:")) {
            if path.is_empty() {
                return Err(Error::Config(format!("无效的 unix 地址: {}", s)));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') || s.starts_with("./") {
            return Ok(ListenAddr::Unix(PathBuf::from(s)));
        }

        let hostport = s.strip_prefix("tcp://").unwrap_or(s);
        let (host, port) = hostport
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("缺少端口: {}", s)))?;
        port.parse::<u16>()
            .map_err(|_| Error::Config(format!("无效端口: {}", s)))?;
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        Ok(ListenAddr::Tcp(format!("{}:{}", host, port)))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "tcp://{}", addr),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// AskRule 无人裁决时的兜底规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackPolicy {
    pub action: Action,
    pub duration: RuleDuration,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            action: Action::Deny,
            duration: RuleDuration::Once,
        }
    }
}

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 节点接入地址
    pub listen: ListenAddr,
    /// 数据目录（默认 ~/.snitch-hub）
    pub data_dir: PathBuf,
    /// SQLite 数据库路径，None 表示不落库
    pub db_path: Option<PathBuf>,
    /// 无人值守：AskRule 直接返回兜底规则
    pub headless: bool,
    /// AskRule 等待裁决的上限
    pub ask_timeout: Duration,
    /// 通知入队的等待上限
    pub notification_timeout: Duration,
    /// 兜底规则
    pub fallback: FallbackPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".snitch-hub");

        Self {
            listen: ListenAddr::Tcp(DEFAULT_LISTEN.to_string()),
            data_dir,
            db_path: None,
            headless: false,
            ask_timeout: DEFAULT_ASK_TIMEOUT,
            notification_timeout: DEFAULT_NOTIFICATION_TIMEOUT,
            fallback: FallbackPolicy::default(),
        }
    }
}

impl HubConfig {
    /// 从环境变量覆盖默认值
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(listen) = std::env::var("SNITCH_HUB_LISTEN") {
            config.listen = listen.parse()?;
        }
        if let Ok(db) = std::env::var("SNITCH_HUB_DB") {
            config.db_path = Some(PathBuf::from(db));
        }
        if let Ok(headless) = std::env::var("SNITCH_HUB_HEADLESS") {
            config.headless = matches!(headless.as_str(), "1" | "true" | "yes");
        }
        if let Ok(secs) = std::env::var("SNITCH_HUB_ASK_TIMEOUT_SECS") {
            let secs = secs
                .parse::<u64>()
                .map_err(|_| Error::Config(format!("无效的超时秒数: {}", secs)))?;
            config.ask_timeout = Duration::from_secs(secs);
        }
        if let Ok(action) = std::env::var("SNITCH_HUB_DEFAULT_ACTION") {
            config.fallback.action = action.parse().map_err(Error::Config)?;
        }

        Ok(config)
    }

    pub fn with_listen(mut self, listen: ListenAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_db(mut self, path: PathBuf) -> Self {
        self.db_path = Some(path);
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("hub.pid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(
            "tcp://127.0.0.1:50051".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("127.0.0.1:50051".into())
        );
        assert_eq!(
            ":50051".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("0.0.0.0:50051".into())
        );
        assert_eq!(
            "unix:///tmp/hub.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/hub.sock"))
        );
        assert_eq!(
            "/tmp/hub.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/hub.sock"))
        );
        assert!("localhost".parse::<ListenAddr>().is_err());
        assert!("host:notaport".parse::<ListenAddr>().is_err());
        assert!("unix://".parse::<ListenAddr>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.ask_timeout, Duration::from_secs(120));
        assert_eq!(config.fallback.action, Action::Deny);
        assert_eq!(config.fallback.duration, RuleDuration::Once);
        assert!(!config.headless);
        assert!(config.db_path.is_none());
        assert!(config.data_dir.to_str().unwrap().contains(".snitch-hub"));
    }

    #[test]
    fn test_listen_display() {
        let addr = ListenAddr::Unix(PathBuf::from("/tmp/hub.sock"));
        assert_eq!(addr.to_string(), "unix:///tmp/hub.sock");
        assert_eq!(addr.to_string().parse::<ListenAddr>().unwrap(), addr);
    }
}
