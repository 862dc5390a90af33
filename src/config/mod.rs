// 配置管理模块

mod validator;

pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_LENGTH;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "BREAKER_";

/// 重连延迟（秒）- 可通过环境变量 BREAKER_RECONNECT_DELAY_SECS 覆盖
pub const RECONNECT_DELAY_SECS: u64 = 5;
/// 默认心跳间隔（秒）
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

pub fn get_reconnect_delay() -> u64 {
    std::env::var(format!("{}RECONNECT_DELAY_SECS", ENV_PREFIX))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(RECONNECT_DELAY_SECS)
}

/// 日志输出方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogWay {
    #[default]
    Console,
    File,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别，未设置时使用命令行参数
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub way: LogWay,
    /// 日志文件路径（way = "file" 时使用）
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
}

fn default_log_file() -> PathBuf {
    PathBuf::from("breaker.log")
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            way: LogWay::Console,
            file: default_log_file(),
        }
    }
}

/// 控制会话参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 发送队列容量
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// 每帧最多写入尝试次数（只对临时错误重试）
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    #[serde(default)]
    pub write_timeout_secs: Option<u64>,
    /// 读空闲超时，未设置时不限制
    #[serde(default)]
    pub read_timeout_secs: Option<u64>,
}

fn default_queue_size() -> usize {
    1024
}

fn default_write_attempts() -> u32 {
    3
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            write_attempts: default_write_attempts(),
            write_timeout_secs: None,
            read_timeout_secs: None,
        }
    }
}

impl SessionConfig {
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_secs.map(Duration::from_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }
}

/// 门户配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// 控制端口监听地址
    #[serde(default = "default_portal_addr")]
    pub server_addr: String,
    /// 代理端口绑定的主机
    #[serde(default = "default_proxy_bind_addr")]
    pub proxy_bind_addr: String,
    /// 超过该时长没有心跳的 Master 会被清理
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// 心跳超时扫描间隔
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// 每个代理的工作连接池容量
    #[serde(default = "default_pool_capacity")]
    pub worker_pool_capacity: usize,
    /// 等待工作连接的超时
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,
    /// 新连接首帧的超时
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_portal_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_proxy_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_heartbeat_timeout() -> u64 {
    90
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_pool_capacity() -> usize {
    10
}

fn default_worker_timeout() -> u64 {
    5
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            server_addr: default_portal_addr(),
            proxy_bind_addr: default_proxy_bind_addr(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            worker_pool_capacity: default_pool_capacity(),
            worker_timeout_secs: default_worker_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            max_frame_length: default_max_frame_length(),
            session: SessionConfig::default(),
        }
    }
}

impl PortalConfig {
    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_portal_config(self)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// 网桥配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// 门户控制端口地址
    pub server_addr: String,
    /// 本地服务主机
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    /// 本地服务端口
    pub local_port: u16,
    /// 门户上对外暴露的端口
    pub remote_port: u16,
    /// 代理名称，默认 "{server_addr}_to_{local_port}"
    #[serde(default)]
    pub proxy_name: Option<String>,
    /// 心跳间隔（秒），0 表示使用默认值
    #[serde(default)]
    pub heartbeat_interval_secs: i64,
    /// 重连间隔（秒），未设置时读取环境变量或使用默认值
    #[serde(default)]
    pub reconnect_delay_secs: Option<u64>,
    /// 注册成功后预先建立的工作连接数
    #[serde(default = "default_initial_workers")]
    pub initial_workers: usize,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
    #[serde(default)]
    pub session: SessionConfig,
    /// 工作连接交给插件处理，未设置时转发到本地服务
    #[serde(default)]
    pub plugin: Option<PluginConfig>,
}

/// 网桥插件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginConfig {
    /// 静态文件服务
    FileServer {
        file_location: PathBuf,
        #[serde(default = "default_file_prefix")]
        prefix: String,
    },
}

fn default_file_prefix() -> String {
    "/".to_string()
}

fn default_local_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_initial_workers() -> usize {
    1
}

impl BridgeConfig {
    /// 使用默认值创建配置
    pub fn new(server_addr: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            server_addr: server_addr.into(),
            local_addr: default_local_addr(),
            local_port,
            remote_port,
            proxy_name: None,
            heartbeat_interval_secs: 0,
            reconnect_delay_secs: None,
            initial_workers: default_initial_workers(),
            handshake_timeout_secs: default_handshake_timeout(),
            max_frame_length: default_max_frame_length(),
            session: SessionConfig::default(),
            plugin: None,
        }
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_bridge_config(self)
    }

    pub fn proxy_name(&self) -> String {
        match &self.proxy_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("{}_to_{}", self.server_addr, self.local_port),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        if self.heartbeat_interval_secs <= 0 {
            Duration::from_secs(HEARTBEAT_INTERVAL_SECS)
        } else {
            Duration::from_secs(self.heartbeat_interval_secs as u64)
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs.unwrap_or_else(get_reconnect_delay))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn local_service_addr(&self) -> String {
        format!("{}:{}", self.local_addr, self.local_port)
    }

    /// 工作连接的去向，用于日志
    pub fn service_description(&self) -> String {
        match &self.plugin {
            Some(PluginConfig::FileServer {
                file_location,
                prefix,
            }) => format!("file server {:?} at {}", file_location, prefix),
            None => self.local_service_addr(),
        }
    }
}

/// 门户配置文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSettings {
    #[serde(default)]
    pub log: LogConfig,
    pub portal: PortalConfig,
}

/// 网桥配置文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default)]
    pub log: LogConfig,
    pub bridge: BridgeConfig,
}

/// 应用配置
#[derive(Debug, Clone)]
pub enum AppConfig {
    Portal(PortalSettings),
    Bridge(BridgeSettings),
}

impl AppConfig {
    /// 从文件加载配置（按 [portal] / [bridge] 段自动检测类型）
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let table: toml::Table = toml::from_str(content).context("Invalid TOML")?;
        match (table.contains_key("portal"), table.contains_key("bridge")) {
            (true, false) => Ok(AppConfig::Portal(Self::parse_portal(content)?)),
            (false, true) => Ok(AppConfig::Bridge(Self::parse_bridge(content)?)),
            (true, true) => anyhow::bail!("Configuration must contain only one of [portal] or [bridge]"),
            (false, false) => anyhow::bail!("Configuration must contain a [portal] or [bridge] section"),
        }
    }

    /// 从文件加载门户配置
    pub fn load_portal_config(path: &str) -> anyhow::Result<PortalSettings> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::parse_portal(&content)
    }

    /// 从文件加载网桥配置
    pub fn load_bridge_config(path: &str) -> anyhow::Result<BridgeSettings> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::parse_bridge(&content)
    }

    fn parse_portal(content: &str) -> anyhow::Result<PortalSettings> {
        let settings: PortalSettings =
            toml::from_str(content).context("Failed to parse portal configuration")?;
        settings
            .portal
            .validate()
            .context("Portal configuration validation failed")?;
        Ok(settings)
    }

    fn parse_bridge(content: &str) -> anyhow::Result<BridgeSettings> {
        let settings: BridgeSettings =
            toml::from_str(content).context("Failed to parse bridge configuration")?;
        settings
            .bridge
            .validate()
            .context("Bridge configuration validation failed")?;
        Ok(settings)
    }

    pub fn log(&self) -> &LogConfig {
        match self {
            AppConfig::Portal(s) => &s.log,
            AppConfig::Bridge(s) => &s.log,
        }
    }
}
