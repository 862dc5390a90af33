/// 自定义错误类型
///
/// 按照失败的处理方式划分：协议错误对会话致命，资源/查找错误可恢复并回复给对端，
/// 传输错误向上传播并触发清理（Bridge 则进入重连）
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::codec::CodecError;
use crate::protocol::CommandKind;

/// 回复码：成功
pub const CODE_SUCCESS: i32 = 0;
/// 回复码：未分类错误
pub const CODE_ERROR: i32 = -1;
pub const CODE_UNKNOWN_COMMAND: i32 = 1000;
pub const CODE_MASTER_NOT_FOUND: i32 = 1001;
pub const CODE_PROXY_NOT_FOUND: i32 = 1002;
pub const CODE_PROXY_ALREADY_EXISTS: i32 = 1003;
pub const CODE_POOL_FULL: i32 = 1004;
pub const CODE_WORKER_TIMEOUT: i32 = 1005;
pub const CODE_BIND_FAILED: i32 = 1006;
pub const CODE_PROXY_CLOSED: i32 = 1007;

/// Breaker 的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 监听端口失败
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 帧编解码错误（对会话致命）
    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    /// 收到的命令不是期望的类型
    #[error("Unexpected command: expected {expected}, got {got}")]
    UnexpectedCommand {
        expected: CommandKind,
        got: CommandKind,
    },

    /// 对端回复了错误
    #[error("Rejected by remote: {0}")]
    Rejected(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// Master 未找到
    #[error("Master '{0}' not found")]
    MasterNotFound(String),

    /// 代理未找到
    #[error("Proxy '{0}' not found")]
    ProxyNotFound(String),

    /// 代理已存在
    #[error("Proxy '{0}' already exists")]
    ProxyAlreadyExists(String),

    /// 工作连接池已满
    #[error("Work connection pool of proxy '{0}' is full, discarding")]
    PoolFull(String),

    /// 等待工作连接超时
    #[error("No work connection for proxy '{proxy}' within {duration:?}")]
    WorkerTimeout { proxy: String, duration: Duration },

    /// 代理已关闭
    #[error("Proxy '{0}' is closed")]
    ProxyClosed(String),

    /// 会话已关闭
    #[error("Session closed")]
    SessionClosed,

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建监听失败错误
    pub fn bind_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::BindFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建工作连接等待超时错误
    pub fn worker_timeout(proxy: impl Into<String>, duration: Duration) -> Self {
        Self::WorkerTimeout {
            proxy: proxy.into(),
            duration,
        }
    }

    /// 对应的线路回复码
    pub fn code(&self) -> i32 {
        match self {
            Self::MasterNotFound(_) => CODE_MASTER_NOT_FOUND,
            Self::ProxyNotFound(_) => CODE_PROXY_NOT_FOUND,
            Self::ProxyAlreadyExists(_) => CODE_PROXY_ALREADY_EXISTS,
            Self::PoolFull(_) => CODE_POOL_FULL,
            Self::WorkerTimeout { .. } => CODE_WORKER_TIMEOUT,
            Self::BindFailed { .. } => CODE_BIND_FAILED,
            Self::ProxyClosed(_) => CODE_PROXY_CLOSED,
            _ => CODE_ERROR,
        }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::WorkerTimeout { .. })
    }

    /// 检查是否为协议错误
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Codec(_))
    }

    /// 检查是否为可恢复的查找/资源错误
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MasterNotFound(_)
                | Self::ProxyNotFound(_)
                | Self::ProxyAlreadyExists(_)
                | Self::PoolFull(_)
                | Self::WorkerTimeout { .. }
        )
    }
}
