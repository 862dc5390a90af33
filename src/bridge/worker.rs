/// 网桥侧的工作连接
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

use super::file_server::FileServer;
use super::Bridge;
use crate::config::{BridgeConfig, PluginConfig};
use crate::error::{Result, TunnelError};
use crate::io_util::{apply_keepalive, splice};
use crate::protocol::{Command, CommandKind, NewWorkCtl};

/// 工作连接处理器
///
/// 默认实现 [`LocalService`] 拨号本地端口并双向拼接；插件可以直接接管连接。
#[async_trait]
pub trait WorkerHandler: Send + Sync {
    /// 处理一条已被门户接受的工作连接，返回时连接应已关闭
    async fn handle(&self, worker: TcpStream) -> Result<()>;
}

/// 转发到本地 TCP 服务
pub struct LocalService {
    addr: String,
}

impl LocalService {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl WorkerHandler for LocalService {
    async fn handle(&self, worker: TcpStream) -> Result<()> {
        let local = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TunnelError::connection_failed(&self.addr, e))?;
        debug!("Connected to local service {}", self.addr);
        splice(worker, local, &self.addr).await;
        Ok(())
    }
}

/// 按配置选择处理器：配置了插件时交给插件，否则转发到本地服务
pub fn worker_handler(config: &BridgeConfig) -> Result<Arc<dyn WorkerHandler>> {
    match &config.plugin {
        Some(PluginConfig::FileServer {
            file_location,
            prefix,
        }) => Ok(Arc::new(FileServer::open(file_location, prefix)?)),
        None => Ok(Arc::new(LocalService::new(config.local_service_addr()))),
    }
}

impl Bridge {
    /// 新建一条工作连接并交给处理器
    ///
    /// 每次调用恰好提供一条工作连接，对应一次公网连接的拼接。
    pub async fn create_worker_connection(&self) -> Result<()> {
        let trace_id = self
            .trace_id()
            .ok_or_else(|| TunnelError::Rejected("bridge is not registered".to_string()))?;
        let proxy_name = self.proxy_name();
        let server_addr = &self.config.server_addr;
        let handshake_timeout = self.config.handshake_timeout();

        let mut worker = tokio::time::timeout(handshake_timeout, TcpStream::connect(server_addr))
            .await
            .map_err(|_| TunnelError::timeout(handshake_timeout))?
            .map_err(|e| TunnelError::connection_failed(server_addr, e))?;

        let request = Command::NewWorkCtl(NewWorkCtl {
            trace_id: trace_id.clone(),
            proxy_name: proxy_name.clone(),
        });
        let reply = tokio::time::timeout(handshake_timeout, async {
            self.codec.write_frame(&mut worker, &request).await?;
            self.codec.read_frame(&mut worker).await
        })
        .await
        .map_err(|_| TunnelError::timeout(handshake_timeout))??;

        match reply {
            Command::NewWorkCtlResp(resp) => {
                if let Some(err) = resp.error {
                    return Err(TunnelError::Rejected(err));
                }
            }
            other => {
                return Err(TunnelError::UnexpectedCommand {
                    expected: CommandKind::NewWorkCtlResp,
                    got: other.kind(),
                })
            }
        }

        apply_keepalive(&worker);
        debug!("[{}] Work connection for '{}' accepted", trace_id, proxy_name);
        self.handler.handle(worker).await
    }
}
