/// 门户（公网服务端）
///
/// 控制端口上的每条新连接先读取首帧：
/// - `NewMaster`：成为一条控制会话，登记一个 Master
/// - `NewWorkCtl`：成为某个代理的工作连接，放入其连接池
pub mod handlers;
pub mod master;
pub mod proxy;

pub use master::{Master, MasterState, MasterTable};
pub use proxy::{Proxy, ProxyOptions, ProxyState};

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::config::PortalConfig;
use crate::error::{Result, TunnelError};
use crate::io_util::{apply_keepalive, is_temporary_accept_error, AcceptBackoff};
use crate::protocol::{Command, CommandRegistry, NewMasterResp, NewWorkCtl, NewWorkCtlResp};
use crate::session::{Router, Session};

/// 门户服务
pub struct Portal {
    config: PortalConfig,
    codec: FrameCodec,
    masters: Arc<MasterTable>,
    router: Arc<Router>,
    shutdown: CancellationToken,
}

impl Portal {
    pub fn new(config: PortalConfig, registry: Arc<CommandRegistry>) -> Arc<Self> {
        let codec = FrameCodec::with_max_frame_length(registry, config.max_frame_length);
        let masters = MasterTable::new();
        let router = handlers::build_router(masters.clone(), ProxyOptions::from(&config));
        Arc::new(Self {
            config,
            codec,
            masters,
            router: Arc::new(router),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    /// Master 表
    pub fn masters(&self) -> &Arc<MasterTable> {
        &self.masters
    }

    /// 绑定控制端口
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.config.server_addr)
            .await
            .map_err(|e| TunnelError::bind_failed(&self.config.server_addr, e))
    }

    /// 运行 accept 循环与心跳清理，直到 [`Portal::shutdown`]
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!("Portal listening on {}", local_addr);

        tokio::spawn(self.clone().sweep_loop());

        let mut backoff = AcceptBackoff::new();
        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => result,
            };

            match result {
                Ok((stream, peer)) => {
                    backoff.reset();
                    let portal = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = portal.handle_connection(stream, peer).await {
                            warn!("Connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) if is_temporary_accept_error(&e) => backoff.wait(&e).await,
                Err(e) => {
                    error!("Portal accept failed: {}", e);
                    self.shutdown();
                    return Err(e.into());
                }
            }
        }

        info!("Portal on {} stopped", local_addr);
        Ok(())
    }

    /// 停止服务并关闭所有 Master（连同其代理与进行中的隧道）
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let count = self.masters.len();
        self.masters.close_all();
        info!("Portal shut down, {} bridges disconnected", count);
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let first = tokio::time::timeout(
            self.config.handshake_timeout(),
            self.codec.read_frame(&mut stream),
        )
        .await
        .map_err(|_| TunnelError::timeout(self.config.handshake_timeout()))??;

        match first {
            Command::NewMaster(_) => {
                self.on_new_master(stream, peer);
                Ok(())
            }
            Command::NewWorkCtl(req) => self.on_new_work_ctl(stream, peer, req).await,
            other => {
                warn!(
                    "Unexpected first command {} from {}, closing",
                    other.kind(),
                    peer
                );
                Ok(())
            }
        }
    }

    fn on_new_master(&self, stream: TcpStream, peer: SocketAddr) {
        apply_keepalive(&stream);
        let trace_id = Uuid::new_v4().to_string();

        // 登记完成并排好 NewMasterResp 之后才开始读取后续命令
        let session = Session::new(stream, self.codec.clone(), self.config.session.clone());
        session.set_id(&trace_id);

        let master = Master::new(&trace_id, session.clone());
        if !self.masters.register(master.clone()) {
            session.close();
            session.start(self.router.clone());
            return;
        }

        session.send_command(Command::NewMasterResp(NewMasterResp {
            session_id: trace_id.clone(),
            error: None,
        }));
        master.activate();
        session.start(self.router.clone());
        info!("[{}] Bridge connected from {}", trace_id, peer);

        // 控制连接断开后清理 Master
        let masters = self.masters.clone();
        tokio::spawn(async move {
            session.closed().await;
            if masters.close_master(&trace_id) {
                info!("[{}] Bridge disconnected", trace_id);
            }
        });
    }

    async fn on_new_work_ctl(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        req: NewWorkCtl,
    ) -> Result<()> {
        let proxy = self
            .masters
            .get(&req.trace_id)
            .ok_or_else(|| TunnelError::MasterNotFound(req.trace_id.clone()))
            .and_then(|master| {
                master
                    .proxy(&req.proxy_name)
                    .ok_or_else(|| TunnelError::ProxyNotFound(req.proxy_name.clone()))
            });

        let proxy = match proxy {
            Ok(proxy) => proxy,
            Err(e) => return self.reject_worker(&mut stream, &req, e).await,
        };

        // 先占位再回复，回复成功后才把连接交给池
        let slot = match proxy.reserve_worker() {
            Ok(slot) => slot,
            Err(e) => return self.reject_worker(&mut stream, &req, e).await,
        };

        let reply = Command::NewWorkCtlResp(NewWorkCtlResp {
            proxy_name: req.proxy_name.clone(),
            error: None,
        });
        self.codec.write_frame(&mut stream, &reply).await?;

        apply_keepalive(&stream);
        slot.send(stream);
        if proxy.is_closed() {
            // 占位期间代理被关闭，连接不能留在池里
            proxy.drain_pool();
        }
        debug!(
            "[{}] Work connection from {} pooled for proxy '{}' ({}/{})",
            req.trace_id,
            peer,
            req.proxy_name,
            proxy.pooled(),
            proxy.capacity()
        );
        Ok(())
    }

    async fn reject_worker(
        &self,
        stream: &mut TcpStream,
        req: &NewWorkCtl,
        err: TunnelError,
    ) -> Result<()> {
        warn!(
            "[{}] Rejecting work connection for proxy '{}': {}",
            req.trace_id, req.proxy_name, err
        );
        let reply = Command::NewWorkCtlResp(NewWorkCtlResp {
            proxy_name: req.proxy_name.clone(),
            error: Some(err.to_string()),
        });
        self.codec.write_frame(stream, &reply).await?;
        Ok(())
    }

    /// 定期关闭心跳超时的 Master
    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let timeout = self.config.heartbeat_timeout();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for master in self.masters.expired(timeout) {
                warn!(
                    "[{}] No heartbeat for {:?}, closing",
                    master.trace_id(),
                    master.idle_for()
                );
                self.masters.close_master(master.trace_id());
            }
        }
    }
}

/// 运行门户直到 Ctrl+C
pub async fn run_portal(config: PortalConfig, registry: Arc<CommandRegistry>) -> anyhow::Result<()> {
    let portal = Portal::new(config, registry);
    let listener = portal.bind().await?;

    info!("Waiting for bridges... (Press Ctrl+C to stop)");
    let serve = portal.clone().serve(listener);
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            portal.shutdown();
        }
    }
    Ok(())
}
