/// 网桥（NAT 后的客户端）
///
/// 网桥拨号到门户完成注册，之后定期发送心跳，并按门户的 `ReqWorkCtl`
/// 请求另外拨号建立工作连接。控制连接断开后按固定间隔无限重连，直到 [`Bridge::stop`]。
pub mod file_server;
pub mod worker;

pub use file_server::FileServer;
pub use worker::{worker_handler, LocalService, WorkerHandler};

use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::FrameCodec;
use crate::config::BridgeConfig;
use crate::error::{Result, TunnelError};
use crate::io_util::apply_keepalive;
use crate::protocol::{
    CloseProxy, Command, CommandKind, CommandRegistry, NewMaster, NewProxy, Ping,
};
use crate::session::{recover, Router, Session};

/// 网桥状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Registered,
    Active,
    Stopped,
}

/// 网桥
pub struct Bridge {
    config: BridgeConfig,
    codec: FrameCodec,
    handler: Arc<dyn WorkerHandler>,
    state: Mutex<BridgeState>,
    trace_id: RwLock<Option<String>>,
    control: Mutex<Option<Arc<Session>>>,
    stop: CancellationToken,
    last_pong: Mutex<Option<Instant>>,
}

impl Bridge {
    /// 按配置选择工作连接的处理器（本地服务或插件）
    pub fn new(config: BridgeConfig, registry: Arc<CommandRegistry>) -> Result<Arc<Self>> {
        let handler = worker_handler(&config)?;
        Ok(Self::with_handler(config, registry, handler))
    }

    /// 工作连接交给自定义处理器
    pub fn with_handler(
        config: BridgeConfig,
        registry: Arc<CommandRegistry>,
        handler: Arc<dyn WorkerHandler>,
    ) -> Arc<Self> {
        let codec = FrameCodec::with_max_frame_length(registry, config.max_frame_length);
        Arc::new(Self {
            config,
            codec,
            handler,
            state: Mutex::new(BridgeState::Disconnected),
            trace_id: RwLock::new(None),
            control: Mutex::new(None),
            stop: CancellationToken::new(),
            last_pong: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock()
    }

    fn set_state(&self, state: BridgeState) {
        let mut current = self.state.lock();
        if *current != BridgeState::Stopped {
            *current = state;
        }
    }

    /// 门户分配的追踪 ID，注册成功前为 None
    pub fn trace_id(&self) -> Option<String> {
        self.trace_id.read().clone()
    }

    pub fn proxy_name(&self) -> String {
        self.config.proxy_name()
    }

    /// 最近一次收到 Pong 的时间
    pub fn last_pong(&self) -> Option<Instant> {
        *self.last_pong.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// 拨号并完成注册（NewMaster → NewProxy）
    ///
    /// 任何一步失败或回复带有错误，整个尝试失败，连接被丢弃。
    pub async fn connect(self: &Arc<Self>) -> Result<Arc<Session>> {
        self.set_state(BridgeState::Connecting);
        let server_addr = &self.config.server_addr;
        let handshake_timeout = self.config.handshake_timeout();

        info!("Connecting to portal {}", server_addr);
        let mut stream = tokio::time::timeout(handshake_timeout, TcpStream::connect(server_addr))
            .await
            .map_err(|_| TunnelError::timeout(handshake_timeout))?
            .map_err(|e| TunnelError::connection_failed(server_addr, e))?;
        apply_keepalive(&stream);

        let handshake = async {
            self.codec
                .write_frame(&mut stream, &Command::NewMaster(NewMaster {}))
                .await?;
            let trace_id = match self.codec.read_frame(&mut stream).await? {
                Command::NewMasterResp(resp) => match resp.error {
                    Some(err) => return Err(TunnelError::Rejected(err)),
                    None => resp.session_id,
                },
                other => return Err(unexpected(CommandKind::NewMasterResp, other)),
            };

            let proxy_name = self.config.proxy_name();
            self.codec
                .write_frame(
                    &mut stream,
                    &Command::NewProxy(NewProxy {
                        proxy_name: proxy_name.clone(),
                        remote_port: self.config.remote_port,
                        trace_id: trace_id.clone(),
                    }),
                )
                .await?;
            match self.codec.read_frame(&mut stream).await? {
                Command::NewProxyResp(resp) => {
                    if let Some(err) = resp.error {
                        return Err(TunnelError::Rejected(err));
                    }
                }
                other => return Err(unexpected(CommandKind::NewProxyResp, other)),
            }
            Ok(trace_id)
        };

        let trace_id = tokio::time::timeout(handshake_timeout, handshake)
            .await
            .map_err(|_| TunnelError::timeout(handshake_timeout))??;

        *self.trace_id.write() = Some(trace_id.clone());
        self.set_state(BridgeState::Registered);

        let router = build_router(Arc::downgrade(self));
        let session = Session::new(stream, self.codec.clone(), self.config.session.clone());
        session.set_id(&trace_id);
        session.start(Arc::new(router));
        *self.control.lock() = Some(session.clone());

        info!(
            "[{}] Proxy '{}' registered, remote port {} -> {}",
            trace_id,
            self.config.proxy_name(),
            self.config.remote_port,
            self.config.service_description()
        );
        Ok(session)
    }

    /// 运行网桥直到 [`Bridge::stop`]，连接断开后自动重连
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.is_stopped() {
                break;
            }

            let connected = tokio::select! {
                _ = self.stop.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(session) => {
                    self.run_active(&session).await;
                    session.close();
                    self.control.lock().take();
                }
                Err(e) => error!("Failed to connect to portal: {}", e),
            }

            if self.is_stopped() {
                break;
            }
            self.set_state(BridgeState::Disconnected);

            let delay = self.config.reconnect_delay();
            warn!("Connection lost, reconnecting in {} seconds...", delay.as_secs());
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(BridgeState::Stopped);
        info!("Bridge for proxy '{}' stopped", self.config.proxy_name());
    }

    /// 注册成功后的活跃阶段：预建工作连接并发送心跳，直到会话关闭或停止
    async fn run_active(self: &Arc<Self>, session: &Arc<Session>) {
        self.set_state(BridgeState::Active);

        for _ in 0..self.config.initial_workers {
            self.spawn_worker();
        }

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval 的第一次 tick 立即完成
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = session.closed() => {
                    warn!("[{}] Control connection closed", session.id());
                    break;
                }
                _ = ticker.tick() => {
                    if !session.send_command(Command::Ping(Ping {})) {
                        warn!("[{}] Failed to send heartbeat", session.id());
                        session.close();
                        break;
                    }
                    debug!("[{}] Ping", session.id());
                }
            }
        }
    }

    /// 停止网桥：尽力发送 CloseProxy，然后关闭控制连接
    pub async fn stop(&self) {
        if self.is_stopped() {
            return;
        }

        let session = self.control.lock().clone();
        if let Some(session) = &session {
            let close = Command::CloseProxy(CloseProxy {
                proxy_name: self.config.proxy_name(),
            });
            match tokio::time::timeout(Duration::from_secs(1), session.send_command_sync(&close))
                .await
            {
                Ok(Ok(())) => debug!("[{}] CloseProxy sent", session.id()),
                Ok(Err(e)) => debug!("[{}] Failed to send CloseProxy: {}", session.id(), e),
                Err(_) => debug!("[{}] Timed out sending CloseProxy", session.id()),
            }
        }

        self.stop.cancel();
        if let Some(session) = session {
            session.close();
        }
        self.set_state(BridgeState::Stopped);
    }

    /// 异步创建一条工作连接，失败只记录日志
    pub fn spawn_worker(self: &Arc<Self>) {
        let bridge = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = bridge.stop.cancelled() => {}
                result = bridge.create_worker_connection() => {
                    if let Err(e) = result {
                        warn!("Work connection for '{}' failed: {}", bridge.config.proxy_name(), e);
                    }
                }
            }
        });
    }

    fn record_pong(&self) {
        *self.last_pong.lock() = Some(Instant::now());
    }
}

fn unexpected(expected: CommandKind, got: Command) -> TunnelError {
    if let Command::Response(resp) = &got {
        if !resp.is_success() {
            return TunnelError::Rejected(resp.message.clone());
        }
    }
    TunnelError::UnexpectedCommand {
        expected,
        got: got.kind(),
    }
}

/// 构造网桥控制会话的路由
fn build_router(bridge: Weak<Bridge>) -> Router {
    let mut router = Router::new();
    router.use_middleware(recover());

    {
        let bridge = bridge.clone();
        router.register(CommandKind::ReqWorkCtl, move |ctx| {
            let Some(Command::ReqWorkCtl(req)) = ctx.request() else {
                return;
            };
            let Some(bridge) = bridge.upgrade() else {
                return;
            };
            debug!("[{}] Portal requested a work connection for '{}'", ctx.session_id(), req.proxy_name);
            bridge.spawn_worker();
        });
    }

    {
        let bridge = bridge.clone();
        router.register(CommandKind::Pong, move |ctx| {
            if let Some(bridge) = bridge.upgrade() {
                bridge.record_pong();
            }
            debug!("[{}] Pong", ctx.session_id());
        });
    }

    router.register(CommandKind::CloseProxyResp, |ctx| {
        if let Some(Command::CloseProxyResp(resp)) = ctx.request() {
            info!("[{}] Proxy '{}' closed on portal", ctx.session_id(), resp.proxy_name);
        }
    });

    router.register(CommandKind::Response, |ctx| {
        if let Some(Command::Response(resp)) = ctx.request() {
            if !resp.is_success() {
                warn!(
                    "[{}] Portal replied with error {}: {}",
                    ctx.session_id(),
                    resp.code,
                    resp.message
                );
            }
        }
    });

    router.set_not_found(|ctx| {
        let kind = ctx.request().map(|r| r.kind().as_str()).unwrap_or("unknown");
        debug!("[{}] Ignoring command {}", ctx.session_id(), kind);
    });

    router
}

/// 运行网桥直到 Ctrl+C
pub async fn run_bridge(config: BridgeConfig, registry: Arc<CommandRegistry>) -> anyhow::Result<()> {
    let bridge = Bridge::new(config, registry)?;
    let run = tokio::spawn(bridge.clone().run());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    bridge.stop().await;
    run.await?;
    Ok(())
}
