/// 门户侧的代理端点
///
/// 每个代理拥有一个公网监听端口和一个有界的工作连接池。公网连接到来时从池中取出
/// 一条工作连接并双向拼接；每取走一条就通过所属 Master 的控制连接请求网桥补充一条。
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::master::{Master, MasterTable};
use crate::config::PortalConfig;
use crate::error::{Result, TunnelError};
use crate::io_util::{apply_keepalive, is_temporary_accept_error, splice, AcceptBackoff};
use crate::protocol::{Command, ReqWorkCtl};

/// 代理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Registered,
    Listening,
    Closed,
}

/// 创建代理所需的参数
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// 监听主机
    pub bind_addr: String,
    /// 工作连接池容量
    pub pool_capacity: usize,
    /// 等待工作连接的超时
    pub worker_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self::from(&PortalConfig::default())
    }
}

impl From<&PortalConfig> for ProxyOptions {
    fn from(config: &PortalConfig) -> Self {
        Self {
            bind_addr: config.proxy_bind_addr.clone(),
            pool_capacity: config.worker_pool_capacity,
            worker_timeout: config.worker_timeout(),
        }
    }
}

/// 池中预留的一个位置；`commit` 时才真正放入连接
pub type WorkerSlot<'a> = mpsc::Permit<'a, TcpStream>;

/// 一个已注册的代理
pub struct Proxy {
    name: String,
    trace_id: String,
    masters: Weak<MasterTable>,
    state: Mutex<ProxyState>,
    pool_tx: mpsc::Sender<TcpStream>,
    pool_rx: tokio::sync::Mutex<mpsc::Receiver<TcpStream>>,
    capacity: usize,
    worker_timeout: Duration,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl Proxy {
    /// `trace_id` 与 `masters` 只用于按键查找所属 Master，不持有它
    pub fn new(
        name: impl Into<String>,
        trace_id: impl Into<String>,
        masters: Weak<MasterTable>,
        options: &ProxyOptions,
    ) -> Arc<Self> {
        let capacity = options.pool_capacity.max(1);
        let (pool_tx, pool_rx) = mpsc::channel(capacity);
        Arc::new(Self {
            name: name.into(),
            trace_id: trace_id.into(),
            masters,
            state: Mutex::new(ProxyState::Registered),
            pool_tx,
            pool_rx: tokio::sync::Mutex::new(pool_rx),
            capacity,
            worker_timeout: options.worker_timeout,
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ProxyState::Closed
    }

    /// 实际监听地址
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// 池中尚未被取走的工作连接数
    pub fn pooled(&self) -> usize {
        self.capacity - self.pool_tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 绑定监听端口并启动 accept 循环
    ///
    /// 绑定是同步完成的，失败时代理保持未监听状态。
    pub fn serve(self: &Arc<Self>, bind_addr: &str) -> Result<SocketAddr> {
        let listener = std::net::TcpListener::bind(bind_addr)
            .and_then(|l| l.set_nonblocking(true).map(|_| l))
            .and_then(TcpListener::from_std)
            .map_err(|e| TunnelError::bind_failed(bind_addr, e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TunnelError::bind_failed(bind_addr, e))?;

        {
            let mut state = self.state.lock();
            if *state == ProxyState::Closed {
                return Err(TunnelError::ProxyClosed(self.name.clone()));
            }
            *state = ProxyState::Listening;
        }
        *self.local_addr.lock() = Some(addr);

        info!("[{}] Proxy listening on {}", self.name, addr);
        tokio::spawn(self.clone().accept_loop(listener));
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut backoff = AcceptBackoff::new();

        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => result,
            };

            match result {
                Ok((stream, peer)) => {
                    backoff.reset();
                    debug!("[{}] Accepted public connection from {}", self.name, peer);
                    let proxy = self.clone();
                    tokio::spawn(async move {
                        proxy.handle_public(stream, peer).await;
                    });
                }
                Err(e) if is_temporary_accept_error(&e) => backoff.wait(&e).await,
                Err(e) => {
                    error!("[{}] Accept failed, closing proxy: {}", self.name, e);
                    self.fail();
                    break;
                }
            }
        }

        debug!("[{}] Listener closed", self.name);
    }

    async fn handle_public(self: Arc<Self>, public: TcpStream, peer: SocketAddr) {
        let worker = match self.get_worker_connection().await {
            Ok(worker) => worker,
            Err(e) => {
                warn!(
                    "[{}] Dropping public connection from {}: {}",
                    self.name, peer, e
                );
                return;
            }
        };

        apply_keepalive(&public);
        debug!("[{}] Splicing {} with a work connection", self.name, peer);
        tokio::select! {
            _ = splice(public, worker, &self.name) => {}
            _ = self.shutdown.cancelled() => {
                debug!("[{}] Tearing down tunnel for {}", self.name, peer);
            }
        }
    }

    /// 取出一条工作连接，最多等待 `worker_timeout`
    ///
    /// 取到后立即请求网桥补充一条；代理关闭后立即失败。
    pub async fn get_worker_connection(&self) -> Result<TcpStream> {
        if self.is_closed() {
            return Err(TunnelError::ProxyClosed(self.name.clone()));
        }

        let recv = async {
            let mut rx = self.pool_rx.lock().await;
            rx.recv().await
        };

        let received = tokio::select! {
            _ = self.shutdown.cancelled() => {
                return Err(TunnelError::ProxyClosed(self.name.clone()));
            }
            received = tokio::time::timeout(self.worker_timeout, recv) => received,
        };

        match received {
            Ok(Some(worker)) => {
                self.request_worker();
                Ok(worker)
            }
            Ok(None) => Err(TunnelError::ProxyClosed(self.name.clone())),
            Err(_) => {
                // 池可能已经空了，再要一条以便恢复
                self.request_worker();
                Err(TunnelError::worker_timeout(&self.name, self.worker_timeout))
            }
        }
    }

    /// 在池中预留一个位置，不阻塞
    pub fn reserve_worker(&self) -> Result<WorkerSlot<'_>> {
        if self.is_closed() {
            return Err(TunnelError::ProxyClosed(self.name.clone()));
        }
        self.pool_tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => TunnelError::PoolFull(self.name.clone()),
            mpsc::error::TrySendError::Closed(()) => TunnelError::ProxyClosed(self.name.clone()),
        })
    }

    /// 放入一条工作连接；池满或已关闭时返回 false，连接被丢弃（关闭）
    pub fn register_worker(&self, worker: TcpStream) -> bool {
        match self.reserve_worker() {
            Ok(slot) => {
                slot.send(worker);
                true
            }
            Err(e) => {
                debug!("[{}] Discarding work connection: {}", self.name, e);
                false
            }
        }
    }

    /// 通过所属 Master 的控制连接发送 ReqWorkCtl
    pub fn request_worker(&self) -> bool {
        let Some(master) = self.owner() else {
            debug!("[{}] Owning master is gone, not requesting workers", self.name);
            return false;
        };
        master
            .session()
            .send_command(Command::ReqWorkCtl(ReqWorkCtl {
                proxy_name: self.name.clone(),
            }))
    }

    fn owner(&self) -> Option<Arc<Master>> {
        self.masters.upgrade()?.get(&self.trace_id)
    }

    /// 关闭代理：停止监听，拆除进行中的拼接，关闭池中所有工作连接
    pub fn close(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ProxyState::Closed {
                return false;
            }
            *state = ProxyState::Closed;
        }

        self.shutdown.cancel();
        self.drain_pool();
        info!("[{}] Proxy closed", self.name);
        true
    }

    /// 关闭连接池并丢弃其中的连接
    pub(crate) fn drain_pool(self: &Arc<Self>) {
        match self.pool_rx.try_lock() {
            Ok(mut rx) => drain(&self.name, &mut rx),
            Err(_) => {
                // 有等待者持有接收端，它会因取消信号很快释放
                let proxy = self.clone();
                tokio::spawn(async move {
                    let mut rx = proxy.pool_rx.lock().await;
                    drain(&proxy.name, &mut rx);
                });
            }
        }
    }

    /// accept 失败时关闭自身并从所属 Master 中移除
    fn fail(self: &Arc<Self>) {
        if let Some(master) = self.owner() {
            master.remove_proxy(&self.name);
        }
        self.close();
    }
}

fn drain(name: &str, rx: &mut mpsc::Receiver<TcpStream>) {
    rx.close();
    let mut dropped = 0;
    while let Ok(worker) = rx.try_recv() {
        drop(worker);
        dropped += 1;
    }
    if dropped > 0 {
        debug!("[{}] Closed {} pooled work connections", name, dropped);
    }
}
