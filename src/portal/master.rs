/// 门户侧的网桥状态
///
/// 每个连上来的网桥对应一个 [`Master`]，以追踪 ID 为键登记在 [`MasterTable`] 中。
/// Master 独占它创建的代理；关闭 Master 会自上而下关闭控制会话和全部代理。
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::proxy::{Proxy, ProxyOptions};
use crate::error::{Result, TunnelError};
use crate::session::Session;

/// Master 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Created,
    Active,
    Closed,
}

/// 一个网桥的控制状态
pub struct Master {
    trace_id: String,
    session: Arc<Session>,
    proxies: Mutex<HashMap<String, Arc<Proxy>>>,
    last_ping: Mutex<Instant>,
    state: Mutex<MasterState>,
}

impl Master {
    pub fn new(trace_id: impl Into<String>, session: Arc<Session>) -> Arc<Self> {
        Arc::new(Self {
            trace_id: trace_id.into(),
            session,
            proxies: Mutex::new(HashMap::new()),
            last_ping: Mutex::new(Instant::now()),
            state: Mutex::new(MasterState::Created),
        })
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// 控制会话
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> MasterState {
        *self.state.lock()
    }

    /// 已回复 NewMasterResp，开始处理控制命令
    pub fn activate(&self) {
        let mut state = self.state.lock();
        if *state == MasterState::Created {
            *state = MasterState::Active;
        }
    }

    /// 记录一次心跳
    pub fn touch(&self) {
        *self.last_ping.lock() = Instant::now();
    }

    /// 距上次心跳的时长
    pub fn idle_for(&self) -> Duration {
        self.last_ping.lock().elapsed()
    }

    pub fn proxy(&self, name: &str) -> Option<Arc<Proxy>> {
        self.proxies.lock().get(name).cloned()
    }

    pub fn proxy_names(&self) -> Vec<String> {
        self.proxies.lock().keys().cloned().collect()
    }

    /// 创建并启动代理
    ///
    /// 同名代理已存在时直接失败，不会触碰已有代理的监听端口；绑定失败时不登记。
    pub fn new_proxy(
        &self,
        masters: &Arc<MasterTable>,
        name: &str,
        remote_port: u16,
        options: &ProxyOptions,
    ) -> Result<SocketAddr> {
        if self.state() == MasterState::Closed {
            return Err(TunnelError::MasterNotFound(self.trace_id.clone()));
        }

        // 检查与登记在同一把锁内完成
        let mut proxies = self.proxies.lock();
        if proxies.contains_key(name) {
            return Err(TunnelError::ProxyAlreadyExists(name.to_string()));
        }

        let proxy = Proxy::new(name, &self.trace_id, Arc::downgrade(masters), options);
        let addr = proxy.serve(&format!("{}:{}", options.bind_addr, remote_port))?;
        proxies.insert(name.to_string(), proxy);

        info!(
            "[{}] Proxy '{}' registered on {}",
            self.trace_id, name, addr
        );
        Ok(addr)
    }

    /// 关闭并移除代理
    pub fn close_proxy(&self, name: &str) -> Result<()> {
        let proxy = self
            .remove_proxy(name)
            .ok_or_else(|| TunnelError::ProxyNotFound(name.to_string()))?;
        proxy.close();
        Ok(())
    }

    pub(crate) fn remove_proxy(&self, name: &str) -> Option<Arc<Proxy>> {
        self.proxies.lock().remove(name)
    }

    /// 关闭控制会话与全部代理；只有第一次调用返回 true
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == MasterState::Closed {
                return false;
            }
            *state = MasterState::Closed;
        }

        self.session.close();
        let proxies: Vec<_> = self.proxies.lock().drain().map(|(_, p)| p).collect();
        for proxy in &proxies {
            proxy.close();
        }
        info!(
            "[{}] Master closed ({} proxies released)",
            self.trace_id,
            proxies.len()
        );
        true
    }
}

/// 门户范围的 Master 表
#[derive(Default)]
pub struct MasterTable {
    masters: RwLock<HashMap<String, Arc<Master>>>,
}

impl MasterTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 登记 Master；追踪 ID 已存在时返回 false
    pub fn register(&self, master: Arc<Master>) -> bool {
        let mut masters = self.masters.write();
        if masters.contains_key(master.trace_id()) {
            warn!("Master '{}' already registered", master.trace_id());
            return false;
        }
        masters.insert(master.trace_id().to_string(), master);
        true
    }

    pub fn get(&self, trace_id: &str) -> Option<Arc<Master>> {
        self.masters.read().get(trace_id).cloned()
    }

    pub fn remove(&self, trace_id: &str) -> Option<Arc<Master>> {
        self.masters.write().remove(trace_id)
    }

    /// 移除并关闭 Master
    pub fn close_master(&self, trace_id: &str) -> bool {
        match self.remove(trace_id) {
            Some(master) => {
                master.close();
                true
            }
            None => false,
        }
    }

    /// 超过 `timeout` 没有心跳的 Master
    pub fn expired(&self, timeout: Duration) -> Vec<Arc<Master>> {
        self.masters
            .read()
            .values()
            .filter(|m| m.idle_for() > timeout)
            .cloned()
            .collect()
    }

    /// 关闭全部 Master
    pub fn close_all(&self) {
        let masters: Vec<_> = self.masters.write().drain().map(|(_, m)| m).collect();
        for master in masters {
            master.close();
        }
    }

    pub fn len(&self) -> usize {
        self.masters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.read().is_empty()
    }
}
