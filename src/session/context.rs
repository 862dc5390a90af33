/// 请求/回复上下文与上下文池
///
/// 每条入站命令分配一个 [`Context`]，处理器在其中写入回复，之后交给会话的发送队列；
/// 回复写出后上下文按值归还给 [`ContextPool`]，归还时先清空再入池。
/// 归还需要移动所有权，调用方无法在归还后继续持有它。
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::Session;
use crate::protocol::Command;

/// 空闲上下文的默认保留上限
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// 一次请求/回复交换
#[derive(Default)]
pub struct Context {
    generation: u64,
    session: Option<Arc<Session>>,
    request: Option<Command>,
    response: Option<Command>,
    deadline: Option<Instant>,
    storage: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Context {
    /// 分配序号，每次从池中取出都会递增
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn set_session(&mut self, session: Arc<Session>) -> &mut Self {
        self.session = Some(session);
        self
    }

    /// 所属会话的标识，没有会话时为空串
    pub fn session_id(&self) -> String {
        self.session.as_ref().map(|s| s.id()).unwrap_or_default()
    }

    pub fn request(&self) -> Option<&Command> {
        self.request.as_ref()
    }

    pub fn set_request(&mut self, cmd: Command) -> &mut Self {
        self.request = Some(cmd);
        self
    }

    pub fn response(&self) -> Option<&Command> {
        self.response.as_ref()
    }

    /// 设置要回复的命令
    pub fn respond(&mut self, cmd: Command) -> &mut Self {
        self.response = Some(cmd);
        self
    }

    pub fn take_response(&mut self) -> Option<Command> {
        self.response.take()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Instant) -> &mut Self {
        self.deadline = Some(deadline);
        self
    }

    /// 截止时间是否已过
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// 中间件之间传递数据
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.storage.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.storage.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.storage.remove(key).is_some()
    }

    /// 通过所属会话的发送队列回复
    pub fn send(self) -> bool {
        match self.session.clone() {
            Some(session) => session.send(self),
            None => false,
        }
    }

    fn reset(&mut self) {
        self.session = None;
        self.request = None;
        self.response = None;
        self.deadline = None;
        self.storage.clear();
    }
}

/// 上下文空闲链表
pub struct ContextPool {
    free: Mutex<Vec<Context>>,
    generation: AtomicU64,
    capacity: usize,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            generation: AtomicU64::new(0),
            capacity,
        }
    }

    /// 取出一个干净的上下文
    pub fn allocate(&self) -> Context {
        let mut ctx = self.free.lock().pop().unwrap_or_default();
        // 入池前已经清空过，这里再清一次以防池外构造的上下文混入
        ctx.reset();
        ctx.generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        ctx
    }

    /// 归还上下文；超出保留上限的直接丢弃
    pub fn release(&self, mut ctx: Context) {
        ctx.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(ctx);
        }
    }

    /// 池中空闲上下文数量
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Ping, Pong};
    use std::time::Duration;

    #[test]
    fn test_released_context_is_clean() {
        let pool = ContextPool::new(4);
        let mut ctx = pool.allocate();
        ctx.set_request(Command::Ping(Ping {}));
        ctx.respond(Command::Pong(Pong {}));
        ctx.set("user", 42u32);
        ctx.set_deadline(Instant::now());
        let first_generation = ctx.generation();
        pool.release(ctx);
        assert_eq!(pool.idle(), 1);

        let ctx = pool.allocate();
        assert_eq!(pool.idle(), 0);
        assert!(ctx.generation() > first_generation);
        assert!(ctx.request().is_none());
        assert!(ctx.response().is_none());
        assert!(ctx.session().is_none());
        assert!(ctx.deadline().is_none());
        assert!(ctx.get::<u32>("user").is_none());
    }

    #[test]
    fn test_pool_capacity_bound() {
        let pool = ContextPool::new(2);
        let contexts: Vec<_> = (0..5).map(|_| pool.allocate()).collect();
        for ctx in contexts {
            pool.release(ctx);
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_storage_typed_access() {
        let mut ctx = Context::default();
        ctx.set("name", "web".to_string());
        assert_eq!(ctx.get::<String>("name").map(String::as_str), Some("web"));
        assert!(ctx.get::<u32>("name").is_none());
        assert!(ctx.remove("name"));
        assert!(!ctx.remove("name"));
    }

    #[test]
    fn test_deadline_expiry() {
        let mut ctx = Context::default();
        assert!(!ctx.is_expired());
        ctx.set_deadline(Instant::now() + Duration::from_secs(60));
        assert!(!ctx.is_expired());
        ctx.set_deadline(Instant::now() - Duration::from_millis(1));
        assert!(ctx.is_expired());
    }

    #[test]
    fn test_send_without_session_fails() {
        let mut ctx = Context::default();
        ctx.respond(Command::Pong(Pong {}));
        assert!(!ctx.send());
    }
}
