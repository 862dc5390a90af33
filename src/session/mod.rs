/// 控制会话
///
/// 一条控制连接对应一个 [`Session`]：入站循环解码命令并交给 [`Router`]，
/// 出站循环按入队顺序写出回复。关闭是幂等的，并通过取消令牌通知两个循环退出。
pub mod context;
pub mod router;

pub use context::{Context, ContextPool};
pub use router::{recover, Handler, Middleware, Router};

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::codec::{CodecError, FrameCodec};
use crate::config::SessionConfig;
use crate::error::{Result, TunnelError};
use crate::io_util::{is_temporary_write_error, WRITE_RETRY_DELAY};
use crate::protocol::Command;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// 一条控制连接
pub struct Session {
    id: RwLock<String>,
    state: Mutex<SessionState>,
    closed: CancellationToken,
    queue: mpsc::Sender<Context>,
    pending: Mutex<Option<(BoxedReader, mpsc::Receiver<Context>)>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    codec: FrameCodec,
    pool: ContextPool,
    config: SessionConfig,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &*self.id.read())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

/// 循环退出（包括 panic 展开）时关闭会话
struct CloseGuard(Arc<Session>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl Session {
    /// 接管连接并启动入站、出站两个循环
    pub fn spawn<S>(
        stream: S,
        codec: FrameCodec,
        router: Arc<Router>,
        config: SessionConfig,
    ) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = Session::new(stream, codec, config);
        session.start(router);
        session
    }

    /// 接管连接但暂不读取
    ///
    /// 调用 [`Session::start`] 之前不会处理任何入站命令，已入队的回复也不会写出，
    /// 调用方可以先完成标识与登记。
    pub fn new<S>(stream: S, codec: FrameCodec, config: SessionConfig) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (queue, rx) = mpsc::channel(config.queue_size.max(1));

        Arc::new(Session {
            id: RwLock::new(Uuid::new_v4().to_string()),
            state: Mutex::new(SessionState::Open),
            closed: CancellationToken::new(),
            queue,
            pending: Mutex::new(Some((Box::new(reader), rx))),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            codec,
            pool: ContextPool::default(),
            config,
        })
    }

    /// 启动入站、出站循环；重复调用无效果
    pub fn start(self: &Arc<Self>, router: Arc<Router>) -> bool {
        let Some((reader, rx)) = self.pending.lock().take() else {
            return false;
        };
        tokio::spawn(self.clone().inbound_loop(reader, router));
        tokio::spawn(self.clone().outbound_loop(rx));
        true
    }

    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    /// 更换标识（网桥在注册成功后改用门户分配的追踪 ID）
    pub fn set_id(&self, id: impl Into<String>) {
        *self.id.write() = id.into();
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::Open
    }

    /// 等待会话关闭
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// 会话关闭信号，可供兄弟任务监听
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// 关闭会话；只有第一次调用返回 true
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Open {
                return false;
            }
            *state = SessionState::Closing;
        }
        self.closed.cancel();
        info!("[{}] Session closed", self.id());
        true
    }

    /// 分配一个绑定到本会话的上下文
    pub fn allocate_context(self: &Arc<Self>) -> Context {
        let mut ctx = self.pool.allocate();
        ctx.set_session(self.clone());
        ctx
    }

    /// 把上下文放入发送队列；队列满、会话已关闭或上下文已过期时返回 false
    pub fn send(&self, ctx: Context) -> bool {
        if self.is_closed() {
            self.pool.release(ctx);
            return false;
        }
        if ctx.is_expired() {
            debug!("[{}] Context deadline passed, dropping response", self.id());
            self.pool.release(ctx);
            return false;
        }
        match self.queue.try_send(ctx) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(ctx)) => {
                warn!("[{}] Outbound queue is full, dropping response", self.id());
                self.pool.release(ctx);
                false
            }
            Err(mpsc::error::TrySendError::Closed(ctx)) => {
                self.pool.release(ctx);
                false
            }
        }
    }

    /// 主动发送一条命令（经过发送队列）
    pub fn send_command(self: &Arc<Self>, cmd: Command) -> bool {
        let mut ctx = self.allocate_context();
        ctx.respond(cmd);
        self.send(ctx)
    }

    /// 绕过队列直接写出上下文中的回复，只尝试一次
    pub async fn send_sync(&self, mut ctx: Context) -> bool {
        let response = ctx.take_response();
        self.pool.release(ctx);
        match response {
            Some(cmd) => self.send_command_sync(&cmd).await.is_ok(),
            None => true,
        }
    }

    /// 绕过队列直接写出一条命令
    pub async fn send_command_sync(&self, cmd: &Command) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        let frame = self.codec.encode(cmd)?;
        self.write_frame(&frame, 1).await?;
        Ok(())
    }

    async fn inbound_loop<R>(self: Arc<Self>, reader: R, router: Arc<Router>)
    where
        R: AsyncRead + Unpin + Send,
    {
        let _guard = CloseGuard(self.clone());
        let mut frames = FramedRead::new(reader, self.codec.clone());

        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => break,
                next = self.next_frame(&mut frames) => next,
            };

            match next {
                Ok(Some(cmd)) => {
                    trace!("[{}] Received {}", self.id(), cmd.kind());
                    self.handle_request(cmd, &router);
                }
                Ok(None) | Err(TunnelError::Codec(CodecError::Closed)) => {
                    debug!("[{}] Peer closed the connection", self.id());
                    break;
                }
                Err(e) => {
                    warn!("[{}] Failed to read command: {}", self.id(), e);
                    break;
                }
            }
        }
    }

    async fn next_frame<R>(&self, frames: &mut FramedRead<R, FrameCodec>) -> Result<Option<Command>>
    where
        R: AsyncRead + Unpin,
    {
        let next = match self.config.read_timeout() {
            Some(duration) => tokio::time::timeout(duration, frames.next())
                .await
                .map_err(|_| TunnelError::timeout(duration))?,
            None => frames.next().await,
        };
        Ok(next.transpose()?)
    }

    fn handle_request(self: &Arc<Self>, cmd: Command, router: &Router) {
        let mut ctx = self.allocate_context();
        ctx.set_request(cmd);
        router.dispatch(&mut ctx);

        if ctx.response().is_some() {
            self.send(ctx);
        } else {
            self.pool.release(ctx);
        }
    }

    async fn outbound_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Context>) {
        let guard = CloseGuard(self.clone());

        loop {
            let mut ctx = tokio::select! {
                _ = self.closed.cancelled() => break,
                ctx = rx.recv() => match ctx {
                    Some(ctx) => ctx,
                    None => break,
                },
            };

            let response = ctx.take_response();
            self.pool.release(ctx);
            let Some(cmd) = response else {
                continue;
            };

            let frame = match self.codec.encode(&cmd) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("[{}] Failed to encode {}: {}", self.id(), cmd.kind(), e);
                    continue;
                }
            };

            if let Err(e) = self.write_frame(&frame, self.config.write_attempts).await {
                warn!("[{}] Failed to write {}: {}", self.id(), cmd.kind(), e);
                break;
            }
        }

        drop(guard);
        // 队列中剩余的回复随接收端一起丢弃
        rx.close();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        *self.state.lock() = SessionState::Closed;
    }

    /// 写出一帧，只在临时错误时重试，第 i 次重试前等待 i 倍基础延迟
    ///
    /// 重试从上次写到的位置继续，已写出的字节不会重发。
    async fn write_frame(&self, frame: &[u8], attempts: u32) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session closed"))?;

        let attempts = attempts.max(1);
        let mut attempt = 0;
        let mut written = 0;
        loop {
            let result = match self.config.write_timeout() {
                Some(duration) => {
                    tokio::time::timeout(duration, write_from(writer, frame, &mut written))
                        .await
                        .unwrap_or_else(|_| {
                            Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
                        })
                }
                None => write_from(writer, frame, &mut written).await,
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if is_temporary_write_error(&e) && attempt + 1 < attempts => {
                    attempt += 1;
                    trace!(
                        "[{}] Temporary write error after {}/{} bytes: {}; retry {}/{}",
                        self.id(),
                        written,
                        frame.len(),
                        e,
                        attempt,
                        attempts - 1
                    );
                    tokio::time::sleep(WRITE_RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// 从 `written` 处继续写出剩余字节并刷新，`written` 随进度更新
async fn write_from<W>(writer: &mut W, frame: &[u8], written: &mut usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    while *written < frame.len() {
        let n = writer.write(&frame[*written..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        *written += n;
    }
    writer.flush().await
}
