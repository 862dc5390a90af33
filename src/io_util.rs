/// 网络 I/O 辅助
///
/// 双向拼接、临时错误判定、accept 退避以及 TCP keepalive 设置
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// accept 退避初始值
pub const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
/// accept 退避上限
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);
/// 写重试的基础延迟，第 i 次重试等待 i 倍
pub const WRITE_RETRY_DELAY: Duration = Duration::from_millis(5);

/// 默认 keepalive 参数
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// 双向拼接两条连接
///
/// 任一方向结束（EOF 或错误）后关闭两端的写方向并返回，
/// 两条连接随后在 drop 时关闭，另一方向不会一直阻塞。
pub async fn splice<A, B>(a: A, b: B, label: &str)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async { tokio::io::copy(&mut a_read, &mut b_write).await };
    let b_to_a = async { tokio::io::copy(&mut b_read, &mut a_write).await };

    tokio::select! {
        result = a_to_b => match result {
            Ok(n) => debug!("[{}] inbound direction finished after {} bytes", label, n),
            Err(e) => debug!("[{}] inbound copy error: {}", label, e),
        },
        result = b_to_a => match result {
            Ok(n) => debug!("[{}] outbound direction finished after {} bytes", label, n),
            Err(e) => debug!("[{}] outbound copy error: {}", label, e),
        },
    }

    // 两个 copy future 已被丢弃，这里可以重新借用写半部
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
}

/// 写错误是否值得重试
pub fn is_temporary_write_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// accept 错误是否为临时错误（资源暂时耗尽或对端在握手中断开）
pub fn is_temporary_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }
    is_resource_exhausted(err)
}

#[cfg(target_os = "linux")]
fn is_resource_exhausted(err: &io::Error) -> bool {
    // ENOMEM, ENFILE, EMFILE, ENOBUFS
    matches!(err.raw_os_error(), Some(12 | 23 | 24 | 105))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_resource_exhausted(err: &io::Error) -> bool {
    // ENOMEM, ENFILE, EMFILE, ENOBUFS (BSD 系)
    matches!(err.raw_os_error(), Some(12 | 23 | 24 | 55))
}

#[cfg(not(unix))]
fn is_resource_exhausted(_err: &io::Error) -> bool {
    false
}

/// accept 失败时的指数退避：5ms 起步，每次翻倍，上限 1s
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// 计算下一次等待时间
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.delay {
            None => ACCEPT_BACKOFF_MIN,
            Some(d) => (d * 2).min(ACCEPT_BACKOFF_MAX),
        };
        self.delay = Some(next);
        next
    }

    /// 退避并等待
    pub async fn wait(&mut self, err: &io::Error) {
        let delay = self.next_delay();
        trace!("Temporary accept error: {}; retrying in {:?}", err, delay);
        tokio::time::sleep(delay).await;
    }

    /// accept 成功后复位
    pub fn reset(&mut self) {
        self.delay = None;
    }
}

/// 为连接开启 TCP keepalive
pub fn apply_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_accept_backoff_doubles_and_caps() {
        let mut backoff = AcceptBackoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), ACCEPT_BACKOFF_MAX);
        backoff.reset();
        assert_eq!(backoff.next_delay(), ACCEPT_BACKOFF_MIN);
    }

    #[test]
    fn test_temporary_error_classification() {
        assert!(is_temporary_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(!is_temporary_accept_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(is_temporary_write_error(&io::Error::from(
            io::ErrorKind::Interrupted
        )));
        assert!(!is_temporary_write_error(&io::Error::from(
            io::ErrorKind::BrokenPipe
        )));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_fd_exhaustion_is_temporary() {
        assert!(is_temporary_accept_error(&io::Error::from_raw_os_error(24)));
    }

    #[tokio::test]
    async fn test_splice_tears_down_both_sides() {
        let (client, proxy_side) = tokio::io::duplex(1024);
        let (worker_side, mut service) = tokio::io::duplex(1024);

        let task = tokio::spawn(async move {
            splice(proxy_side, worker_side, "test").await;
        });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        service.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        service.write_all(b"pong").await.unwrap();
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // 服务端关闭后客户端一侧也应读到 EOF
        drop(service);
        task.await.unwrap();
        let mut rest = Vec::new();
        client_read.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_apply_keepalive_on_tcp_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        apply_keepalive(&stream);
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }
}
