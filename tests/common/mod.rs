//! Common utilities for integration tests
#![allow(dead_code)]

use breaker::codec::FrameCodec;
use breaker::config::{BridgeConfig, PortalConfig};
use breaker::portal::Portal;
use breaker::protocol::{Command, CommandRegistry};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

pub fn registry() -> Arc<CommandRegistry> {
    Arc::new(CommandRegistry::builtin())
}

pub fn codec() -> FrameCodec {
    FrameCodec::new(registry())
}

/// Portal config bound to loopback
pub fn portal_config(server_port: u16) -> PortalConfig {
    PortalConfig {
        server_addr: format!("127.0.0.1:{}", server_port),
        proxy_bind_addr: "127.0.0.1".to_string(),
        ..PortalConfig::default()
    }
}

/// Bridge config with a short reconnect delay
pub fn bridge_config(server_port: u16, local_port: u16, remote_port: u16, name: &str) -> BridgeConfig {
    let mut config = BridgeConfig::new(format!("127.0.0.1:{}", server_port), local_port, remote_port);
    config.proxy_name = Some(name.to_string());
    config.reconnect_delay_secs = Some(1);
    config.heartbeat_interval_secs = 1;
    config
}

/// Start a portal on an already bound control port
pub async fn start_portal(config: PortalConfig) -> (Arc<Portal>, JoinHandle<()>) {
    let portal = Portal::new(config, registry());
    let listener = portal.bind().await.expect("Failed to bind portal");
    let serve = portal.clone().serve(listener);
    let handle = tokio::spawn(async move {
        if let Err(e) = serve.await {
            eprintln!("portal stopped with error: {}", e);
        }
    });
    (portal, handle)
}

/// Create a simple echo server for testing
pub async fn start_echo_server(port: u16) -> JoinHandle<()> {
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind echo server");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => break,
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    })
}

/// Test data transmission through proxy
pub async fn test_proxy_connection(
    proxy_port: u16,
    test_data: &[u8],
    timeout_duration: Duration,
) -> Result<Vec<u8>, String> {
    timeout(timeout_duration, async {
        let mut stream = TcpStream::connect(format!("127.0.0.1:{}", proxy_port))
            .await
            .map_err(|e| format!("Failed to connect to proxy: {}", e))?;

        stream
            .write_all(test_data)
            .await
            .map_err(|e| format!("Failed to write data: {}", e))?;

        let mut response = Vec::new();
        let mut buf = vec![0u8; 8192];

        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    response.extend_from_slice(&buf[..n]);
                    if response.len() >= test_data.len() {
                        break;
                    }
                }
                Err(e) => return Err(format!("Failed to read response: {}", e)),
            }
        }

        Ok(response)
    })
    .await
    .map_err(|_| "Timeout waiting for response".to_string())?
}

/// Keep retrying a proxy round trip until it succeeds
pub async fn wait_for_tunnel(proxy_port: u16, attempts: u32) -> bool {
    for _ in 0..attempts {
        if let Ok(resp) = test_proxy_connection(proxy_port, b"ready?", Duration::from_secs(2)).await {
            if resp == b"ready?" {
                return true;
            }
        }
        sleep(Duration::from_millis(200)).await;
    }
    false
}

/// Wait for server to be ready
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_ok() {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Poll `cond` until it holds or `limit` passes
pub async fn wait_until<F>(limit: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let started = std::time::Instant::now();
    while started.elapsed() < limit {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Raw protocol client speaking frames directly to the portal
pub struct RawClient {
    pub stream: TcpStream,
    codec: FrameCodec,
}

impl RawClient {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .expect("Failed to connect to portal");
        Self {
            stream,
            codec: codec(),
        }
    }

    pub async fn send(&mut self, cmd: Command) {
        self.codec
            .write_frame(&mut self.stream, &cmd)
            .await
            .expect("Failed to write frame");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Failed to write");
    }

    pub async fn recv(&mut self) -> Command {
        timeout(Duration::from_secs(5), self.codec.read_frame(&mut self.stream))
            .await
            .expect("Timeout waiting for frame")
            .expect("Failed to read frame")
    }

    /// Wait for the next frame of a given kind, skipping others
    pub async fn recv_until<F>(&mut self, mut pred: F) -> Command
    where
        F: FnMut(&Command) -> bool,
    {
        loop {
            let cmd = self.recv().await;
            if pred(&cmd) {
                return cmd;
            }
        }
    }

    /// Whether the portal closed the connection within `limit`
    pub async fn is_closed_within(&mut self, limit: Duration) -> bool {
        let mut buf = [0u8; 64];
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}
