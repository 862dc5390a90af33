/// Breaker 库入口
///
/// 将门户、网桥和协议模块导出为库，方便测试和复用
pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod io_util;
pub mod portal;
pub mod protocol;
pub mod session;

// 重新导出常用类型
pub use bridge::{run_bridge, Bridge, BridgeState, FileServer, LocalService, WorkerHandler};
pub use codec::{CodecError, FrameCodec};
pub use config::{AppConfig, BridgeConfig, PluginConfig, PortalConfig};
pub use error::{Result, TunnelError};
pub use portal::{run_portal, Portal};
pub use protocol::{Command, CommandKind, CommandRegistry, Response};
pub use session::{Context, Router, Session};
