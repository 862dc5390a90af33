/// 门户与网桥之间的控制命令定义
///
/// 每种命令都有一个固定的单字节类型标签，载荷使用 JSON 序列化。
/// 标签与命令类型之间的映射由 [`CommandRegistry`] 显式维护，进程启动时构造一次，
/// 然后传给编解码器使用。
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::codec::CodecError;
use crate::error::{TunnelError, CODE_ERROR, CODE_SUCCESS};

/// 网桥注册控制连接
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMaster {}

/// 门户对 NewMaster 的回复，携带分配的追踪 ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMasterResp {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 在门户上注册一个代理
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProxy {
    pub proxy_name: String,
    pub remote_port: u16,
    pub trace_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProxyResp {
    pub proxy_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseProxy {
    pub proxy_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseProxyResp {
    pub proxy_name: String,
}

/// 在独立的工作连接上发送，把这条连接登记到代理的工作连接池
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkCtl {
    pub trace_id: String,
    pub proxy_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkCtlResp {
    pub proxy_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 门户请求网桥立即补充一条工作连接
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqWorkCtl {
    pub proxy_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {}

/// 通用回复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    /// 成功回复
    pub fn success() -> Self {
        Self {
            code: CODE_SUCCESS,
            message: "success".to_string(),
            data: None,
        }
    }

    /// 错误回复
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// 从错误构造回复，回复码取自错误类型
    pub fn from_error(err: &TunnelError) -> Self {
        Self::error(err.code(), err.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::error(CODE_ERROR, "")
    }
}

/// 命令类型（不带载荷）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    NewMaster,
    NewMasterResp,
    NewProxy,
    NewProxyResp,
    CloseProxy,
    CloseProxyResp,
    NewWorkCtl,
    NewWorkCtlResp,
    ReqWorkCtl,
    Ping,
    Pong,
    Response,
}

impl CommandKind {
    /// 全部内置命令类型
    pub const ALL: [CommandKind; 12] = [
        CommandKind::NewMaster,
        CommandKind::NewMasterResp,
        CommandKind::NewProxy,
        CommandKind::NewProxyResp,
        CommandKind::CloseProxy,
        CommandKind::CloseProxyResp,
        CommandKind::NewWorkCtl,
        CommandKind::NewWorkCtlResp,
        CommandKind::ReqWorkCtl,
        CommandKind::Ping,
        CommandKind::Pong,
        CommandKind::Response,
    ];

    /// 内置的线路标签
    pub const fn default_tag(self) -> u8 {
        match self {
            CommandKind::CloseProxy => b'1',
            CommandKind::NewProxy => b'2',
            CommandKind::NewWorkCtl => b'3',
            CommandKind::NewMaster => b'4',
            CommandKind::ReqWorkCtl => b'5',
            CommandKind::CloseProxyResp => b'6',
            CommandKind::NewProxyResp => b'7',
            CommandKind::NewWorkCtlResp => b'8',
            CommandKind::NewMasterResp => b'9',
            CommandKind::Ping => b'a',
            CommandKind::Pong => b'b',
            CommandKind::Response => b'r',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::NewMaster => "NewMaster",
            CommandKind::NewMasterResp => "NewMasterResp",
            CommandKind::NewProxy => "NewProxy",
            CommandKind::NewProxyResp => "NewProxyResp",
            CommandKind::CloseProxy => "CloseProxy",
            CommandKind::CloseProxyResp => "CloseProxyResp",
            CommandKind::NewWorkCtl => "NewWorkCtl",
            CommandKind::NewWorkCtlResp => "NewWorkCtlResp",
            CommandKind::ReqWorkCtl => "ReqWorkCtl",
            CommandKind::Ping => "Ping",
            CommandKind::Pong => "Pong",
            CommandKind::Response => "Response",
        }
    }

    /// 把载荷反序列化为该类型的命令
    pub fn decode_payload(self, payload: &[u8]) -> Result<Command, CodecError> {
        fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
            serde_json::from_slice(payload).map_err(CodecError::Malformed)
        }

        Ok(match self {
            CommandKind::NewMaster => Command::NewMaster(parse(payload)?),
            CommandKind::NewMasterResp => Command::NewMasterResp(parse(payload)?),
            CommandKind::NewProxy => Command::NewProxy(parse(payload)?),
            CommandKind::NewProxyResp => Command::NewProxyResp(parse(payload)?),
            CommandKind::CloseProxy => Command::CloseProxy(parse(payload)?),
            CommandKind::CloseProxyResp => Command::CloseProxyResp(parse(payload)?),
            CommandKind::NewWorkCtl => Command::NewWorkCtl(parse(payload)?),
            CommandKind::NewWorkCtlResp => Command::NewWorkCtlResp(parse(payload)?),
            CommandKind::ReqWorkCtl => Command::ReqWorkCtl(parse(payload)?),
            CommandKind::Ping => Command::Ping(parse(payload)?),
            CommandKind::Pong => Command::Pong(parse(payload)?),
            CommandKind::Response => Command::Response(parse(payload)?),
        })
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 控制命令
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    NewMaster(NewMaster),
    NewMasterResp(NewMasterResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    CloseProxyResp(CloseProxyResp),
    NewWorkCtl(NewWorkCtl),
    NewWorkCtlResp(NewWorkCtlResp),
    ReqWorkCtl(ReqWorkCtl),
    Ping(Ping),
    Pong(Pong),
    Response(Response),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::NewMaster(_) => CommandKind::NewMaster,
            Command::NewMasterResp(_) => CommandKind::NewMasterResp,
            Command::NewProxy(_) => CommandKind::NewProxy,
            Command::NewProxyResp(_) => CommandKind::NewProxyResp,
            Command::CloseProxy(_) => CommandKind::CloseProxy,
            Command::CloseProxyResp(_) => CommandKind::CloseProxyResp,
            Command::NewWorkCtl(_) => CommandKind::NewWorkCtl,
            Command::NewWorkCtlResp(_) => CommandKind::NewWorkCtlResp,
            Command::ReqWorkCtl(_) => CommandKind::ReqWorkCtl,
            Command::Ping(_) => CommandKind::Ping,
            Command::Pong(_) => CommandKind::Pong,
            Command::Response(_) => CommandKind::Response,
        }
    }

    /// 序列化载荷（不含标签和长度前缀）
    pub fn encode_payload(&self) -> Result<Vec<u8>, CodecError> {
        let payload = match self {
            Command::NewMaster(c) => serde_json::to_vec(c),
            Command::NewMasterResp(c) => serde_json::to_vec(c),
            Command::NewProxy(c) => serde_json::to_vec(c),
            Command::NewProxyResp(c) => serde_json::to_vec(c),
            Command::CloseProxy(c) => serde_json::to_vec(c),
            Command::CloseProxyResp(c) => serde_json::to_vec(c),
            Command::NewWorkCtl(c) => serde_json::to_vec(c),
            Command::NewWorkCtlResp(c) => serde_json::to_vec(c),
            Command::ReqWorkCtl(c) => serde_json::to_vec(c),
            Command::Ping(c) => serde_json::to_vec(c),
            Command::Pong(c) => serde_json::to_vec(c),
            Command::Response(c) => serde_json::to_vec(c),
        };
        payload.map_err(CodecError::Encoding)
    }
}

/// 标签与命令类型之间的双向映射
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    by_tag: HashMap<u8, CommandKind>,
    by_kind: HashMap<CommandKind, u8>,
}

impl CommandRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册全部内置命令
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for kind in CommandKind::ALL {
            // 内置标签互不相同，不会冲突
            if let Err(e) = registry.register(kind.default_tag(), kind) {
                unreachable!("builtin command table is inconsistent: {}", e);
            }
        }
        registry
    }

    /// 注册一个标签；标签或类型重复注册都是配置错误
    pub fn register(&mut self, tag: u8, kind: CommandKind) -> Result<(), CodecError> {
        if let Some(existing) = self.by_tag.get(&tag) {
            return Err(CodecError::DuplicateTag {
                tag,
                existing: *existing,
            });
        }
        if self.by_kind.contains_key(&kind) {
            return Err(CodecError::DuplicateKind(kind));
        }
        self.by_tag.insert(tag, kind);
        self.by_kind.insert(kind, tag);
        Ok(())
    }

    /// 按标签查找命令类型
    pub fn kind_of(&self, tag: u8) -> Option<CommandKind> {
        self.by_tag.get(&tag).copied()
    }

    /// 按命令类型查找标签
    pub fn tag_of(&self, kind: CommandKind) -> Option<u8> {
        self.by_kind.get(&kind).copied()
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_is_bijective() {
        let registry = CommandRegistry::builtin();
        assert_eq!(registry.len(), CommandKind::ALL.len());
        for kind in CommandKind::ALL {
            let tag = registry.tag_of(kind).unwrap();
            assert_eq!(registry.kind_of(tag), Some(kind));
        }
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let mut registry = CommandRegistry::new();
        registry.register(b'x', CommandKind::Ping).unwrap();
        let err = registry.register(b'x', CommandKind::Pong).unwrap_err();
        assert!(matches!(
            err,
            CodecError::DuplicateTag {
                tag: b'x',
                existing: CommandKind::Ping
            }
        ));
        // 失败的注册不留痕迹
        assert_eq!(registry.tag_of(CommandKind::Pong), None);
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let mut registry = CommandRegistry::new();
        registry.register(b'x', CommandKind::Ping).unwrap();
        let err = registry.register(b'y', CommandKind::Ping).unwrap_err();
        assert!(matches!(err, CodecError::DuplicateKind(CommandKind::Ping)));
    }

    #[test]
    fn test_payload_field_names() {
        let cmd = Command::NewProxy(NewProxy {
            proxy_name: "web".to_string(),
            remote_port: 9000,
            trace_id: "t-1".to_string(),
        });
        let payload = String::from_utf8(cmd.encode_payload().unwrap()).unwrap();
        assert!(payload.contains("\"proxy_name\":\"web\""));
        assert!(payload.contains("\"remote_port\":9000"));
    }

    #[test]
    fn test_optional_error_field_omitted() {
        let cmd = Command::NewWorkCtlResp(NewWorkCtlResp {
            proxy_name: "web".to_string(),
            error: None,
        });
        let payload = cmd.encode_payload().unwrap();
        assert_eq!(payload, br#"{"proxy_name":"web"}"#);
        let decoded = CommandKind::NewWorkCtlResp.decode_payload(&payload).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_malformed_payload() {
        let err = CommandKind::NewProxy.decode_payload(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_response_helpers() {
        assert!(Response::success().is_success());
        let err = TunnelError::ProxyNotFound("web".to_string());
        let resp = Response::from_error(&err);
        assert!(!resp.is_success());
        assert_eq!(resp.code, err.code());
        assert!(resp.message.contains("web"));
    }
}
