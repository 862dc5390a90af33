/// 控制帧编解码
///
/// 帧格式：`[1 字节类型标签][8 字节大端有符号长度][JSON 载荷]`。
///
/// 控制会话使用 [`FrameCodec`] 的 `Decoder`/`Encoder` 实现（配合 `FramedRead`）。
/// 握手阶段使用 [`FrameCodec::read_frame`]，它只读取恰好一帧的字节，
/// 因为工作连接在握手之后立即变成原始字节流，不能多读。
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{Command, CommandKind, CommandRegistry};

/// 默认最大帧长度（载荷字节数）
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 10240;

/// 标签 + 长度前缀
pub const HEADER_LEN: usize = 1 + 8;

/// 编解码错误；任何解码错误都会使所在连接失步，调用方必须关闭连接
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unknown command type tag 0x{0:02x}")]
    UnknownType(u8),

    #[error("frame length {length} exceeds the limit of {max} bytes")]
    LengthExceeded { length: i64, max: usize },

    #[error("negative frame length {0}")]
    NegativeLength(i64),

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to encode payload: {0}")]
    Encoding(#[source] serde_json::Error),

    #[error("command {0} is not registered")]
    Unregistered(CommandKind),

    #[error("tag 0x{tag:02x} already registered for {existing}")]
    DuplicateTag { tag: u8, existing: CommandKind },

    #[error("command {0} already registered")]
    DuplicateKind(CommandKind),

    /// 在帧边界处遇到 EOF
    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// 控制帧编解码器
#[derive(Debug, Clone)]
pub struct FrameCodec {
    registry: Arc<CommandRegistry>,
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self::with_max_frame_length(registry, DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(registry: Arc<CommandRegistry>, max_frame_length: usize) -> Self {
        Self {
            registry,
            max_frame_length,
        }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// 编码一条命令为完整的帧
    pub fn encode(&self, cmd: &Command) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode_into(cmd, &mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_into(&self, cmd: &Command, dst: &mut BytesMut) -> Result<(), CodecError> {
        let kind = cmd.kind();
        let tag = self
            .registry
            .tag_of(kind)
            .ok_or(CodecError::Unregistered(kind))?;
        let payload = cmd.encode_payload()?;
        // 对端会拒绝超长帧，发送前就拦下
        if payload.len() > self.max_frame_length {
            return Err(CodecError::LengthExceeded {
                length: payload.len() as i64,
                max: self.max_frame_length,
            });
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(tag);
        dst.put_i64(payload.len() as i64);
        dst.extend_from_slice(&payload);
        Ok(())
    }

    fn kind_of(&self, tag: u8) -> Result<CommandKind, CodecError> {
        self.registry
            .kind_of(tag)
            .ok_or(CodecError::UnknownType(tag))
    }

    fn check_length(&self, length: i64) -> Result<usize, CodecError> {
        if length < 0 {
            return Err(CodecError::NegativeLength(length));
        }
        if length as u64 > self.max_frame_length as u64 {
            return Err(CodecError::LengthExceeded {
                length,
                max: self.max_frame_length,
            });
        }
        Ok(length as usize)
    }

    /// 从流中读取恰好一帧
    ///
    /// 长度校验失败时只消耗了标签和长度前缀。
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Command, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut tag = [0u8; 1];
        if read_full(reader, &mut tag).await? == 0 {
            return Err(CodecError::Closed);
        }
        let kind = self.kind_of(tag[0])?;

        let mut len_buf = [0u8; 8];
        let n = read_full(reader, &mut len_buf).await?;
        if n < len_buf.len() {
            return Err(CodecError::ShortRead {
                expected: len_buf.len(),
                actual: n,
            });
        }
        let length = self.check_length(i64::from_be_bytes(len_buf))?;

        let mut payload = vec![0u8; length];
        let n = read_full(reader, &mut payload).await?;
        if n < length {
            return Err(CodecError::ShortRead {
                expected: length,
                actual: n,
            });
        }

        kind.decode_payload(&payload)
    }

    /// 编码并直接写出一帧
    pub async fn write_frame<W>(&self, writer: &mut W, cmd: &Command) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(cmd)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// 尽量读满缓冲区，返回实际读取的字节数（遇到 EOF 时可能少于缓冲区长度）
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Decoder for FrameCodec {
    type Item = Command;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, CodecError> {
        if src.is_empty() {
            return Ok(None);
        }
        // 标签不合法时不必等待长度字段
        let kind = self.kind_of(src[0])?;
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let mut len_buf = [0u8; 8];
        len_buf.copy_from_slice(&src[1..HEADER_LEN]);
        let length = self.check_length(i64::from_be_bytes(len_buf))?;

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length);
        kind.decode_payload(&payload).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Command>, CodecError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => {
                let expected = if buf.len() < HEADER_LEN {
                    HEADER_LEN
                } else {
                    let mut len_buf = [0u8; 8];
                    len_buf.copy_from_slice(&buf[1..HEADER_LEN]);
                    HEADER_LEN + i64::from_be_bytes(len_buf) as usize
                };
                Err(CodecError::ShortRead {
                    expected,
                    actual: buf.len(),
                })
            }
        }
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.encode_into(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        CloseProxy, CloseProxyResp, NewMaster, NewMasterResp, NewProxy, NewProxyResp,
        NewWorkCtl, NewWorkCtlResp, Ping, Pong, ReqWorkCtl, Response,
    };

    fn codec() -> FrameCodec {
        FrameCodec::new(Arc::new(CommandRegistry::builtin()))
    }

    fn header(tag: u8, length: i64) -> Vec<u8> {
        let mut buf = vec![tag];
        buf.extend_from_slice(&length.to_be_bytes());
        buf
    }

    #[test]
    fn test_frame_layout() {
        let frame = codec()
            .encode(&Command::ReqWorkCtl(ReqWorkCtl {
                proxy_name: "web".to_string(),
            }))
            .unwrap();
        let payload = br#"{"proxy_name":"web"}"#;
        assert_eq!(frame[0], b'5');
        assert_eq!(&frame[1..HEADER_LEN], &(payload.len() as i64).to_be_bytes());
        assert_eq!(&frame[HEADER_LEN..], payload);
    }

    #[test]
    fn test_decoder_waits_for_complete_frame() {
        let mut codec = codec();
        let frame = codec.encode(&Command::Ping(Ping {})).unwrap();
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Command::Ping(Ping {}))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_rejects_unknown_tag_immediately() {
        let mut buf = BytesMut::from(&b"z"[..]);
        let err = codec().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(b'z')));
    }

    /// 每种命令各一条，字段取非默认值
    fn sample_commands() -> Vec<Command> {
        vec![
            Command::NewMaster(NewMaster {}),
            Command::NewMasterResp(NewMasterResp {
                session_id: "6f1c2d3e".to_string(),
                error: Some("portal is full".to_string()),
            }),
            Command::NewProxy(NewProxy {
                proxy_name: "web".to_string(),
                remote_port: 18080,
                trace_id: "6f1c2d3e".to_string(),
            }),
            Command::NewProxyResp(NewProxyResp {
                proxy_name: "web".to_string(),
                error: Some("address in use".to_string()),
            }),
            Command::CloseProxy(CloseProxy {
                proxy_name: "web".to_string(),
            }),
            Command::CloseProxyResp(CloseProxyResp {
                proxy_name: "web".to_string(),
            }),
            Command::NewWorkCtl(NewWorkCtl {
                trace_id: "6f1c2d3e".to_string(),
                proxy_name: "web".to_string(),
            }),
            Command::NewWorkCtlResp(NewWorkCtlResp {
                proxy_name: "web".to_string(),
                error: Some("pool full".to_string()),
            }),
            Command::ReqWorkCtl(ReqWorkCtl {
                proxy_name: "ssh".to_string(),
            }),
            Command::Ping(Ping {}),
            Command::Pong(Pong {}),
            Command::Response(Response {
                code: 1002,
                message: "proxy not found".to_string(),
                data: Some(serde_json::json!({ "proxy_name": "web", "ports": [1, 2] })),
            }),
        ]
    }

    #[test]
    fn test_samples_cover_every_kind() {
        let kinds: Vec<CommandKind> = sample_commands().iter().map(Command::kind).collect();
        for kind in CommandKind::ALL {
            assert!(kinds.contains(&kind), "no sample for {}", kind);
        }
    }

    #[tokio::test]
    async fn test_read_frame_returns_what_was_encoded() {
        let codec = codec();
        for cmd in sample_commands() {
            let frame = codec.encode(&cmd).unwrap();
            let mut reader = &frame[..];
            assert_eq!(codec.read_frame(&mut reader).await.unwrap(), cmd);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_decoder_returns_what_was_encoded() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        let samples = sample_commands();
        for cmd in &samples {
            Encoder::encode(&mut codec, cmd.clone(), &mut buf).unwrap();
        }
        for cmd in samples {
            assert_eq!(codec.decode(&mut buf).unwrap(), Some(cmd));
        }
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decoder_length_checks() {
        let mut buf = BytesMut::from(&header(b'a', 10241)[..]);
        assert!(matches!(
            codec().decode(&mut buf).unwrap_err(),
            CodecError::LengthExceeded { length: 10241, .. }
        ));

        let mut buf = BytesMut::from(&header(b'a', -1)[..]);
        assert!(matches!(
            codec().decode(&mut buf).unwrap_err(),
            CodecError::NegativeLength(-1)
        ));
    }

    #[test]
    fn test_decode_eof_with_partial_frame() {
        let mut buf = BytesMut::from(&header(b'a', 2)[..]);
        buf.extend_from_slice(b"{");
        let err = codec().decode_eof(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::ShortRead {
                expected: 11,
                actual: 10
            }
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let codec = FrameCodec::with_max_frame_length(Arc::new(CommandRegistry::builtin()), 8);
        let err = codec
            .encode(&Command::NewProxy(NewProxy {
                proxy_name: "a-rather-long-name".to_string(),
                remote_port: 1,
                trace_id: String::new(),
            }))
            .unwrap_err();
        assert!(matches!(err, CodecError::LengthExceeded { max: 8, .. }));
    }

    #[test]
    fn test_encode_unregistered_kind() {
        let codec = FrameCodec::new(Arc::new(CommandRegistry::new()));
        let err = codec.encode(&Command::Ping(Ping {})).unwrap_err();
        assert!(matches!(err, CodecError::Unregistered(CommandKind::Ping)));
    }

    #[tokio::test]
    async fn test_read_frame_leaves_trailing_bytes() {
        let codec = codec();
        let mut data = codec.encode(&Command::Ping(Ping {})).unwrap().to_vec();
        data.extend_from_slice(b"raw tunnel bytes");
        let mut reader = &data[..];

        assert_eq!(
            codec.read_frame(&mut reader).await.unwrap(),
            Command::Ping(Ping {})
        );
        assert_eq!(reader, b"raw tunnel bytes");
    }

    #[tokio::test]
    async fn test_read_frame_oversize_consumes_only_prefix() {
        let mut data = header(b'a', 20000);
        data.extend_from_slice(b"TAIL");
        let mut reader = &data[..];

        assert!(matches!(
            codec().read_frame(&mut reader).await.unwrap_err(),
            CodecError::LengthExceeded { length: 20000, .. }
        ));
        assert_eq!(reader, b"TAIL");

        let mut data = header(b'a', -5);
        data.extend_from_slice(b"TAIL");
        let mut reader = &data[..];
        assert!(matches!(
            codec().read_frame(&mut reader).await.unwrap_err(),
            CodecError::NegativeLength(-5)
        ));
        assert_eq!(reader, b"TAIL");
    }

    #[tokio::test]
    async fn test_read_frame_eof_at_boundary() {
        let mut reader: &[u8] = &[];
        assert!(matches!(
            codec().read_frame(&mut reader).await.unwrap_err(),
            CodecError::Closed
        ));
    }

    #[tokio::test]
    async fn test_read_frame_short_payload() {
        let mut data = header(b'5', 20);
        data.extend_from_slice(b"{\"proxy");
        let mut reader = &data[..];
        assert!(matches!(
            codec().read_frame(&mut reader).await.unwrap_err(),
            CodecError::ShortRead {
                expected: 20,
                actual: 7
            }
        ));
    }
}
