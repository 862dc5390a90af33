/// 静态文件服务插件
///
/// 把工作连接当作一条 HTTP/1.1 连接处理：去掉请求路径中的 `prefix` 后，
/// 在根目录下查找文件。目录请求返回其中的 `index.html`。
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

use super::WorkerHandler;
use crate::error::{Result, TunnelError};

/// 静态文件服务
pub struct FileServer {
    root: Arc<PathBuf>,
    prefix: Arc<str>,
}

impl FileServer {
    /// 根目录必须存在
    pub fn open(root: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(TunnelError::config_error(format!(
                "file server root {:?} is not a directory",
                root
            )));
        }
        Ok(Self {
            root: Arc::new(root),
            prefix: normalize_prefix(prefix).into(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 规范化后的前缀，总是以 `/` 开头和结尾
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl WorkerHandler for FileServer {
    async fn handle(&self, worker: TcpStream) -> Result<()> {
        let root = self.root.clone();
        let prefix = self.prefix.clone();
        let service = service_fn(move |req| serve(root.clone(), prefix.clone(), req));

        http1::Builder::new()
            .serve_connection(TokioIo::new(worker), service)
            .await
            .map_err(|e| TunnelError::Io(io::Error::other(e)))
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// 把请求路径映射到根目录下的文件；不在前缀下或试图越出根目录时返回 None
fn resolve(root: &Path, prefix: &str, uri_path: &str) -> Option<PathBuf> {
    let rest = if uri_path == prefix.trim_end_matches('/') {
        ""
    } else {
        uri_path.strip_prefix(prefix)?
    };

    let mut path = root.to_path_buf();
    for component in Path::new(rest).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") | Some("log") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let reason = code.canonical_reason().unwrap_or("");
    let mut resp = Response::new(Full::new(Bytes::from(reason)));
    *resp.status_mut() = code;
    resp
}

async fn serve(
    root: Arc<PathBuf>,
    prefix: Arc<str>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return Ok(status(StatusCode::METHOD_NOT_ALLOWED));
    }

    let Some(mut path) = resolve(&root, &prefix, req.uri().path()) else {
        debug!("File server refused {}", req.uri().path());
        return Ok(status(StatusCode::NOT_FOUND));
    };
    if tokio::fs::metadata(&path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        path.push("index.html");
    }

    match tokio::fs::read(&path).await {
        Ok(body) => {
            debug!("File server {} {:?}", req.method(), path);
            let mut resp = Response::new(Full::new(Bytes::from(body)));
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type(&path)));
            Ok(resp)
        }
        Err(e) => {
            debug!("File server cannot read {:?}: {}", path, e);
            Ok(status(StatusCode::NOT_FOUND))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(""), "/");
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix("static"), "/static/");
        assert_eq!(normalize_prefix("/static/"), "/static/");
    }

    #[test]
    fn test_resolve_under_prefix() {
        let root = Path::new("/srv/www");
        assert_eq!(
            resolve(root, "/static/", "/static/css/site.css"),
            Some(PathBuf::from("/srv/www/css/site.css"))
        );
        assert_eq!(
            resolve(root, "/static/", "/static"),
            Some(PathBuf::from("/srv/www"))
        );
        assert_eq!(
            resolve(root, "/", "/index.html"),
            Some(PathBuf::from("/srv/www/index.html"))
        );
        assert_eq!(resolve(root, "/static/", "/other/a.txt"), None);
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve(root, "/", "/../etc/passwd"), None);
        assert_eq!(resolve(root, "/", "/a/../../b"), None);
        assert_eq!(resolve(root, "/", "//etc/passwd"), None);
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("a.HTML")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("a.bin")), "application/octet-stream");
    }

    #[test]
    fn test_open_requires_directory() {
        let missing = std::env::temp_dir().join(format!("breaker-missing-{}", uuid::Uuid::new_v4()));
        let err = FileServer::open(&missing, "/").err().unwrap();
        assert!(matches!(err, TunnelError::ConfigError(_)));
    }
}
