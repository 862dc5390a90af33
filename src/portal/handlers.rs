/// 门户控制会话的命令处理器
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::master::{Master, MasterTable};
use super::proxy::ProxyOptions;
use crate::error::{TunnelError, CODE_UNKNOWN_COMMAND};
use crate::protocol::{Command, CommandKind, CloseProxyResp, NewProxyResp, Pong, Response};
use crate::session::{recover, Context, Router};

/// 构造门户的控制路由
pub fn build_router(masters: Arc<MasterTable>, options: ProxyOptions) -> Router {
    let mut router = Router::new();
    router.use_middleware(recover());

    {
        let masters = masters.clone();
        router.register(CommandKind::Ping, move |ctx| {
            if let Some(master) = master_of(&masters, ctx) {
                master.touch();
                ctx.respond(Command::Pong(Pong {}));
            }
        });
    }

    {
        let masters = masters.clone();
        router.register(CommandKind::NewProxy, move |ctx| {
            let Some(Command::NewProxy(req)) = ctx.request().cloned() else {
                return;
            };
            let Some(master) = master_of(&masters, ctx) else {
                return;
            };
            if req.trace_id != master.trace_id() {
                debug!(
                    "[{}] NewProxy carries trace id '{}', using the session's",
                    master.trace_id(),
                    req.trace_id
                );
            }

            let error = match master.new_proxy(&masters, &req.proxy_name, req.remote_port, &options)
            {
                Ok(_) => None,
                Err(e) => {
                    warn!(
                        "[{}] Failed to create proxy '{}': {}",
                        master.trace_id(),
                        req.proxy_name,
                        e
                    );
                    Some(e.to_string())
                }
            };
            ctx.respond(Command::NewProxyResp(NewProxyResp {
                proxy_name: req.proxy_name,
                error,
            }));
        });
    }

    {
        let masters = masters.clone();
        router.register(CommandKind::CloseProxy, move |ctx| {
            let Some(Command::CloseProxy(req)) = ctx.request().cloned() else {
                return;
            };
            let Some(master) = master_of(&masters, ctx) else {
                return;
            };
            match master.close_proxy(&req.proxy_name) {
                Ok(()) => {
                    info!("[{}] Proxy '{}' closed by bridge", master.trace_id(), req.proxy_name);
                    ctx.respond(Command::CloseProxyResp(CloseProxyResp {
                        proxy_name: req.proxy_name,
                    }));
                }
                Err(e) => {
                    ctx.respond(Command::Response(Response::from_error(&e)));
                }
            }
        });
    }

    router.set_not_found(|ctx| {
        let kind = ctx.request().map(|r| r.kind().as_str()).unwrap_or("unknown");
        warn!("[{}] Unexpected command {} on control connection", ctx.session_id(), kind);
        ctx.respond(Command::Response(Response::error(
            CODE_UNKNOWN_COMMAND,
            format!("unexpected command {}", kind),
        )));
    });

    router
}

/// 按会话标识查找 Master；找不到时回复错误并关闭这条控制连接
fn master_of(masters: &MasterTable, ctx: &mut Context) -> Option<Arc<Master>> {
    let trace_id = ctx.session_id();
    if let Some(master) = masters.get(&trace_id) {
        return Some(master);
    }

    warn!("[{}] Control command for a master that no longer exists", trace_id);
    let reply = Command::Response(Response::from_error(&TunnelError::MasterNotFound(trace_id)));
    if let Some(session) = ctx.session().cloned() {
        tokio::spawn(async move {
            let _ = session.send_command_sync(&reply).await;
            session.close();
        });
    }
    None
}
