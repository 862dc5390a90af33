/// 命令路由
///
/// 按命令类型（即线路标签）查找处理器，并按“全局中间件在外、类型中间件在内”的顺序包装。
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

use super::context::Context;
use crate::protocol::CommandKind;

/// 命令处理器；通过 [`Context::respond`] 设置回复
pub type Handler = Arc<dyn Fn(&mut Context) + Send + Sync>;

/// 中间件：包装一个处理器，返回新的处理器
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

struct Route {
    handler: Handler,
    middlewares: Vec<Middleware>,
}

/// 命令路由表
#[derive(Default)]
pub struct Router {
    routes: HashMap<CommandKind, Route>,
    global: Vec<Middleware>,
    not_found: Option<Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器；同一类型重复注册会替换之前的处理器
    pub fn register<F>(&mut self, kind: CommandKind, handler: F) -> &mut Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.register_with(kind, handler, Vec::new())
    }

    /// 注册处理器并附带只作用于该类型的中间件
    pub fn register_with<F>(
        &mut self,
        kind: CommandKind,
        handler: F,
        middlewares: Vec<Middleware>,
    ) -> &mut Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.routes.insert(
            kind,
            Route {
                handler: Arc::new(handler),
                middlewares,
            },
        );
        self
    }

    /// 追加全局中间件
    pub fn use_middleware(&mut self, middleware: Middleware) -> &mut Self {
        self.global.push(middleware);
        self
    }

    /// 未注册类型的兜底处理器
    pub fn set_not_found<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.not_found = Some(Arc::new(handler));
        self
    }

    /// 分发一条请求
    pub fn dispatch(&self, ctx: &mut Context) {
        let Some(kind) = ctx.request().map(|r| r.kind()) else {
            return;
        };

        let none: &[Middleware] = &[];
        let (handler, route_middlewares) = match self.routes.get(&kind) {
            Some(route) => (route.handler.clone(), route.middlewares.as_slice()),
            None => match &self.not_found {
                Some(h) => (h.clone(), none),
                None => {
                    debug!("No handler for {}, ignoring", kind);
                    return;
                }
            },
        };

        // m1(m2(m3(h)))：先套类型中间件，再套全局中间件
        let composed = self
            .global
            .iter()
            .chain(route_middlewares.iter())
            .rev()
            .fold(handler, |next, mw| mw(next));

        composed(ctx);
    }
}

/// 捕获处理器 panic 并记录会话标识，使入站循环继续处理后续帧
pub fn recover() -> Middleware {
    Arc::new(|next: Handler| -> Handler {
        Arc::new(move |ctx: &mut Context| {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| next(ctx))) {
                let request = ctx
                    .request()
                    .map(|r| r.kind().as_str())
                    .unwrap_or("unknown");
                error!(
                    "[{}] PANIC while handling {}: {}",
                    ctx.session_id(),
                    request,
                    panic_message(panic.as_ref())
                );
            }
        })
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Ping, Pong, ReqWorkCtl, Response};
    use parking_lot::Mutex;

    fn ctx_with(cmd: Command) -> Context {
        let mut ctx = Context::default();
        ctx.set_request(cmd);
        ctx
    }

    fn tracing_middleware(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> Middleware {
        Arc::new(move |next: Handler| -> Handler {
            let log = log.clone();
            Arc::new(move |ctx: &mut Context| {
                log.lock().push(format!("{}>", name));
                next(ctx);
                log.lock().push(format!("<{}", name));
            })
        })
    }

    #[test]
    fn test_dispatch_by_kind() {
        let mut router = Router::new();
        router.register(CommandKind::Ping, |ctx| {
            ctx.respond(Command::Pong(Pong {}));
        });

        let mut ctx = ctx_with(Command::Ping(Ping {}));
        router.dispatch(&mut ctx);
        assert_eq!(ctx.response(), Some(&Command::Pong(Pong {})));
    }

    #[test]
    fn test_middleware_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut router = Router::new();
        router.use_middleware(tracing_middleware(log.clone(), "g1"));
        router.use_middleware(tracing_middleware(log.clone(), "g2"));
        {
            let log = log.clone();
            router.register_with(
                CommandKind::Ping,
                move |_ctx| log.lock().push("handler".to_string()),
                vec![tracing_middleware(Arc::new(Mutex::new(Vec::new())), "unused")],
            );
        }
        {
            let inner = log.clone();
            router.register_with(
                CommandKind::Ping,
                move |_ctx| inner.lock().push("handler".to_string()),
                vec![tracing_middleware(log.clone(), "r1")],
            );
        }

        router.dispatch(&mut ctx_with(Command::Ping(Ping {})));
        assert_eq!(
            *log.lock(),
            vec!["g1>", "g2>", "r1>", "handler", "<r1", "<g2", "<g1"]
        );
    }

    #[test]
    fn test_not_found_fallback() {
        let mut router = Router::new();
        let mut ctx = ctx_with(Command::Ping(Ping {}));
        router.dispatch(&mut ctx);
        assert!(ctx.response().is_none());

        router.set_not_found(|ctx| {
            ctx.respond(Command::Response(Response::error(1000, "unknown")));
        });
        router.dispatch(&mut ctx);
        assert!(matches!(ctx.response(), Some(Command::Response(r)) if r.code == 1000));
    }

    #[test]
    fn test_recover_keeps_context_usable() {
        let mut router = Router::new();
        router.use_middleware(recover());
        router.register(CommandKind::ReqWorkCtl, |_ctx| panic!("boom"));
        router.register(CommandKind::Ping, |ctx| {
            ctx.respond(Command::Pong(Pong {}));
        });

        let mut ctx = ctx_with(Command::ReqWorkCtl(ReqWorkCtl {
            proxy_name: "web".to_string(),
        }));
        router.dispatch(&mut ctx);
        assert!(ctx.response().is_none());

        // 后续请求照常处理
        let mut ctx = ctx_with(Command::Ping(Ping {}));
        router.dispatch(&mut ctx);
        assert_eq!(ctx.response(), Some(&Command::Pong(Pong {})));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
