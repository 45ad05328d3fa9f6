//! RPC 分发链
//!
//! 按完整方法路径注册 handler，每个调用依次经过已注册的拦截器后再到达 handler。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::Stream;
use tonic::Status;
use tracing::warn;

use crate::context::CallContext;
use crate::interceptor::{StreamServerInfo, UnaryServerInfo};
use crate::resource::RpcMessage;

pub mod middleware;
pub use middleware::*;

/// 类型擦除后的消息
pub type BoxMessage = Box<dyn RpcMessage>;

/// 类型擦除后的消息流
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<BoxMessage, Status>> + Send>>;

/// 一元 handler
pub type UnaryHandler =
    Arc<dyn Fn(CallContext, BoxMessage) -> BoxFuture<'static, Result<BoxMessage, Status>> + Send + Sync>;

/// 流式 handler：接收入站流，返回出站流
pub type StreamHandler =
    Arc<dyn Fn(CallContext, MessageStream) -> BoxFuture<'static, Result<MessageStream, Status>> + Send + Sync>;

/// 一元调用链中剩余的部分
pub struct UnaryNext<'a> {
    interceptors: &'a [Arc<dyn UnaryInterceptor>],
    handler: &'a UnaryHandler,
    info: &'a UnaryServerInfo,
}

impl<'a> UnaryNext<'a> {
    pub fn run(self, ctx: CallContext, req: BoxMessage) -> BoxFuture<'a, Result<BoxMessage, Status>> {
        match self.interceptors.split_first() {
            Some((first, rest)) => {
                let next = UnaryNext {
                    interceptors: rest,
                    handler: self.handler,
                    info: self.info,
                };
                first.intercept(ctx, req, self.info, next)
            }
            None => (self.handler)(ctx, req),
        }
    }
}

/// 流式调用链中剩余的部分
pub struct StreamNext<'a> {
    interceptors: &'a [Arc<dyn StreamInterceptor>],
    handler: &'a StreamHandler,
    info: &'a StreamServerInfo,
}

impl<'a> StreamNext<'a> {
    pub fn run(self, ctx: CallContext, inbound: MessageStream) -> BoxFuture<'a, Result<MessageStream, Status>> {
        match self.interceptors.split_first() {
            Some((first, rest)) => {
                let next = StreamNext {
                    interceptors: rest,
                    handler: self.handler,
                    info: self.info,
                };
                first.intercept(ctx, inbound, self.info, next)
            }
            None => (self.handler)(ctx, inbound),
        }
    }
}

struct UnaryRoute {
    info: UnaryServerInfo,
    handler: UnaryHandler,
}

struct StreamRoute {
    info: StreamServerInfo,
    handler: StreamHandler,
}

/// 服务路由器
pub struct ServiceRouter {
    unary_routes: HashMap<String, UnaryRoute>,
    stream_routes: HashMap<String, StreamRoute>,
    unary_interceptors: Vec<Arc<dyn UnaryInterceptor>>,
    stream_interceptors: Vec<Arc<dyn StreamInterceptor>>,
}

impl ServiceRouter {
    pub fn builder() -> ServiceRouterBuilder {
        ServiceRouterBuilder::new()
    }

    /// 处理一元调用
    pub async fn call_unary(
        &self,
        ctx: CallContext,
        full_method: &str,
        req: BoxMessage,
    ) -> Result<BoxMessage, Status> {
        let Some(route) = self.unary_routes.get(full_method) else {
            warn!("未找到方法 {} 的处理器", full_method);
            return Err(Status::unimplemented(format!("unknown method {}", full_method)));
        };
        UnaryNext {
            interceptors: &self.unary_interceptors,
            handler: &route.handler,
            info: &route.info,
        }
        .run(ctx, req)
        .await
    }

    /// 处理流式调用
    pub async fn call_stream(
        &self,
        ctx: CallContext,
        full_method: &str,
        inbound: MessageStream,
    ) -> Result<MessageStream, Status> {
        let Some(route) = self.stream_routes.get(full_method) else {
            warn!("未找到方法 {} 的处理器", full_method);
            return Err(Status::unimplemented(format!("unknown method {}", full_method)));
        };
        StreamNext {
            interceptors: &self.stream_interceptors,
            handler: &route.handler,
            info: &route.info,
        }
        .run(ctx, inbound)
        .await
    }

    /// 已注册的方法
    pub fn list_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .unary_routes
            .keys()
            .chain(self.stream_routes.keys())
            .cloned()
            .collect();
        methods.sort();
        methods
    }
}

/// 服务路由器构建器
pub struct ServiceRouterBuilder {
    unary_routes: HashMap<String, UnaryRoute>,
    stream_routes: HashMap<String, StreamRoute>,
    unary_interceptors: Vec<Arc<dyn UnaryInterceptor>>,
    stream_interceptors: Vec<Arc<dyn StreamInterceptor>>,
}

impl ServiceRouterBuilder {
    pub fn new() -> Self {
        Self {
            unary_routes: HashMap::new(),
            stream_routes: HashMap::new(),
            unary_interceptors: Vec::new(),
            stream_interceptors: Vec::new(),
        }
    }

    /// 注册一元 handler
    pub fn with_unary<F, Fut>(mut self, full_method: &str, handler: F) -> Self
    where
        F: Fn(CallContext, BoxMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BoxMessage, Status>> + Send + 'static,
    {
        let handler: UnaryHandler = Arc::new(move |ctx, req| Box::pin(handler(ctx, req)));
        self.unary_routes.insert(
            full_method.to_string(),
            UnaryRoute {
                info: UnaryServerInfo::new(full_method),
                handler,
            },
        );
        self
    }

    /// 注册流式 handler
    pub fn with_stream<F, Fut>(mut self, full_method: &str, handler: F) -> Self
    where
        F: Fn(CallContext, MessageStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MessageStream, Status>> + Send + 'static,
    {
        let handler: StreamHandler = Arc::new(move |ctx, inbound| Box::pin(handler(ctx, inbound)));
        self.stream_routes.insert(
            full_method.to_string(),
            StreamRoute {
                info: StreamServerInfo::new(full_method),
                handler,
            },
        );
        self
    }

    /// 追加一元拦截器，按注册顺序由外到内执行
    pub fn with_unary_interceptor(mut self, interceptor: Arc<dyn UnaryInterceptor>) -> Self {
        self.unary_interceptors.push(interceptor);
        self
    }

    /// 追加流式拦截器
    pub fn with_stream_interceptor(mut self, interceptor: Arc<dyn StreamInterceptor>) -> Self {
        self.stream_interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> ServiceRouter {
        ServiceRouter {
            unary_routes: self.unary_routes,
            stream_routes: self.stream_routes,
            unary_interceptors: self.unary_interceptors,
            stream_interceptors: self.stream_interceptors,
        }
    }
}

impl Default for ServiceRouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
