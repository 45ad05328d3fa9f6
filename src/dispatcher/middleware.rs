use std::time::Instant;

use async_trait::async_trait;
use tonic::Status;
use tracing::debug;

use super::{BoxMessage, MessageStream, StreamNext, UnaryNext};
use crate::context::CallContext;
use crate::counter::RequestCounter;
use crate::interceptor::{StreamServerInfo, UnaryServerInfo};

/// 一元调用拦截器
#[async_trait]
pub trait UnaryInterceptor: Send + Sync {
    async fn intercept(
        &self,
        ctx: CallContext,
        req: BoxMessage,
        info: &UnaryServerInfo,
        next: UnaryNext<'_>,
    ) -> Result<BoxMessage, Status>;
}

/// 流式调用拦截器
#[async_trait]
pub trait StreamInterceptor: Send + Sync {
    async fn intercept(
        &self,
        ctx: CallContext,
        inbound: MessageStream,
        info: &StreamServerInfo,
        next: StreamNext<'_>,
    ) -> Result<MessageStream, Status>;
}

#[async_trait]
impl UnaryInterceptor for RequestCounter {
    async fn intercept(
        &self,
        ctx: CallContext,
        req: BoxMessage,
        info: &UnaryServerInfo,
        next: UnaryNext<'_>,
    ) -> Result<BoxMessage, Status> {
        self.unary_interceptor(ctx, req, info, |ctx, req| next.run(ctx, req))
            .await
    }
}

#[async_trait]
impl StreamInterceptor for RequestCounter {
    async fn intercept(
        &self,
        ctx: CallContext,
        inbound: MessageStream,
        info: &StreamServerInfo,
        next: StreamNext<'_>,
    ) -> Result<MessageStream, Status> {
        let outbound = self
            .stream_interceptor(ctx, inbound, info, |ctx, inbound| {
                next.run(ctx, Box::pin(inbound))
            })
            .await?;
        Ok(Box::pin(outbound))
    }
}

/// 日志拦截器 - 记录每个一元调用的方法、耗时与状态码
pub struct LoggingInterceptor;

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LoggingInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UnaryInterceptor for LoggingInterceptor {
    async fn intercept(
        &self,
        ctx: CallContext,
        req: BoxMessage,
        info: &UnaryServerInfo,
        next: UnaryNext<'_>,
    ) -> Result<BoxMessage, Status> {
        let start = Instant::now();
        let result = next.run(ctx, req).await;
        let code = match &result {
            Ok(_) => tonic::Code::Ok,
            Err(status) => status.code(),
        };
        debug!(
            method = %info.full_method,
            elapsed_ms = start.elapsed().as_millis() as u64,
            code = ?code,
            "rpc completed"
        );
        result
    }
}
