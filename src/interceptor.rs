//! 一元与流式拦截器
//!
//! 一元调用：分类方法 → 资源归属 → 准入 → 调用 handler → 更新统计。
//! 流式调用：资源名在消息体里，只能等第一条客户端消息到达后再归属，
//! 之后每条发出的消息都把字节数记到同一个统计 key 下。
//!
//! 流式调用不受在途上限约束：一个长连接的流在整个生命周期内都“在途”，
//! 按调用计数的上限不能正确描述它对资源的占用。

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::Stream;
use pin_project::pin_project;
use tonic::Status;

use crate::context::CallContext;
use crate::counter::RequestCounter;
use crate::error::CounterError;
use crate::method::ApiMethod;
use crate::resource::{Attribution, RpcMessage};

/// 一元调用的方法信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnaryServerInfo {
    pub full_method: String,
}

/// 流式调用的方法信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamServerInfo {
    pub full_method: String,
}

impl UnaryServerInfo {
    pub fn new(full_method: impl Into<String>) -> Self {
        Self {
            full_method: full_method.into(),
        }
    }
}

impl StreamServerInfo {
    pub fn new(full_method: impl Into<String>) -> Self {
        Self {
            full_method: full_method.into(),
        }
    }
}

impl RequestCounter {
    /// 一元拦截器
    ///
    /// handler 的结果与错误原样返回；拦截器只观察和放行，不改变业务语义。
    pub async fn unary_interceptor<Req, Resp, H, Fut>(
        &self,
        ctx: CallContext,
        req: Req,
        info: &UnaryServerInfo,
        handler: H,
    ) -> Result<Resp, Status>
    where
        Req: RpcMessage,
        Resp: RpcMessage,
        H: FnOnce(CallContext, Req) -> Fut,
        Fut: Future<Output = Result<Resp, Status>>,
    {
        let method = ApiMethod::parse(&info.full_method);
        self.observe_peer(&ctx);

        let attribution = Attribution::resolve(Some(&req), &method);

        // 在本函数返回（或 future 被取消）时归还名额
        let _admission = if attribution.limit_key.is_empty() {
            None
        } else {
            let guard = self.admit(&method.full, &attribution.limit_key, ctx.peer.as_ref())?;
            // 占用名额期间不会被清理；补回清理竞争中丢掉的元数据
            self.observe_peer(&ctx);
            Some(guard)
        };

        // 记录到遥测中：`motor-name.MotorService/IsMoving: <count>`
        if attribution.stats_key.is_empty() {
            return handler(ctx, req).await;
        }

        let stats = self.stats_ledger();
        stats.record_start(&attribution.stats_key);
        let finish = FinishOnDrop {
            counter: self,
            stats_key: &attribution.stats_key,
            start: Instant::now(),
            data_sent: 0,
            was_error: true,
        };

        let result = handler(ctx, req).await;
        finish.complete(&result);
        result
    }

    /// 流式拦截器，覆盖客户端流、服务端流、双向流
    ///
    /// 入站流与 handler 产生的出站流都被包装；非平台 API 的包装不做任何统计。
    pub async fn stream_interceptor<In, Out, S, O, H, Fut>(
        &self,
        ctx: CallContext,
        inbound: S,
        info: &StreamServerInfo,
        handler: H,
    ) -> Result<CountedOutbound<O>, Status>
    where
        S: Stream<Item = Result<In, Status>>,
        In: RpcMessage,
        O: Stream<Item = Result<Out, Status>>,
        Out: RpcMessage,
        H: FnOnce(CallContext, CountedInbound<S>) -> Fut,
        Fut: Future<Output = Result<O, Status>>,
    {
        let method = ApiMethod::parse(&info.full_method);
        self.observe_peer(&ctx);

        let accounting = method.is_platform_api().then(|| {
            Arc::new(StreamAccounting {
                counter: self.clone(),
                method,
                stats_key: OnceLock::new(),
            })
        });

        let inbound = CountedInbound {
            inner: inbound,
            accounting: accounting.clone(),
        };
        let outbound = handler(ctx, inbound).await?;
        Ok(CountedOutbound {
            inner: outbound,
            accounting,
        })
    }
}

/// 一元调用结束时写入统计；handler 被取消或 panic 时按错误记录
struct FinishOnDrop<'a> {
    counter: &'a RequestCounter,
    stats_key: &'a str,
    start: Instant,
    data_sent: usize,
    was_error: bool,
}

impl FinishOnDrop<'_> {
    fn complete<Resp: RpcMessage>(mut self, result: &Result<Resp, Status>) {
        match result {
            Ok(resp) => {
                self.data_sent = resp.encoded_size().unwrap_or(0);
                self.was_error = false;
            }
            Err(_) => self.was_error = true,
        }
    }
}

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        // 错误已在内部记录
        let _ = self.counter.stats_ledger().record_finish(
            self.stats_key,
            self.start.elapsed(),
            self.data_sent,
            self.was_error,
        );
    }
}

/// 一个流共享的统计状态
struct StreamAccounting {
    counter: RequestCounter,
    method: ApiMethod,
    /// 第一条客户端消息到达时设置，之后不变
    stats_key: OnceLock<String>,
}

impl StreamAccounting {
    fn on_recv<In: RpcMessage>(&self, msg: &In) {
        if self.stats_key.get().is_some() {
            return;
        }
        let mut first = false;
        let key = self.stats_key.get_or_init(|| {
            first = true;
            Attribution::resolve(Some(msg), &self.method).stats_key
        });
        if first {
            self.counter.stats_ledger().record_start(key);
        }
    }

    fn on_send<Out: RpcMessage>(&self, msg: &Out) {
        let Some(key) = self.stats_key.get() else {
            let _ = CounterError::UnattributedStream(self.method.full.clone()).raise();
            return;
        };
        if let Some(size) = msg.encoded_size() {
            let _ = self.counter.stats_ledger().record_finish(
                key,
                std::time::Duration::ZERO,
                size,
                false,
            );
        }
    }
}

/// 包装后的入站（客户端 → 服务端）消息流
#[pin_project]
pub struct CountedInbound<S> {
    #[pin]
    inner: S,
    accounting: Option<Arc<StreamAccounting>>,
}

impl<S, In> Stream for CountedInbound<S>
where
    S: Stream<Item = Result<In, Status>>,
    In: RpcMessage,
{
    type Item = Result<In, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_next(cx);
        if let (Poll::Ready(Some(Ok(msg))), Some(accounting)) = (&polled, this.accounting.as_ref()) {
            accounting.on_recv(msg);
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// 包装后的出站（服务端 → 客户端）消息流
#[pin_project]
pub struct CountedOutbound<O> {
    #[pin]
    inner: O,
    accounting: Option<Arc<StreamAccounting>>,
}

impl<O, Out> Stream for CountedOutbound<O>
where
    O: Stream<Item = Result<Out, Status>>,
    Out: RpcMessage,
{
    type Item = Result<Out, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_next(cx);
        if let (Poll::Ready(Some(Ok(msg))), Some(accounting)) = (&polled, this.accounting.as_ref()) {
            accounting.on_send(msg);
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
