//! 按资源统计并限制在途 RPC 请求
//!
//! [`RequestCounter`] 以拦截器的形式挂在 RPC 服务前面：对平台 API 的每个调用，
//! 归属到目标资源，超出每资源在途上限时以 `RESOURCE_EXHAUSTED` 拒绝，
//! 并维护可导出的调用统计与每个调用方的诊断账本。

pub mod admission;
pub mod cli;
pub mod config;
pub mod context;
pub mod counter;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod infra;
pub mod interceptor;
pub mod ledger;
pub mod logging;
pub mod method;
pub mod peer;
pub mod resource;
pub mod server;
pub mod stats;

pub use config::ServerConfig;
pub use context::CallContext;
pub use counter::{AdmissionGuard, RequestCounter, RequestCounterOptions};
pub use dispatcher::{
    middleware::{LoggingInterceptor, StreamInterceptor, UnaryInterceptor},
    BoxMessage, MessageStream, ServiceRouter, ServiceRouterBuilder,
};
pub use error::{CounterError, RequestLimitExceededError, Result};
pub use interceptor::{CountedInbound, CountedOutbound, StreamServerInfo, UnaryServerInfo};
pub use method::ApiMethod;
pub use peer::{ClientInformation, ConnectionStats, PeerConnection, PeerHandle, PeerId};
pub use resource::{Attribution, RawMessage, RpcMessage};
pub use server::CounterServer;
