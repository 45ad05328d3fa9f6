use serde::Serialize;
use thiserror::Error;
use tonic::{Code, Status};

/// 请求超限排查文档
pub const REQ_LIMIT_EXCEEDED_URL: &str =
    "https://docs.viam.com/dev/tools/common-errors/#req-limit-exceeded";

/// 某个资源上的并发请求数超过上限时返回给调用方的错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error(
    "exceeded request limit {limit} on resource {resource} (your client is responsible for {caller_in_flight}). See {url} for troubleshooting steps",
    url = REQ_LIMIT_EXCEEDED_URL
)]
pub struct RequestLimitExceededError {
    /// 限流 key
    pub resource: String,
    /// 生效的上限
    pub limit: i64,
    /// 该调用方自己在此资源上的在途请求数
    pub caller_in_flight: i64,
}

impl From<RequestLimitExceededError> for Status {
    fn from(err: RequestLimitExceededError) -> Self {
        Status::new(Code::ResourceExhausted, err.to_string())
    }
}

/// 计数器内部不变量被破坏（程序错误）
///
/// 生产环境只记录日志并返回该错误，debug/test 构建下直接 panic。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterError {
    #[error("invariant failed: stats row must exist before finishing a request, key: {0}")]
    MissingStatsRow(String),

    #[error("invariant failed: released an admission slot that was never taken, key: {0}")]
    UnbalancedRelease(String),

    #[error("invariant failed: stream sent a message before attribution, method: {0}")]
    UnattributedStream(String),
}

impl CounterError {
    /// 记录不变量错误；debug 构建下 panic
    pub(crate) fn raise(self) -> Self {
        tracing::error!(error = %self, "request counter invariant violated");
        debug_assert!(false, "{}", self);
        self
    }
}

pub type Result<T, E = CounterError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_error_message() {
        let err = RequestLimitExceededError {
            resource: "arm1.viam.component.arm.v1.ArmService".to_string(),
            limit: 1,
            caller_in_flight: 0,
        };
        assert_eq!(
            err.to_string(),
            format!(
                "exceeded request limit 1 on resource arm1.viam.component.arm.v1.ArmService \
                 (your client is responsible for 0). See {} for troubleshooting steps",
                REQ_LIMIT_EXCEEDED_URL
            )
        );
    }

    #[test]
    fn test_limit_error_status_code() {
        let status: Status = RequestLimitExceededError {
            resource: "viam.robot.v1.RobotService".to_string(),
            limit: 100,
            caller_in_flight: 42,
        }
        .into();
        assert_eq!(status.code(), Code::ResourceExhausted);
        assert!(status.message().contains("exceeded request limit 100"));
        assert!(status.message().contains("responsible for 42"));
    }
}
