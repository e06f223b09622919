//! 分类后的故障

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::OperationKind;
use super::classify::{Classification, classify, next_cause};
use crate::transport::TransportError;

/// 故障种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// 凭据/认证失败
    Security,
    /// 已认证但无权限
    Authorization,
    /// 超出配额
    Quota,
    /// 被限流
    Throttle,
    /// 非暂时性的协议/业务错误
    NonTransientProtocol,
    /// 暂时性网络故障
    TransientNetwork,
    /// 暂时性服务端故障
    TransientServer,
    /// 无法识别
    Unknown,
}

impl FaultKind {
    /// 是否可重试（只由种类决定）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FaultKind::Throttle | FaultKind::TransientNetwork | FaultKind::TransientServer
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Security => "security",
            FaultKind::Authorization => "authorization",
            FaultKind::Quota => "quota",
            FaultKind::Throttle => "throttle",
            FaultKind::NonTransientProtocol => "non_transient_protocol",
            FaultKind::TransientNetwork => "transient_network",
            FaultKind::TransientServer => "transient_server",
            FaultKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 故障对外呈现的形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultShape {
    /// 领域错误原样透传
    PassThrough,
    /// 统一的通信故障
    Communication,
    /// 最小包装的未知错误
    Opaque,
}

/// 分类后的故障，原始失败保存在 `cause` 中
#[derive(Debug, Clone)]
pub struct ClassifiedFault {
    kind: FaultKind,
    shape: FaultShape,
    message: String,
    cause: Option<Arc<dyn Error + Send + Sync + 'static>>,
}

impl ClassifiedFault {
    /// 对原始失败分类并包装
    pub fn from_error<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        let Classification { kind, shape } = classify(&err);
        Self {
            kind,
            shape,
            message: err.to_string(),
            cause: Some(Arc::new(err)),
        }
    }

    /// 调用方取消
    pub fn canceled(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            kind: FaultKind::TransientNetwork,
            shape: FaultShape::Communication,
            message: format!("操作已取消: {reason}"),
            cause: Some(Arc::new(TransportError::Canceled(reason))),
        }
    }

    /// 时间预算耗尽，呈现为取消类通信故障
    pub fn timed_out(
        operation: OperationKind,
        budget: Duration,
        last: Option<&ClassifiedFault>,
    ) -> Self {
        let reason = match last {
            Some(last) => format!(
                "{operation} 在 {budget:?} 内未完成，最后一次故障: {last}"
            ),
            None => format!("{operation} 在 {budget:?} 内未完成"),
        };
        Self::canceled(reason)
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn shape(&self) -> FaultShape {
        self.shape
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 是否可重试
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// 是否为取消类故障（调用方取消或时间预算耗尽）
    pub fn is_cancellation(&self) -> bool {
        self.shape == FaultShape::Communication
            && matches!(
                self.find_cause::<TransportError>().map(TransportError::innermost),
                Some(TransportError::Canceled(_))
            )
    }

    /// 在原因链中查找指定类型的错误
    pub fn find_cause<E: Error + 'static>(&self) -> Option<&E> {
        let mut current: Option<&(dyn Error + 'static)> = self.source();
        while let Some(err) = current {
            if let Some(found) = err.downcast_ref::<E>() {
                return Some(found);
            }
            current = next_cause(err);
        }
        None
    }
}

impl fmt::Display for ClassifiedFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl Error for ClassifiedFault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn Error + 'static))
    }
}
