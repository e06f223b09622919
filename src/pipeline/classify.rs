//! 故障分类
//!
//! 纯函数：输入一条错误链，输出故障种类与呈现形态。规则按优先级依次匹配：
//!
//! 1. 链上任意位置出现认证失败 -> `Security`
//! 2. 最外层是已带含义的领域错误 -> 对应种类，原样透传
//! 3. 最外层是暂时性网络形态 -> `TransientNetwork`，统一包装为通信故障
//! 4. 最外层是服务器繁忙 / 限流 -> `TransientServer` / `Throttle`，原样透传
//! 5. 其余 -> `Unknown`
//!
//! 除第 1 条外，其余规则只看最外层错误。

use std::error::Error;
use std::io;

use super::fault::{ClassifiedFault, FaultKind, FaultShape};
use crate::transport::{HubError, TransportError};

/// 错误链遍历深度上限，防止自引用的错误链
const MAX_CHAIN_DEPTH: usize = 32;

/// 分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: FaultKind,
    pub shape: FaultShape,
}

impl Classification {
    const fn new(kind: FaultKind, shape: FaultShape) -> Self {
        Self { kind, shape }
    }
}

/// 对一条错误链分类
pub fn classify(err: &(dyn Error + 'static)) -> Classification {
    if chain_has_authentication_failure(err) {
        return Classification::new(FaultKind::Security, FaultShape::PassThrough);
    }

    let outermost = match err.downcast_ref::<TransportError>() {
        Some(transport) => transport.innermost() as &(dyn Error + 'static),
        None => err,
    };

    if let Some(fault) = outermost.downcast_ref::<ClassifiedFault>() {
        return Classification::new(fault.kind(), fault.shape());
    }

    if let Some(hub) = as_hub_error(outermost) {
        return classify_hub_error(hub);
    }

    if is_transient_network(outermost) {
        return Classification::new(FaultKind::TransientNetwork, FaultShape::Communication);
    }

    Classification::new(FaultKind::Unknown, FaultShape::Opaque)
}

/// 原因链的下一环
///
/// `io::Error::source()` 会跳过自定义的内部错误，透明包装的变体也不会出现在
/// `source()` 链上，这里把它们都显式展开。
pub(crate) fn next_cause<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a (dyn Error + 'static)> {
    if let Some(transport) = err.downcast_ref::<TransportError>() {
        match transport {
            TransportError::Hub(hub) => return Some(hub),
            TransportError::Shared(inner) => return Some(inner.as_ref()),
            TransportError::Session { inner, .. } => return Some(inner.as_ref()),
            _ => {}
        }
    }
    if let Some(io) = err.downcast_ref::<io::Error>() {
        return io.get_ref().map(|inner| inner as &(dyn Error + 'static));
    }
    err.source()
}

fn chain_has_authentication_failure(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    let mut depth = 0;
    while let Some(e) = current {
        if depth >= MAX_CHAIN_DEPTH {
            break;
        }
        if matches!(
            e.downcast_ref::<TransportError>(),
            Some(TransportError::Authentication(_))
        ) {
            return true;
        }
        if let Some(fault) = e.downcast_ref::<ClassifiedFault>() {
            if fault.kind() == FaultKind::Security {
                return true;
            }
        }
        current = next_cause(e);
        depth += 1;
    }
    false
}

fn as_hub_error<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a HubError> {
    match err.downcast_ref::<TransportError>() {
        Some(TransportError::Hub(hub)) => Some(hub),
        Some(_) => None,
        None => err.downcast_ref::<HubError>(),
    }
}

fn classify_hub_error(hub: &HubError) -> Classification {
    let kind = match hub {
        HubError::MessageTooLarge(_)
        | HubError::MessageLockLost(_)
        | HubError::HubNotFound(_)
        | HubError::DeviceNotFound(_)
        | HubError::Disposed(_) => FaultKind::NonTransientProtocol,
        HubError::QuotaExceeded(_) => FaultKind::Quota,
        HubError::Unauthorized(_) => FaultKind::Authorization,
        HubError::Service { transient: false, .. } => FaultKind::NonTransientProtocol,
        HubError::Service { transient: true, .. } | HubError::ServerBusy(_) => {
            FaultKind::TransientServer
        }
        HubError::Throttled(_) => FaultKind::Throttle,
    };
    Classification::new(kind, FaultShape::PassThrough)
}

fn is_transient_network(err: &(dyn Error + 'static)) -> bool {
    if let Some(transport) = err.downcast_ref::<TransportError>() {
        return matches!(
            transport,
            TransportError::Io(_)
                | TransportError::Timeout(_)
                | TransportError::Canceled(_)
                | TransportError::Socket(_)
                | TransportError::Http(_)
                | TransportError::WebSocket(_)
                | TransportError::Codec(_)
        );
    }
    err.is::<io::Error>() || err.is::<tokio::time::error::Elapsed>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn kind_of(err: &(dyn Error + 'static)) -> FaultKind {
        classify(err).kind
    }

    #[test]
    fn test_domain_errors_pass_through() {
        let cases = [
            (HubError::MessageTooLarge("x".into()), FaultKind::NonTransientProtocol),
            (HubError::MessageLockLost("x".into()), FaultKind::NonTransientProtocol),
            (HubError::HubNotFound("x".into()), FaultKind::NonTransientProtocol),
            (HubError::DeviceNotFound("x".into()), FaultKind::NonTransientProtocol),
            (HubError::Disposed("x".into()), FaultKind::NonTransientProtocol),
            (HubError::QuotaExceeded("x".into()), FaultKind::Quota),
            (HubError::Unauthorized("x".into()), FaultKind::Authorization),
            (
                HubError::Service {
                    message: "x".into(),
                    transient: false,
                },
                FaultKind::NonTransientProtocol,
            ),
        ];

        for (hub, expected) in cases {
            let err = TransportError::Hub(hub);
            let classification = classify(&err);
            assert_eq!(classification.kind, expected, "{err}");
            assert_eq!(classification.shape, FaultShape::PassThrough);
        }
    }

    #[test]
    fn test_bare_hub_error_is_recognised() {
        let err = HubError::QuotaExceeded("x".into());
        assert_eq!(kind_of(&err), FaultKind::Quota);
    }

    #[test]
    fn test_transient_network_shapes() {
        let cases = [
            TransportError::connection_closed("boom"),
            TransportError::Timeout("x".into()),
            TransportError::Canceled("x".into()),
            TransportError::Socket("x".into()),
            TransportError::Http("x".into()),
            TransportError::WebSocket("x".into()),
            TransportError::Codec("x".into()),
        ];

        for err in cases {
            let classification = classify(&err);
            assert_eq!(classification.kind, FaultKind::TransientNetwork, "{err}");
            assert_eq!(classification.shape, FaultShape::Communication);
        }

        let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(kind_of(&io), FaultKind::TransientNetwork);
    }

    #[tokio::test]
    async fn test_elapsed_is_transient_network() {
        let elapsed = tokio::time::timeout(
            Duration::from_millis(1),
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();
        assert_eq!(kind_of(&elapsed), FaultKind::TransientNetwork);
    }

    #[test]
    fn test_busy_and_throttle() {
        let busy = TransportError::Hub(HubError::ServerBusy("x".into()));
        let throttled = TransportError::Hub(HubError::Throttled("x".into()));
        let internal = TransportError::Hub(HubError::Service {
            message: "x".into(),
            transient: true,
        });

        assert_eq!(kind_of(&busy), FaultKind::TransientServer);
        assert_eq!(kind_of(&throttled), FaultKind::Throttle);
        assert_eq!(kind_of(&internal), FaultKind::TransientServer);
        assert_eq!(classify(&throttled).shape, FaultShape::PassThrough);
    }

    #[test]
    fn test_unknown_is_opaque() {
        let err = TransportError::other("something odd");
        let classification = classify(&err);
        assert_eq!(classification.kind, FaultKind::Unknown);
        assert_eq!(classification.shape, FaultShape::Opaque);
        assert!(!classification.kind.is_retryable());
    }

    #[test]
    fn test_authentication_two_levels_deep_is_security() {
        let deep = TransportError::wrap(
            "link attach failed",
            TransportError::wrap(
                "token refresh failed",
                TransportError::Authentication("signature mismatch".into()),
            ),
        );
        assert_eq!(kind_of(&deep), FaultKind::Security);
    }

    #[test]
    fn test_authentication_inside_io_error_is_security() {
        let io = io::Error::new(
            io::ErrorKind::Other,
            TransportError::Authentication("expired".into()),
        );
        let err = TransportError::Io(io);
        assert_eq!(kind_of(&err), FaultKind::Security);
    }

    #[test]
    fn test_shared_is_unwrapped() {
        let shared = TransportError::Shared(Arc::new(TransportError::Shared(Arc::new(
            TransportError::Hub(HubError::Throttled("x".into())),
        ))));
        assert_eq!(kind_of(&shared), FaultKind::Throttle);

        let shared_auth =
            TransportError::Shared(Arc::new(TransportError::Authentication("x".into())));
        assert_eq!(kind_of(&shared_auth), FaultKind::Security);
    }

    #[test]
    fn test_session_annotation_is_unwrapped() {
        let throttled =
            TransportError::Hub(HubError::Throttled("x".into())).on_session(0, 2);
        assert_eq!(kind_of(&throttled), FaultKind::Throttle);

        let auth = TransportError::Authentication("x".into()).on_session(0, 2);
        assert_eq!(kind_of(&auth), FaultKind::Security);

        let closed = TransportError::connection_closed("x").on_session(1, 1);
        assert_eq!(kind_of(&closed), FaultKind::TransientNetwork);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let fault = ClassifiedFault::from_error(TransportError::Socket("x".into()));
        assert_eq!(classify(&fault), classify(&TransportError::Socket("y".into())));

        let wrapped = ClassifiedFault::from_error(fault.clone());
        assert_eq!(wrapped.kind(), fault.kind());
        assert_eq!(wrapped.shape(), fault.shape());
    }

    #[test]
    fn test_classification_is_deterministic() {
        let err = TransportError::Hub(HubError::MessageLockLost("x".into()));
        let first = classify(&err);
        for _ in 0..10 {
            assert_eq!(classify(&err), first);
        }
    }
}
