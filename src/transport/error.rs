//! 传输层原始错误
//!
//! 这里的错误是分类之前的“原始形态”：I/O、超时、套接字、编解码等底层失败，
//! 以及服务端已经给出明确含义的领域错误（`HubError`）。分类由
//! `pipeline::classify` 完成，传输层本身不判断是否可重试。

use std::sync::Arc;

/// 任意可跨线程传递的错误
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 服务端返回的领域错误（已带有明确含义）
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("消息过大: {0}")]
    MessageTooLarge(String),

    #[error("消息锁已丢失: {0}")]
    MessageLockLost(String),

    #[error("IoT Hub 未找到: {0}")]
    HubNotFound(String),

    #[error("设备未找到: {0}")]
    DeviceNotFound(String),

    #[error("超出配额: {0}")]
    QuotaExceeded(String),

    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("服务器繁忙: {0}")]
    ServerBusy(String),

    #[error("请求被限流: {0}")]
    Throttled(String),

    #[error("对象已释放: {0}")]
    Disposed(String),

    #[error("服务端错误: {message}")]
    Service { message: String, transient: bool },
}

/// 传输层原始错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("操作已取消: {0}")]
    Canceled(String),

    #[error("套接字错误: {0}")]
    Socket(String),

    #[error("HTTP 传输错误: {0}")]
    Http(String),

    #[error("WebSocket 错误: {0}")]
    WebSocket(String),

    #[error("编解码错误: {0}")]
    Codec(String),

    #[error("认证失败: {0}")]
    Authentication(String),

    #[error(transparent)]
    Hub(#[from] HubError),

    /// 多个等待者共享的同一个失败（例如一次会话重建的结果）
    #[error(transparent)]
    Shared(Arc<TransportError>),

    /// 在指定槽位的某一代会话上发生的失败
    #[error("{inner}")]
    Session {
        slot: usize,
        generation: u64,
        #[source]
        inner: Box<TransportError>,
    },

    #[error("{message}")]
    Other {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl TransportError {
    /// 无内部原因的通用错误
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            source: None,
        }
    }

    /// 包装另一个错误，保留原因链
    pub fn wrap(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Other {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 连接被对端关闭
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            reason.into(),
        ))
    }

    /// 标注失败发生在哪个槽位的哪一代会话上
    pub fn on_session(self, slot: usize, generation: u64) -> Self {
        Self::Session {
            slot,
            generation,
            inner: Box::new(self),
        }
    }

    /// 失败所在的槽位与会话代数
    pub fn session_generation(&self) -> Option<(usize, u64)> {
        match self {
            TransportError::Session {
                slot, generation, ..
            } => Some((*slot, *generation)),
            TransportError::Shared(inner) => inner.session_generation(),
            _ => None,
        }
    }

    /// 去掉 `Shared` 与会话标注，得到真正的失败
    pub fn innermost(&self) -> &TransportError {
        let mut current = self;
        loop {
            match current {
                TransportError::Shared(inner) => current = inner.as_ref(),
                TransportError::Session { inner, .. } => current = inner.as_ref(),
                _ => return current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_wrap_keeps_source_chain() {
        let err = TransportError::wrap(
            "top level",
            TransportError::Authentication("bad token".into()),
        );

        let source = err.source().expect("source should be kept");
        let inner = source.downcast_ref::<TransportError>().unwrap();
        assert!(matches!(inner, TransportError::Authentication(_)));
    }

    #[test]
    fn test_shared_is_transparent() {
        let shared = TransportError::Shared(Arc::new(TransportError::Hub(
            HubError::QuotaExceeded("queue depth".into()),
        )));

        assert_eq!(shared.to_string(), "超出配额: queue depth");
        assert!(matches!(
            shared.innermost(),
            TransportError::Hub(HubError::QuotaExceeded(_))
        ));
    }

    #[test]
    fn test_session_annotation_is_transparent() {
        let err = TransportError::connection_closed("boom").on_session(1, 3);

        assert_eq!(err.session_generation(), Some((1, 3)));
        assert!(matches!(err.innermost(), TransportError::Io(_)));
        assert_eq!(err.to_string(), TransportError::connection_closed("boom").to_string());
        assert_eq!(TransportError::other("x").session_generation(), None);
    }

    #[test]
    fn test_connection_closed_is_io() {
        let err = TransportError::connection_closed("boom");
        match err {
            TransportError::Io(io) => {
                assert_eq!(io.kind(), std::io::ErrorKind::ConnectionAborted)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
