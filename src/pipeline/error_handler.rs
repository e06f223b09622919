//! 错误分类处理器
//!
//! 位于传输层正上方：每个操作只向内转发一次，成功结果原样返回，
//! 失败则分类为一个 `ClassifiedFault`。本处理器不跨调用保存任何状态。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::fault::ClassifiedFault;
use super::{DelegatingHandler, OperationKind};
use crate::transport::{Message, Transport, TransportError};

pub struct ClassifyingHandler {
    identity: String,
    inner: Arc<dyn Transport>,
}

impl ClassifyingHandler {
    pub fn new(identity: impl Into<String>, inner: Arc<dyn Transport>) -> Self {
        Self {
            identity: identity.into(),
            inner,
        }
    }

    fn classify_result<T>(
        &self,
        operation: OperationKind,
        result: Result<T, TransportError>,
    ) -> Result<T, ClassifiedFault> {
        match result {
            Ok(value) => {
                debug!(identity = %self.identity, %operation, "操作成功");
                Ok(value)
            }
            Err(err) => {
                let fault = ClassifiedFault::from_error(err);
                warn!(
                    identity = %self.identity,
                    %operation,
                    kind = %fault.kind(),
                    retryable = fault.is_retryable(),
                    "操作失败: {}",
                    fault.message()
                );
                Err(fault)
            }
        }
    }
}

#[async_trait]
impl DelegatingHandler for ClassifyingHandler {
    async fn open(&self, cancel: &CancellationToken) -> Result<(), ClassifiedFault> {
        let result = self.inner.open(cancel).await;
        self.classify_result(OperationKind::Open, result)
    }

    async fn send_event(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        let result = self.inner.send_event(message, cancel).await;
        self.classify_result(OperationKind::SendEvent, result)
    }

    async fn send_events(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        let result = self.inner.send_events(messages, cancel).await;
        self.classify_result(OperationKind::SendEvents, result)
    }

    async fn receive(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, ClassifiedFault> {
        let result = self.inner.receive(timeout, cancel).await;
        self.classify_result(OperationKind::Receive, result)
    }

    async fn complete(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        let result = self.inner.complete(lock_token, cancel).await;
        self.classify_result(OperationKind::Complete, result)
    }

    async fn abandon(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        let result = self.inner.abandon(lock_token, cancel).await;
        self.classify_result(OperationKind::Abandon, result)
    }

    async fn reject(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        let result = self.inner.reject(lock_token, cancel).await;
        self.classify_result(OperationKind::Reject, result)
    }

    /// 关闭失败只记录，不向上抛出
    async fn close(&self, cancel: &CancellationToken) -> Result<(), ClassifiedFault> {
        if let Err(err) = self.inner.close(cancel).await {
            let fault = ClassifiedFault::from_error(err);
            warn!(
                identity = %self.identity,
                kind = %fault.kind(),
                "关闭时发生错误（已忽略）: {}",
                fault.message()
            );
        }
        Ok(())
    }
}
