//! 处理器管道
//!
//! 每个处理器包裹下一个处理器，调用自外向内，故障自内向外：
//! Gatekeeper -> Retry -> Classifying -> 传输层。

pub mod classify;
pub mod error_handler;
pub mod fault;
pub mod gatekeeper;
pub mod retry;
pub mod state;

pub use classify::{Classification, classify};
pub use error_handler::ClassifyingHandler;
pub use fault::{ClassifiedFault, FaultKind, FaultShape};
pub use gatekeeper::GatekeeperHandler;
pub use retry::{RecoveryHook, RetryHandler, RetryPolicy, RetryStrategy};
pub use state::OperationState;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transport::Message;

/// 管道中的处理器
#[async_trait]
pub trait DelegatingHandler: Send + Sync {
    async fn open(&self, cancel: &CancellationToken) -> Result<(), ClassifiedFault>;

    async fn send_event(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault>;

    async fn send_events(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault>;

    async fn receive(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, ClassifiedFault>;

    async fn complete(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault>;

    async fn abandon(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault>;

    async fn reject(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault>;

    async fn close(&self, cancel: &CancellationToken) -> Result<(), ClassifiedFault>;
}

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Open,
    SendEvent,
    SendEvents,
    Receive,
    Complete,
    Abandon,
    Reject,
    Close,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Open => "open",
            OperationKind::SendEvent => "send_event",
            OperationKind::SendEvents => "send_events",
            OperationKind::Receive => "receive",
            OperationKind::Complete => "complete",
            OperationKind::Abandon => "abandon",
            OperationKind::Reject => "reject",
            OperationKind::Close => "close",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次调用中的待完成操作
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub kind: OperationKind,
    pub identity: String,
    pub started_at: Instant,
    pub deadline: Instant,
}

impl PendingOperation {
    pub fn new(kind: OperationKind, identity: impl Into<String>, budget: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            kind,
            identity: identity.into(),
            started_at,
            deadline: started_at + budget,
        }
    }

    /// 剩余时间预算
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 总预算
    pub fn budget(&self) -> Duration {
        self.deadline - self.started_at
    }
}

type HandlerFactory =
    Box<dyn Fn(Arc<dyn DelegatingHandler>) -> Arc<dyn DelegatingHandler> + Send + Sync>;

/// 按有序列表构建处理器链，列表第一个为最外层
#[derive(Default)]
pub struct PipelineBuilder {
    factories: Vec<HandlerFactory>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个处理器（位于已添加处理器的内侧）
    pub fn with<F>(mut self, factory: F) -> Self
    where
        F: Fn(Arc<dyn DelegatingHandler>) -> Arc<dyn DelegatingHandler> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
        self
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// 以 `innermost` 为终点构建整条链，返回最外层处理器
    pub fn build(&self, innermost: Arc<dyn DelegatingHandler>) -> Arc<dyn DelegatingHandler> {
        self.factories
            .iter()
            .rev()
            .fold(innermost, |inner, factory| factory(inner))
    }
}
