//! 重试处理器
//!
//! 可重试故障在时间预算内重试；每次重试前先等待退避，再调用恢复钩子
//! （重建会话或重新打开链路）。时间预算耗尽时返回取消类通信故障，
//! 尝试次数耗尽时返回最后一次的原始故障。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fault::ClassifiedFault;
use super::state::OperationState;
use super::{DelegatingHandler, OperationKind, PendingOperation};
use crate::transport::Message;

/// 重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// 立即重试
    Immediate,

    /// 固定延迟重试
    FixedDelay { delay_ms: u64 },

    /// 指数退避重试
    ExponentialBackoff {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },

    /// 无重试
    None,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// 获取下一次重试的延迟时间
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryStrategy::Immediate => Some(Duration::ZERO),
            RetryStrategy::FixedDelay { delay_ms } => Some(Duration::from_millis(*delay_ms)),
            RetryStrategy::ExponentialBackoff {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = attempt.min(i32::MAX as u32) as i32;
                let delay = (*initial_delay_ms as f64 * multiplier.powi(exponent)) as u64;
                Some(Duration::from_millis(delay.min(*max_delay_ms)))
            }
            RetryStrategy::None => None,
        }
    }

    /// 创建指数退避策略
    pub fn exponential(initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self::ExponentialBackoff {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        }
    }

    /// 创建固定延迟策略
    pub fn fixed(delay_ms: u64) -> Self {
        Self::FixedDelay { delay_ms }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次），`None` 表示只受时间预算限制
    pub max_attempts: Option<u32>,

    /// 退避策略
    pub strategy: RetryStrategy,

    /// 单次调用的时间预算（毫秒）
    pub operation_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            strategy: RetryStrategy::default(),
            operation_timeout_ms: 240_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(strategy: RetryStrategy, operation_timeout: Duration) -> Self {
        Self {
            max_attempts: None,
            strategy,
            operation_timeout_ms: operation_timeout.as_millis() as u64,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// 已尝试 `attempts` 次后是否还能继续
    fn allows_another_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

/// 重试前的恢复钩子
#[async_trait]
pub trait RecoveryHook: Send + Sync {
    async fn recover(
        &self,
        fault: &ClassifiedFault,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault>;
}

pub struct RetryHandler {
    identity: String,
    inner: Arc<dyn DelegatingHandler>,
    policy: RetryPolicy,
    hook: Option<Arc<dyn RecoveryHook>>,
    state: watch::Sender<OperationState>,
}

impl RetryHandler {
    pub fn new(
        identity: impl Into<String>,
        inner: Arc<dyn DelegatingHandler>,
        policy: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(OperationState::Idle);
        Self {
            identity: identity.into(),
            inner,
            policy,
            hook: None,
            state,
        }
    }

    pub fn with_recovery_hook(mut self, hook: Arc<dyn RecoveryHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// 复用外部创建的状态通道
    pub fn with_state_channel(mut self, state: watch::Sender<OperationState>) -> Self {
        self.state = state;
        self
    }

    /// 订阅状态变化（最近一次调用的状态）
    pub fn subscribe_state(&self) -> watch::Receiver<OperationState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: OperationState) {
        let previous = self.state.send_replace(next);
        if !previous.can_transition_to(&next) {
            // 并发调用共享同一个通道，交错的转移只记录不拦截
            debug!(
                identity = %self.identity,
                "状态交错: {} -> {}",
                previous.as_str(),
                next.as_str()
            );
        }
    }

    fn report(&self, fault: ClassifiedFault) -> ClassifiedFault {
        self.set_state(OperationState::Reported(fault.kind()));
        fault
    }

    async fn recover(
        &self,
        fault: &ClassifiedFault,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        tokio::time::sleep(delay).await;
        match &self.hook {
            Some(hook) => hook.recover(fault, cancel).await,
            None => Ok(()),
        }
    }

    async fn run<T, F, Fut>(
        &self,
        kind: OperationKind,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, ClassifiedFault>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ClassifiedFault>> + Send,
        T: Send,
    {
        let pending = PendingOperation::new(kind, &self.identity, self.policy.operation_timeout());
        let mut attempts: u32 = 0;
        let mut last_fault: Option<ClassifiedFault> = None;

        loop {
            attempts += 1;
            self.set_state(OperationState::InFlight(kind));

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self.report(ClassifiedFault::canceled(format!("{kind} 被调用方取消"))));
                }
                outcome = tokio::time::timeout_at(pending.deadline, attempt()) => outcome,
            };

            let fault = match outcome {
                Ok(Ok(value)) => {
                    if attempts > 1 {
                        info!(identity = %self.identity, operation = %kind, "操作在第 {} 次尝试后成功", attempts);
                    }
                    self.set_state(OperationState::Idle);
                    return Ok(value);
                }
                Ok(Err(fault)) => fault,
                Err(_) => {
                    return Err(self.report(ClassifiedFault::timed_out(
                        kind,
                        pending.budget(),
                        last_fault.as_ref(),
                    )));
                }
            };

            self.set_state(OperationState::Faulted(fault.kind()));

            if !fault.is_retryable() {
                debug!(identity = %self.identity, operation = %kind, "故障不可重试: {}", fault);
                return Err(self.report(fault));
            }
            if !self.policy.allows_another_attempt(attempts) {
                warn!(identity = %self.identity, operation = %kind, "已达最大尝试次数 {}: {}", attempts, fault);
                return Err(self.report(fault));
            }
            let Some(delay) = self.policy.strategy.next_delay(attempts - 1) else {
                return Err(self.report(fault));
            };

            self.set_state(OperationState::Recovering { attempt: attempts });
            debug!(identity = %self.identity, operation = %kind, "等待 {:?} 后重试: {}", delay, fault);

            let recovered = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self.report(ClassifiedFault::canceled(format!("{kind} 在恢复期间被取消"))));
                }
                recovered = tokio::time::timeout_at(pending.deadline, self.recover(&fault, delay, cancel)) => recovered,
            };

            match recovered {
                Ok(Ok(())) => last_fault = Some(fault),
                Ok(Err(recover_fault)) => {
                    if !recover_fault.is_retryable() {
                        warn!(identity = %self.identity, operation = %kind, "恢复失败: {}", recover_fault);
                        return Err(self.report(recover_fault));
                    }
                    last_fault = Some(recover_fault);
                }
                Err(_) => {
                    return Err(self.report(ClassifiedFault::timed_out(
                        kind,
                        pending.budget(),
                        Some(&fault),
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl DelegatingHandler for RetryHandler {
    async fn open(&self, cancel: &CancellationToken) -> Result<(), ClassifiedFault> {
        let inner = &*self.inner;
        self.run(OperationKind::Open, cancel, move || inner.open(cancel))
            .await
    }

    async fn send_event(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        let inner = &*self.inner;
        self.run(OperationKind::SendEvent, cancel, move || {
            inner.send_event(message, cancel)
        })
        .await
    }

    async fn send_events(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        let inner = &*self.inner;
        self.run(OperationKind::SendEvents, cancel, move || {
            inner.send_events(messages, cancel)
        })
        .await
    }

    async fn receive(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, ClassifiedFault> {
        let inner = &*self.inner;
        self.run(OperationKind::Receive, cancel, move || {
            inner.receive(timeout, cancel)
        })
        .await
    }

    async fn complete(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        let inner = &*self.inner;
        self.run(OperationKind::Complete, cancel, move || {
            inner.complete(lock_token, cancel)
        })
        .await
    }

    async fn abandon(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        let inner = &*self.inner;
        self.run(OperationKind::Abandon, cancel, move || {
            inner.abandon(lock_token, cancel)
        })
        .await
    }

    async fn reject(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        let inner = &*self.inner;
        self.run(OperationKind::Reject, cancel, move || {
            inner.reject(lock_token, cancel)
        })
        .await
    }

    /// 关闭不重试
    async fn close(&self, cancel: &CancellationToken) -> Result<(), ClassifiedFault> {
        self.inner.close(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FaultKind;
    use crate::transport::{HubError, TransportError};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 前 `failures` 次返回指定故障的处理器
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        fault: fn() -> TransportError,
    }

    impl Flaky {
        fn new(failures: u32, fault: fn() -> TransportError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
                fault,
            })
        }

        fn next(&self) -> Result<(), ClassifiedFault> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(ClassifiedFault::from_error((self.fault)()))
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DelegatingHandler for Flaky {
        async fn open(&self, _cancel: &CancellationToken) -> Result<(), ClassifiedFault> {
            self.next()
        }

        async fn send_event(
            &self,
            _message: &Message,
            _cancel: &CancellationToken,
        ) -> Result<(), ClassifiedFault> {
            self.next()
        }

        async fn send_events(
            &self,
            _messages: &[Message],
            _cancel: &CancellationToken,
        ) -> Result<(), ClassifiedFault> {
            self.next()
        }

        async fn receive(
            &self,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<Option<Message>, ClassifiedFault> {
            self.next().map(|_| None)
        }

        async fn complete(
            &self,
            _lock_token: &str,
            _cancel: &CancellationToken,
        ) -> Result<(), ClassifiedFault> {
            self.next()
        }

        async fn abandon(
            &self,
            _lock_token: &str,
            _cancel: &CancellationToken,
        ) -> Result<(), ClassifiedFault> {
            self.next()
        }

        async fn reject(
            &self,
            _lock_token: &str,
            _cancel: &CancellationToken,
        ) -> Result<(), ClassifiedFault> {
            self.next()
        }

        async fn close(&self, _cancel: &CancellationToken) -> Result<(), ClassifiedFault> {
            self.next()
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        faults: Mutex<Vec<FaultKind>>,
    }

    #[async_trait]
    impl RecoveryHook for RecordingHook {
        async fn recover(
            &self,
            fault: &ClassifiedFault,
            _cancel: &CancellationToken,
        ) -> Result<(), ClassifiedFault> {
            self.faults.lock().unwrap().push(fault.kind());
            Ok(())
        }
    }

    fn socket_error() -> TransportError {
        TransportError::Socket("reset".into())
    }

    fn quota_error() -> TransportError {
        TransportError::Hub(HubError::QuotaExceeded("daily".into()))
    }

    fn throttle_error() -> TransportError {
        TransportError::Hub(HubError::Throttled("slow down".into()))
    }

    fn policy(strategy: RetryStrategy, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy::new(strategy, Duration::from_millis(timeout_ms))
    }

    #[test]
    fn test_exponential_backoff() {
        let strategy = RetryStrategy::exponential(1000, 10000, 2.0);

        assert_eq!(strategy.next_delay(0), Some(Duration::from_millis(1000)));
        assert_eq!(strategy.next_delay(1), Some(Duration::from_millis(2000)));
        assert_eq!(strategy.next_delay(3), Some(Duration::from_millis(8000)));
        assert_eq!(strategy.next_delay(4), Some(Duration::from_millis(10000)));
    }

    #[test]
    fn test_fixed_and_none() {
        let strategy = RetryStrategy::fixed(2000);
        assert_eq!(strategy.next_delay(0), Some(Duration::from_millis(2000)));
        assert_eq!(strategy.next_delay(5), Some(Duration::from_millis(2000)));
        assert_eq!(RetryStrategy::None.next_delay(0), None);
    }

    #[test]
    fn test_policy_toml_roundtrip_shape() {
        let policy: RetryPolicy = toml::from_str(
            r#"
            max_attempts = 5
            operation_timeout_ms = 1000

            [strategy]
            type = "fixed_delay"
            delay_ms = 50
            "#,
        )
        .unwrap();

        assert_eq!(policy.max_attempts, Some(5));
        assert_eq!(policy.strategy, RetryStrategy::fixed(50));
        assert_eq!(policy.operation_timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_transient_fault_is_retried_with_recovery() {
        let inner = Flaky::new(2, socket_error);
        let hook = Arc::new(RecordingHook::default());
        let handler = RetryHandler::new("device-1", inner.clone(), policy(RetryStrategy::Immediate, 5_000))
            .with_recovery_hook(hook.clone());

        handler
            .send_event(&Message::new("x"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(inner.calls(), 3);
        assert_eq!(
            *hook.faults.lock().unwrap(),
            vec![FaultKind::TransientNetwork, FaultKind::TransientNetwork]
        );
        assert_eq!(*handler.subscribe_state().borrow(), OperationState::Idle);
    }

    #[tokio::test]
    async fn test_non_retryable_fault_surfaces_once() {
        let inner = Flaky::new(1, quota_error);
        let handler = RetryHandler::new("device-1", inner.clone(), policy(RetryStrategy::Immediate, 5_000));

        let fault = handler
            .send_event(&Message::new("x"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(fault.kind(), FaultKind::Quota);
        assert_eq!(inner.calls(), 1);
        assert_eq!(
            *handler.subscribe_state().borrow(),
            OperationState::Reported(FaultKind::Quota)
        );
    }

    #[tokio::test]
    async fn test_attempt_budget_surfaces_original_fault() {
        let inner = Flaky::new(u32::MAX, throttle_error);
        let handler = RetryHandler::new(
            "device-1",
            inner.clone(),
            policy(RetryStrategy::Immediate, 5_000).with_max_attempts(3),
        );

        let fault = handler
            .open(&CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(fault.kind(), FaultKind::Throttle);
        assert!(!fault.is_cancellation());
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_budget_surfaces_cancellation() {
        let inner = Flaky::new(u32::MAX, throttle_error);
        let handler = RetryHandler::new(
            "device-1",
            inner.clone(),
            policy(RetryStrategy::fixed(400), 1_000),
        );

        let fault = handler
            .send_event(&Message::new("x"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(fault.is_cancellation());
        assert!(inner.calls() >= 2);
    }

    #[tokio::test]
    async fn test_no_retry_strategy_reports_first_fault() {
        let inner = Flaky::new(1, socket_error);
        let handler = RetryHandler::new("device-1", inner.clone(), policy(RetryStrategy::None, 5_000));

        let fault = handler
            .receive(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(fault.kind(), FaultKind::TransientNetwork);
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let inner = Flaky::new(u32::MAX, socket_error);
        let handler = RetryHandler::new("device-1", inner, policy(RetryStrategy::fixed(50), 60_000));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            canceller.cancel();
        });

        let fault = handler
            .complete("lock-1", &cancel)
            .await
            .unwrap_err();
        assert!(fault.is_cancellation());
    }

    #[tokio::test]
    async fn test_close_is_not_retried() {
        let inner = Flaky::new(1, socket_error);
        let handler = RetryHandler::new("device-1", inner.clone(), policy(RetryStrategy::Immediate, 5_000));

        assert!(handler.close(&CancellationToken::new()).await.is_err());
        assert_eq!(inner.calls(), 1);
    }
}
