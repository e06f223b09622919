//! 基于连接池的单设备传输
//!
//! 每次操作从连接池租用设备所在槽位的会话，必要时先打开链路。
//! 操作失败且物理连接已断开时，把该代会话标记为故障，由重试前的恢复钩子重建。
//! 失败会带上所租用会话的槽位与代数，恢复钩子据此判断是否需要重建。

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::identity::DeviceIdentity;
use super::manager::{ConnectionPoolManager, Lease};
use crate::pipeline::{ClassifiedFault, FaultKind, RecoveryHook};
use crate::transport::{Disposition, Message, Transport, TransportError, TransportSession};

pub struct PooledTransport {
    identity: DeviceIdentity,
    pool: Arc<ConnectionPoolManager>,
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Canceled("调用方取消".to_string())),
        result = operation => result,
    }
}

impl PooledTransport {
    pub fn new(identity: DeviceIdentity, pool: Arc<ConnectionPoolManager>) -> Self {
        Self { identity, pool }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn pool(&self) -> &Arc<ConnectionPoolManager> {
        &self.pool
    }

    /// 租用会话并确保本设备链路已打开
    async fn linked(&self, cancel: &CancellationToken) -> Result<Lease, TransportError> {
        let lease = self.pool.lease(&self.identity, cancel).await?;

        if !lease.linked {
            let opened = cancellable(cancel, lease.session.open_link(&self.identity)).await;
            self.check(&lease, opened).await?;
            self.pool
                .mark_linked(self.identity.id(), lease.generation)
                .await;
            debug!("设备 {} 链路已在第 {} 代会话上打开", self.identity, lease.generation);
        }
        Ok(lease)
    }

    /// 操作失败且物理连接已断开时标记槽位故障；失败标注所在会话
    async fn check<T>(
        &self,
        lease: &Lease,
        result: Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if lease.session.is_closed() {
                    self.pool.mark_faulted(lease.slot, lease.generation).await;
                }
                Err(e.on_session(lease.slot, lease.generation))
            }
        }
    }

    /// 失败所在的会话；租用本身失败时以槽位当前的代数为准
    async fn failed_session(&self, fault: &ClassifiedFault) -> Option<(usize, u64)> {
        let slot = self.pool.slot_of(self.identity.id()).await?;
        match fault
            .find_cause::<TransportError>()
            .and_then(TransportError::session_generation)
        {
            Some((failed_slot, generation)) if failed_slot == slot => Some((slot, generation)),
            Some(_) => None,
            None => self
                .pool
                .session_info(slot)
                .await
                .map(|info| (slot, info.generation)),
        }
    }

    async fn dispose(
        &self,
        lock_token: &str,
        disposition: Disposition,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let lease = self.linked(cancel).await?;
        let result = cancellable(
            cancel,
            lease
                .session
                .dispose(&self.identity, lock_token, disposition),
        )
        .await;
        self.check(&lease, result).await
    }
}

#[async_trait]
impl Transport for PooledTransport {
    async fn open(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        self.pool.attach(&self.identity).await?;
        self.linked(cancel).await.map(|_| ())
    }

    async fn send_event(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.send_events(std::slice::from_ref(message), cancel).await
    }

    async fn send_events(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let lease = self.linked(cancel).await?;
        let result = cancellable(cancel, lease.session.send(&self.identity, messages)).await;
        self.check(&lease, result).await
    }

    async fn receive(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, TransportError> {
        let lease = self.linked(cancel).await?;
        let result = cancellable(cancel, lease.session.receive(&self.identity, timeout)).await;
        self.check(&lease, result).await
    }

    async fn complete(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.dispose(lock_token, Disposition::Complete, cancel).await
    }

    async fn abandon(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.dispose(lock_token, Disposition::Abandon, cancel).await
    }

    async fn reject(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.dispose(lock_token, Disposition::Reject, cancel).await
    }

    /// 从连接池移除；物理连接由连接池懒关闭
    async fn close(&self, _cancel: &CancellationToken) -> Result<(), TransportError> {
        if self.pool.slot_of(self.identity.id()).await.is_none() {
            return Ok(());
        }
        self.pool.detach(self.identity.id()).await?;
        Ok(())
    }
}

#[async_trait]
impl RecoveryHook for PooledTransport {
    /// 会话已故障则重建整个槽位；会话仍可用则只重新打开本设备链路
    async fn recover(
        &self,
        fault: &ClassifiedFault,
        cancel: &CancellationToken,
    ) -> Result<(), ClassifiedFault> {
        let Some((slot, observed)) = self.failed_session(fault).await else {
            return Ok(());
        };

        if self.pool.needs_rebuild(slot, observed).await {
            debug!("设备 {} 触发槽位 {} 重建（第 {} 代）", self.identity, slot, observed);
            self.pool
                .rebuild(slot, observed, cancel)
                .await
                .map_err(ClassifiedFault::from_error)?;
        } else if fault.kind() == FaultKind::TransientNetwork {
            self.pool.mark_unlinked(self.identity.id()).await;
        }
        Ok(())
    }
}
