//! 设备客户端
//!
//! 为单个设备身份组装处理器链：
//! Gatekeeper -> Retry -> Classifying -> PooledTransport。
//! 支持复用的协议可以共享外部连接池，其余情况使用私有的单槽位连接池。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pipeline::{
    ClassifiedFault, ClassifyingHandler, DelegatingHandler, GatekeeperHandler, OperationState,
    PipelineBuilder, RecoveryHook, RetryHandler, RetryPolicy,
};
use crate::pool::{ConnectionPoolManager, DeviceIdentity, PoolConfig, PoolError, PooledTransport};
use crate::transport::{Message, SessionConnector};

pub struct DeviceClientBuilder {
    identity: DeviceIdentity,
    connector: Arc<dyn SessionConnector>,
    hub_name: String,
    pool: Option<Arc<ConnectionPoolManager>>,
    retry: RetryPolicy,
}

impl DeviceClientBuilder {
    pub fn hub_name(mut self, hub_name: impl Into<String>) -> Self {
        self.hub_name = hub_name.into();
        self
    }

    /// 使用共享连接池
    pub fn pool(mut self, pool: Arc<ConnectionPoolManager>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Result<DeviceClient, PoolError> {
        let protocol = self.identity.protocol();
        let (pool, owns_pool) = match self.pool {
            Some(pool) => {
                if pool.protocol() != protocol {
                    return Err(PoolError::ProtocolMismatch {
                        expected: pool.protocol(),
                        actual: protocol,
                    });
                }
                (pool, false)
            }
            None => {
                let config = PoolConfig::new(1, 1).with_scope(self.identity.scope());
                let pool = ConnectionPoolManager::new(protocol, self.hub_name, config, self.connector)?;
                (Arc::new(pool), true)
            }
        };

        let id = self.identity.id().to_string();
        let pooled = Arc::new(PooledTransport::new(self.identity.clone(), pool.clone()));
        let hook: Arc<dyn RecoveryHook> = pooled.clone();
        let (state, _) = watch::channel(OperationState::Idle);

        let pipeline = {
            let retry_id = id.clone();
            let retry = self.retry.clone();
            let state = state.clone();
            PipelineBuilder::new()
                .with(|inner| -> Arc<dyn DelegatingHandler> {
                    Arc::new(GatekeeperHandler::new(inner))
                })
                .with(move |inner| -> Arc<dyn DelegatingHandler> {
                    Arc::new(
                        RetryHandler::new(retry_id.clone(), inner, retry.clone())
                            .with_recovery_hook(hook.clone())
                            .with_state_channel(state.clone()),
                    )
                })
                .build(Arc::new(ClassifyingHandler::new(id, pooled)))
        };

        Ok(DeviceClient {
            identity: self.identity,
            pool,
            owns_pool,
            pipeline,
            state,
            cancel: CancellationToken::new(),
        })
    }
}

/// 单个设备的客户端
pub struct DeviceClient {
    identity: DeviceIdentity,
    pool: Arc<ConnectionPoolManager>,
    owns_pool: bool,
    pipeline: Arc<dyn DelegatingHandler>,
    state: watch::Sender<OperationState>,
    cancel: CancellationToken,
}

impl DeviceClient {
    pub fn builder(
        identity: DeviceIdentity,
        connector: Arc<dyn SessionConnector>,
    ) -> DeviceClientBuilder {
        DeviceClientBuilder {
            identity,
            connector,
            hub_name: "hublink".to_string(),
            pool: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn pool(&self) -> &Arc<ConnectionPoolManager> {
        &self.pool
    }

    /// 设备所在槽位
    pub async fn slot_index(&self) -> Option<usize> {
        self.pool.slot_of(self.identity.id()).await
    }

    /// 订阅最近一次调用的恢复状态
    pub fn subscribe_state(&self) -> watch::Receiver<OperationState> {
        self.state.subscribe()
    }

    pub async fn open(&self) -> Result<(), ClassifiedFault> {
        self.pipeline.open(&self.cancel).await?;
        info!("设备 {} 已打开", self.identity);
        Ok(())
    }

    pub async fn send_event(&self, message: Message) -> Result<(), ClassifiedFault> {
        self.pipeline.send_event(&message, &self.cancel).await
    }

    pub async fn send_events(&self, messages: Vec<Message>) -> Result<(), ClassifiedFault> {
        self.pipeline.send_events(&messages, &self.cancel).await
    }

    /// 接收云到设备消息，超时返回 `None`
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>, ClassifiedFault> {
        self.pipeline.receive(timeout, &self.cancel).await
    }

    pub async fn complete(&self, lock_token: &str) -> Result<(), ClassifiedFault> {
        self.pipeline.complete(lock_token, &self.cancel).await
    }

    pub async fn abandon(&self, lock_token: &str) -> Result<(), ClassifiedFault> {
        self.pipeline.abandon(lock_token, &self.cancel).await
    }

    pub async fn reject(&self, lock_token: &str) -> Result<(), ClassifiedFault> {
        self.pipeline.reject(lock_token, &self.cancel).await
    }

    /// 关闭设备；私有连接池的物理连接随之关闭
    pub async fn close(&self) -> Result<(), ClassifiedFault> {
        self.pipeline.close(&self.cancel).await?;
        if self.owns_pool {
            self.pool.close_empty_sessions().await;
        }
        info!("设备 {} 已关闭", self.identity);
        Ok(())
    }

    /// 取消所有进行中的操作并释放
    pub async fn dispose(&self) {
        self.cancel.cancel();
        if let Err(e) = self.pipeline.close(&CancellationToken::new()).await {
            debug!("释放设备 {} 时关闭失败（已忽略）: {}", self.identity, e);
        }
        if self.owns_pool {
            self.pool.shutdown().await;
        }
    }
}
