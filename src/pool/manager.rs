//! 连接池管理器
//!
//! 固定数量的会话槽位，设备按放置策略确定性地分配到槽位。
//! 某个槽位的会话故障时只重建该槽位，并重新打开该槽位上所有设备的链路；
//! 同一槽位的并发重建请求合并为一次。

use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::identity::{CredentialScope, DeviceIdentity};
use super::slot::{AttachedIdentity, RebuildFuture, SessionSlot, SlotState};
use super::types::{PoolConfig, PoolError, PoolEvent, SessionInfo, SessionStatus};
use crate::transport::{AuthContext, Protocol, SessionConnector, TransportError, TransportSession};

/// 一次租用得到的会话
#[derive(Clone)]
pub struct Lease {
    pub slot: usize,
    pub session: Arc<dyn TransportSession>,
    pub generation: u64,
    /// 设备链路是否已在这一代会话上打开
    pub linked: bool,
}

/// 连接池管理器
pub struct ConnectionPoolManager {
    protocol: Protocol,
    hub_name: String,
    config: PoolConfig,
    connector: Arc<dyn SessionConnector>,
    slots: Vec<Arc<SessionSlot>>,
    /// 设备 ID -> 槽位下标
    assignments: RwLock<HashMap<String, usize>>,
    event_tx: broadcast::Sender<PoolEvent>,
    shutdown: CancellationToken,
}

impl ConnectionPoolManager {
    /// 创建连接池（不会立即建立连接）
    pub fn new(
        protocol: Protocol,
        hub_name: impl Into<String>,
        config: PoolConfig,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(256);
        let size = config.effective_size();

        info!(
            "创建连接池: 协议={}, 槽位数={}, 凭据作用域={}",
            protocol, size, config.credential_scope
        );

        Ok(Self {
            protocol,
            hub_name: hub_name.into(),
            config,
            connector,
            slots: (0..size).map(|i| Arc::new(SessionSlot::new(i))).collect(),
            assignments: RwLock::new(HashMap::new()),
            event_tx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn credential_scope(&self) -> CredentialScope {
        self.config.credential_scope
    }

    /// 实际槽位数
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 订阅事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.event_tx.send(event);
    }

    fn slot(&self, index: usize) -> Result<&Arc<SessionSlot>, PoolError> {
        self.slots
            .get(index)
            .ok_or_else(|| PoolError::InvalidConfig(format!("槽位不存在: {index}")))
    }

    /// 附加设备，返回槽位下标（幂等）
    pub async fn attach(&self, identity: &DeviceIdentity) -> Result<usize, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }
        if identity.protocol() != self.protocol {
            return Err(PoolError::ProtocolMismatch {
                expected: self.protocol,
                actual: identity.protocol(),
            });
        }
        if identity.scope() != self.config.credential_scope {
            return Err(PoolError::CredentialScopeMismatch {
                expected: self.config.credential_scope,
                actual: identity.scope(),
            });
        }

        let mut assignments = self.assignments.write().await;
        if let Some(index) = assignments.get(identity.id()) {
            return Ok(*index);
        }

        let mut loads = vec![0usize; self.slots.len()];
        for index in assignments.values() {
            if let Some(load) = loads.get_mut(*index) {
                *load += 1;
            }
        }
        let index = self.config.placement.place(identity.id(), &loads);
        let slot = self.slot(index)?;
        {
            let mut state = slot.state.lock().await;
            let limit = self.protocol.max_fan_out();
            if state.identities.len() >= limit {
                return Err(PoolError::SessionFull { slot: index, limit });
            }
            state.identities.insert(
                identity.id().to_string(),
                AttachedIdentity {
                    identity: identity.clone(),
                    linked_generation: None,
                },
            );
            state.touch();
        }

        assignments.insert(identity.id().to_string(), index);

        info!("设备 {} 已附加到槽位 {}", identity, index);
        self.emit(PoolEvent::IdentityAttached {
            identity: identity.id().to_string(),
            slot: index,
        });
        Ok(index)
    }

    /// 移除设备；空槽位等待懒关闭，不立即断开
    pub async fn detach(&self, identity: &str) -> Result<(), PoolError> {
        let index = {
            let mut assignments = self.assignments.write().await;
            assignments
                .remove(identity)
                .ok_or_else(|| PoolError::NotAttached(identity.to_string()))?
        };
        let slot = self.slot(index)?;

        let link = {
            let mut state = slot.state.lock().await;
            let linked = state.is_linked(identity);
            let removed = state.identities.remove(identity);
            state.touch();
            match (removed, &state.session) {
                (Some(attached), Some(session)) if linked && !session.is_closed() => {
                    Some((session.clone(), attached.identity))
                }
                _ => None,
            }
        };

        if let Some((session, attached)) = link {
            if let Err(e) = session.close_link(&attached).await {
                debug!("关闭设备 {} 链路失败（已忽略）: {}", attached, e);
            }
        }

        info!("设备 {} 已从槽位 {} 移除", identity, index);
        self.emit(PoolEvent::IdentityDetached {
            identity: identity.to_string(),
            slot: index,
        });
        Ok(())
    }

    /// 设备所在槽位
    pub async fn slot_of(&self, identity: &str) -> Option<usize> {
        self.assignments.read().await.get(identity).copied()
    }

    /// 租用设备所在槽位的会话；会话不可用时发起（或加入）重建并等待
    pub async fn lease(
        &self,
        identity: &DeviceIdentity,
        cancel: &CancellationToken,
    ) -> Result<Lease, TransportError> {
        let index = self
            .slot_of(identity.id())
            .await
            .ok_or_else(|| PoolError::NotAttached(identity.id().to_string()))?;
        let slot = self.slot(index)?;

        let rebuild = {
            let mut state = slot.state.lock().await;
            if self.is_shut_down() {
                return Err(PoolError::ShutDown.into());
            }
            if let Some(lease) = Self::lease_locked(index, &mut state, identity) {
                return Ok(lease);
            }
            self.start_rebuild_locked(slot, &mut state)
        };

        let generation = Self::await_rebuild(rebuild, cancel).await?;

        let mut state = slot.state.lock().await;
        if state.generation == generation {
            if let Some(session) = state.session.clone() {
                let linked = state.is_linked(identity.id());
                state.touch();
                return Ok(Lease {
                    slot: index,
                    session,
                    generation,
                    linked,
                });
            }
        }
        // 等待期间会话又被替换或关闭
        Self::lease_locked(index, &mut state, identity).ok_or_else(|| {
            TransportError::connection_closed(format!("槽位 {index} 的会话在重建后不可用"))
        })
    }

    fn lease_locked(
        index: usize,
        state: &mut SlotState,
        identity: &DeviceIdentity,
    ) -> Option<Lease> {
        if !state.is_usable() {
            return None;
        }
        let session = state.session.clone()?;
        state.touch();
        Some(Lease {
            slot: index,
            session,
            generation: state.generation,
            linked: state.is_linked(identity.id()),
        })
    }

    async fn await_rebuild(
        rebuild: RebuildFuture,
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Canceled("等待会话重建时被取消".to_string())),
            result = rebuild => result.map_err(TransportError::Shared),
        }
    }

    /// 槽位在 `observed` 这一代上是否需要重建
    pub async fn needs_rebuild(&self, index: usize, observed: u64) -> bool {
        let Ok(slot) = self.slot(index) else {
            return false;
        };
        let state = slot.state.lock().await;
        if state.rebuild.is_some() {
            return true;
        }
        state.generation == observed && !state.is_usable()
    }

    /// 重建槽位。若调用方观察到的那一代已被替换，直接返回当前代数
    pub async fn rebuild(
        &self,
        index: usize,
        observed: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError> {
        let slot = self.slot(index)?;
        let rebuild = {
            let mut state = slot.state.lock().await;
            if self.is_shut_down() {
                return Err(PoolError::ShutDown.into());
            }
            if state.rebuild.is_none() && state.generation != observed && state.is_usable() {
                return Ok(state.generation);
            }
            self.start_rebuild_locked(slot, &mut state)
        };
        Self::await_rebuild(rebuild, cancel).await
    }

    /// 在持有槽位锁时发起重建；已有进行中的重建则复用
    fn start_rebuild_locked(&self, slot: &Arc<SessionSlot>, state: &mut SlotState) -> RebuildFuture {
        if let Some(rebuild) = &state.rebuild {
            return rebuild.clone();
        }

        let index = slot.index();
        state.status = SessionStatus::Rebuilding;
        let previous = state.session.take();
        let identities: Vec<DeviceIdentity> = state
            .identities
            .values()
            .map(|a| a.identity.clone())
            .collect();

        let task = RebuildTask {
            slot: slot.clone(),
            connector: self.connector.clone(),
            protocol: self.protocol,
            auth: AuthContext {
                hub_name: self.hub_name.clone(),
                scope: self.config.credential_scope,
                slot: index,
            },
            previous,
            identities,
            event_tx: self.event_tx.clone(),
            shutdown: self.shutdown.clone(),
        };

        // 重建在独立任务中运行，等待者被取消也不会留下半建好的会话
        let handle = tokio::spawn(task.run());
        let rebuild = async move {
            match handle.await {
                Ok(result) => result,
                Err(join) => Err(Arc::new(TransportError::wrap("会话重建任务异常退出", join))),
            }
        }
        .boxed()
        .shared();

        state.rebuild = Some(rebuild.clone());
        debug!("槽位 {} 开始重建", index);
        self.emit(PoolEvent::RebuildStarted { slot: index });
        rebuild
    }

    /// 标记槽位故障（只有代数一致时生效），返回是否生效
    pub async fn mark_faulted(&self, index: usize, generation: u64) -> bool {
        let Ok(slot) = self.slot(index) else {
            return false;
        };
        let mut state = slot.state.lock().await;
        if state.generation != generation || state.status != SessionStatus::Open {
            return false;
        }
        state.status = SessionStatus::Faulted;
        warn!("槽位 {} 第 {} 代会话故障，{} 个设备待重新附加", index, generation, state.identities.len());
        self.emit(PoolEvent::SessionFaulted {
            slot: index,
            generation,
        });
        true
    }

    /// 记录设备链路已在 `generation` 代会话上打开
    pub async fn mark_linked(&self, identity: &str, generation: u64) {
        let Some(index) = self.slot_of(identity).await else {
            return;
        };
        let Ok(slot) = self.slot(index) else {
            return;
        };
        let mut state = slot.state.lock().await;
        if state.generation != generation {
            return;
        }
        if let Some(attached) = state.identities.get_mut(identity) {
            attached.linked_generation = Some(generation);
        }
    }

    /// 设备链路失效，下次租用时重新打开
    pub async fn mark_unlinked(&self, identity: &str) {
        let Some(index) = self.slot_of(identity).await else {
            return;
        };
        let Ok(slot) = self.slot(index) else {
            return;
        };
        let mut state = slot.state.lock().await;
        if let Some(attached) = state.identities.get_mut(identity) {
            attached.linked_generation = None;
        }
    }

    /// 所有槽位的快照
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            infos.push(slot.info().await);
        }
        infos
    }

    pub async fn session_info(&self, index: usize) -> Option<SessionInfo> {
        match self.slot(index) {
            Ok(slot) => Some(slot.info().await),
            Err(_) => None,
        }
    }

    /// 关闭空闲超过阈值的空槽位
    pub async fn close_idle_sessions(&self) -> usize {
        self.teardown_empty(Duration::from_secs(self.config.idle_teardown_secs))
            .await
    }

    /// 立即关闭所有空槽位
    pub async fn close_empty_sessions(&self) -> usize {
        self.teardown_empty(Duration::ZERO).await
    }

    async fn teardown_empty(&self, threshold: Duration) -> usize {
        let threshold = threshold.as_secs() as i64;
        let mut closed = 0;
        for slot in &self.slots {
            let session = {
                let mut state = slot.state.lock().await;
                if !state.identities.is_empty()
                    || state.rebuild.is_some()
                    || state.idle_seconds() < threshold
                {
                    continue;
                }
                let Some(session) = state.session.take() else {
                    continue;
                };
                state.status = SessionStatus::Closed;
                session
            };

            if let Err(e) = session.close().await {
                debug!("关闭空闲会话失败（已忽略）: {}", e);
            }
            info!("槽位 {} 空闲，会话已关闭", slot.index());
            self.emit(PoolEvent::SessionClosed { slot: slot.index() });
            closed += 1;
        }
        closed
    }

    /// 关闭连接池：断开所有会话并移除所有设备
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.assignments.write().await.clear();

        for slot in &self.slots {
            let session = {
                let mut state = slot.state.lock().await;
                state.identities.clear();
                state.status = SessionStatus::Closed;
                state.session.take()
            };
            if let Some(session) = session {
                if let Err(e) = session.close().await {
                    debug!("关闭会话失败（已忽略）: {}", e);
                }
                self.emit(PoolEvent::SessionClosed { slot: slot.index() });
            }
        }
        info!("连接池已关闭");
    }
}

/// 一次槽位重建
struct RebuildTask {
    slot: Arc<SessionSlot>,
    connector: Arc<dyn SessionConnector>,
    protocol: Protocol,
    auth: AuthContext,
    previous: Option<Arc<dyn TransportSession>>,
    identities: Vec<DeviceIdentity>,
    event_tx: broadcast::Sender<PoolEvent>,
    shutdown: CancellationToken,
}

impl RebuildTask {
    async fn run(self) -> Result<u64, Arc<TransportError>> {
        let index = self.slot.index();

        if let Some(previous) = &self.previous {
            if let Err(e) = previous.close().await {
                debug!("槽位 {} 旧会话关闭失败（已忽略）: {}", index, e);
            }
        }

        let connected = self.connect_and_link().await;

        let mut state = self.slot.state.lock().await;
        state.rebuild = None;

        let (session, linked) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                state.status = SessionStatus::Faulted;
                error!("槽位 {} 重建失败: {}", index, e);
                let _ = self.event_tx.send(PoolEvent::RebuildFailed {
                    slot: index,
                    error: e.to_string(),
                });
                return Err(Arc::new(e));
            }
        };

        if self.shutdown.is_cancelled() {
            state.status = SessionStatus::Closed;
            drop(state);
            let _ = session.close().await;
            return Err(Arc::new(PoolError::ShutDown.into()));
        }

        state.generation += 1;
        let generation = state.generation;
        // 重建期间被移除的设备，其链路已在新会话上打开，需要关掉
        let mut detached = Vec::new();
        for id in &linked {
            match state.identities.get_mut(id) {
                Some(attached) => attached.linked_generation = Some(generation),
                None => detached.push(id.as_str()),
            }
        }
        let session_id = session.session_id().to_string();
        state.session = Some(session.clone());
        state.status = SessionStatus::Open;
        state.created_at = Some(Utc::now());
        state.touch();
        drop(state);

        for identity in self.identities.iter().filter(|i| detached.contains(&i.id())) {
            if let Err(e) = session.close_link(identity).await {
                debug!("关闭已移除设备 {} 的链路失败（已忽略）: {}", identity, e);
            }
        }

        info!(
            "槽位 {} 会话已建立: 第 {} 代, {} 个设备链路已打开",
            index,
            generation,
            linked.len()
        );
        let _ = self.event_tx.send(PoolEvent::SessionOpened {
            slot: index,
            generation,
            session_id,
        });
        Ok(generation)
    }

    /// 建立连接并重新打开快照中每个设备的链路
    ///
    /// 单个设备的链路失败只影响该设备（它会在下次租用时自行打开链路并得到自己的故障），
    /// 连接本身失败才让整个槽位重建失败。
    async fn connect_and_link(
        &self,
    ) -> Result<(Arc<dyn TransportSession>, Vec<String>), TransportError> {
        let session = self.connector.connect(self.protocol, &self.auth).await?;
        let mut linked = Vec::with_capacity(self.identities.len());
        for identity in &self.identities {
            match session.open_link(identity).await {
                Ok(()) => linked.push(identity.id().to_string()),
                Err(e) if session.is_closed() => return Err(e),
                Err(e) => warn!("设备 {} 链路重新打开失败: {}", identity, e),
            }
        }
        Ok((session, linked))
    }
}
