//! 会话槽位
//!
//! 槽位内的所有变更都在槽位自己的互斥锁下进行，不同槽位互不阻塞。

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::identity::DeviceIdentity;
use super::types::{SessionInfo, SessionStatus};
use crate::transport::{TransportError, TransportSession};

/// 进行中的重建，所有等待者共享同一个结果（新的代数）
pub(crate) type RebuildFuture = Shared<BoxFuture<'static, Result<u64, Arc<TransportError>>>>;

/// 附加在槽位上的设备
#[derive(Debug, Clone)]
pub(crate) struct AttachedIdentity {
    pub identity: DeviceIdentity,
    /// 链路在哪一代会话上打开；与当前代数不一致即为待重新附加
    pub linked_generation: Option<u64>,
}

pub(crate) struct SlotState {
    pub status: SessionStatus,
    pub session: Option<Arc<dyn TransportSession>>,
    pub generation: u64,
    pub identities: BTreeMap<String, AttachedIdentity>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_used: DateTime<Utc>,
    pub rebuild: Option<RebuildFuture>,
}

impl SlotState {
    fn new() -> Self {
        Self {
            status: SessionStatus::Empty,
            session: None,
            generation: 0,
            identities: BTreeMap::new(),
            created_at: None,
            last_used: Utc::now(),
            rebuild: None,
        }
    }

    /// 更新最后使用时间
    pub fn touch(&mut self) {
        self.last_used = Utc::now();
    }

    /// 获取空闲时长（秒）
    pub fn idle_seconds(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.last_used)
            .num_seconds()
    }

    /// 会话可直接使用
    pub fn is_usable(&self) -> bool {
        self.status == SessionStatus::Open
            && self.session.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// 设备在当前代会话上是否已打开链路
    pub fn is_linked(&self, identity: &str) -> bool {
        self.identities
            .get(identity)
            .is_some_and(|a| a.linked_generation == Some(self.generation))
    }

    pub fn info(&self, slot: usize) -> SessionInfo {
        SessionInfo {
            slot,
            status: self.status,
            session_id: self.session.as_ref().map(|s| s.session_id().to_string()),
            generation: self.generation,
            identities: self.identities.keys().cloned().collect(),
            created_at: self.created_at,
            idle_seconds: self.idle_seconds(),
        }
    }
}

/// 单个会话槽位
pub(crate) struct SessionSlot {
    index: usize,
    pub(crate) state: Mutex<SlotState>,
}

impl SessionSlot {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            state: Mutex::new(SlotState::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub async fn info(&self) -> SessionInfo {
        self.state.lock().await.info(self.index)
    }
}
