//! 连接池相关的类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::identity::CredentialScope;
use super::placement::PlacementPolicy;
use crate::transport::{HubError, Protocol, TransportError};

/// 会话槽位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// 尚未建立连接
    Empty,
    /// 连接可用
    Open,
    /// 连接故障，等待重建
    Faulted,
    /// 正在重建
    Rebuilding,
    /// 已关闭
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Empty => write!(f, "未连接"),
            SessionStatus::Open => write!(f, "已打开"),
            SessionStatus::Faulted => write!(f, "故障"),
            SessionStatus::Rebuilding => write!(f, "重建中"),
            SessionStatus::Closed => write!(f, "已关闭"),
        }
    }
}

/// 连接池配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 物理连接数上限
    pub pool_size: usize,

    /// 预计附加的设备数
    pub devices_count: usize,

    /// 凭据作用域
    pub credential_scope: CredentialScope,

    /// 放置策略
    pub placement: PlacementPolicy,

    /// 空槽位的懒关闭阈值（秒）
    pub idle_teardown_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            devices_count: 1,
            credential_scope: CredentialScope::Device,
            placement: PlacementPolicy::RoundRobin,
            idle_teardown_secs: 60,
        }
    }
}

impl PoolConfig {
    pub fn new(pool_size: usize, devices_count: usize) -> Self {
        Self {
            pool_size,
            devices_count,
            ..Default::default()
        }
    }

    pub fn with_scope(mut self, scope: CredentialScope) -> Self {
        self.credential_scope = scope;
        self
    }

    pub fn with_placement(mut self, placement: PlacementPolicy) -> Self {
        self.placement = placement;
        self
    }

    /// 实际使用的槽位数：min(pool_size, devices_count)
    pub fn effective_size(&self) -> usize {
        self.pool_size.min(self.devices_count).max(1)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.pool_size == 0 {
            return Err(PoolError::InvalidConfig("pool_size 必须 >= 1".to_string()));
        }
        if self.devices_count == 0 {
            return Err(PoolError::InvalidConfig(
                "devices_count 必须 >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// 连接池事件
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// 设备附加到槽位
    IdentityAttached { identity: String, slot: usize },

    /// 设备从槽位移除
    IdentityDetached { identity: String, slot: usize },

    /// 会话建立（含重建）
    SessionOpened {
        slot: usize,
        generation: u64,
        session_id: String,
    },

    /// 会话故障
    SessionFaulted { slot: usize, generation: u64 },

    /// 开始重建
    RebuildStarted { slot: usize },

    /// 重建失败
    RebuildFailed { slot: usize, error: String },

    /// 会话关闭
    SessionClosed { slot: usize },
}

/// 连接池错误
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("连接池配置无效: {0}")]
    InvalidConfig(String),

    #[error("协议不匹配: 连接池为 {expected}，设备为 {actual}")]
    ProtocolMismatch { expected: Protocol, actual: Protocol },

    #[error("凭据作用域不匹配: 连接池为 {expected}，设备为 {actual}")]
    CredentialScopeMismatch {
        expected: CredentialScope,
        actual: CredentialScope,
    },

    #[error("槽位 {slot} 已满（上限 {limit}）")]
    SessionFull { slot: usize, limit: usize },

    #[error("设备未附加: {0}")]
    NotAttached(String),

    #[error("连接池已关闭")]
    ShutDown,
}

impl From<PoolError> for TransportError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::ShutDown => HubError::Disposed(err.to_string()).into(),
            other => TransportError::wrap("连接池错误", other),
        }
    }
}

/// 槽位快照
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub slot: usize,
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub generation: u64,
    pub identities: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub idle_seconds: i64,
}
