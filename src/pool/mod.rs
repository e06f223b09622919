//! 连接池模块
//!
//! 多个逻辑设备共享有限数量的已认证物理连接，每个槽位独立恢复。

mod identity;
mod manager;
mod placement;
mod pooled;
mod slot;
mod types;

pub use identity::{CredentialScope, DeviceIdentity};
pub use manager::{ConnectionPoolManager, Lease};
pub use placement::PlacementPolicy;
pub use pooled::PooledTransport;
pub use types::{PoolConfig, PoolError, PoolEvent, SessionInfo, SessionStatus};
