//! 设备到槽位的放置策略

use serde::{Deserialize, Serialize};

/// 放置策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicy {
    /// 按附加顺序轮询
    #[default]
    RoundRobin,
    /// 设备 ID 的稳定哈希取模
    Hash,
}

impl PlacementPolicy {
    /// 计算槽位下标。`loads` 为各槽位当前附加的设备数
    ///
    /// 轮询放到负载最小的槽位（并列取下标最小者），设备移除后空出的位置会被优先补上；
    /// 哈希与负载无关。
    pub fn place(&self, identity: &str, loads: &[usize]) -> usize {
        let size = loads.len().max(1);
        match self {
            PlacementPolicy::RoundRobin => loads
                .iter()
                .enumerate()
                .min_by_key(|(index, load)| (**load, *index))
                .map(|(index, _)| index)
                .unwrap_or(0),
            PlacementPolicy::Hash => (fnv1a(identity.as_bytes()) % size as u64) as usize,
        }
    }
}

/// FNV-1a 64 位哈希，跨进程稳定
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}
