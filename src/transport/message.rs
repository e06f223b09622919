//! 设备到云 / 云到设备消息

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 单条消息
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// 消息 ID
    pub message_id: String,

    /// 消息体
    pub payload: Bytes,

    /// 应用属性
    pub properties: BTreeMap<String, String>,

    /// 云到设备消息的锁令牌（接收后由服务端分配）
    pub lock_token: Option<String>,

    /// 创建时间
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// 创建新消息
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            payload: payload.into(),
            properties: BTreeMap::new(),
            lock_token: None,
            created_at: Utc::now(),
        }
    }

    /// 空消息体
    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }

    /// 将可序列化对象编码为 JSON 消息体
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(body))
    }

    /// 解码 JSON 消息体
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// 设置消息 ID
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// 添加应用属性
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// 读取应用属性
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// 消息体按 UTF-8 解码（用于日志与校验）
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// 估算线上大小：消息体 + 属性键值
    pub fn wire_size(&self) -> usize {
        self.payload.len()
            + self
                .properties
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}
