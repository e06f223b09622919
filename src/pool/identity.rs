//! 设备身份

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::transport::Protocol;

/// 凭据作用域
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialScope {
    /// 设备级凭据：每个设备的链路单独认证
    #[default]
    Device,
    /// Hub 级凭据：连接只认证一次
    Hub,
}

impl fmt::Display for CredentialScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialScope::Device => write!(f, "设备级"),
            CredentialScope::Hub => write!(f, "Hub 级"),
        }
    }
}

/// 逻辑设备身份（不可变）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    id: String,
    scope: CredentialScope,
    protocol: Protocol,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, scope: CredentialScope, protocol: Protocol) -> Self {
        Self {
            id: id.into(),
            scope,
            protocol,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope(&self) -> CredentialScope {
        self.scope
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.protocol)
    }
}
