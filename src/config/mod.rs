//! 客户端配置
//!
//! TOML 文件加载，部分字段可由环境变量覆盖。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::logger::LoggerConfig;
use crate::pipeline::RetryPolicy;
use crate::pool::PoolConfig;
use crate::transport::Protocol;

/// 传输层配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub protocol: Protocol,
    pub hub_name: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::AmqpTcp,
            hub_name: "hublink".to_string(),
        }
    }
}

/// 演示程序使用的模拟设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub device_prefix: String,
    pub messages_per_device: usize,
    /// 故障注入类型，例如 `KillTcp`
    pub fault: String,
    pub fault_delay_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            device_prefix: "device".to_string(),
            messages_per_device: 3,
            fault: "KillTcp".to_string(),
            fault_delay_ms: 200,
        }
    }
}

/// 完整配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubClientConfig {
    pub transport: TransportConfig,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub logger: LoggerConfig,
    pub simulation: SimulationConfig,
}

impl HubClientConfig {
    /// 从 TOML 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: HubClientConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// 从文件加载，并使用环境变量覆盖
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(size) = var("HUBLINK_POOL_SIZE") {
            self.pool.pool_size = size
                .parse()
                .map_err(|_| ConfigError::ParseError(format!("HUBLINK_POOL_SIZE 无效: {size}")))?;
        }

        if let Some(timeout) = var("HUBLINK_OPERATION_TIMEOUT_MS") {
            self.retry.operation_timeout_ms = timeout.parse().map_err(|_| {
                ConfigError::ParseError(format!("HUBLINK_OPERATION_TIMEOUT_MS 无效: {timeout}"))
            })?;
        }

        if let Some(level) = var("HUBLINK_LOG_LEVEL") {
            self.logger.level = level;
        }

        Ok(())
    }

    /// 保存到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if self.retry.operation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "operation_timeout_ms 必须 > 0".to_string(),
            ));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::ValidationError(
                "max_attempts 必须 >= 1".to_string(),
            ));
        }
        if self.pool.pool_size > 1 && !self.transport.protocol.supports_multiplexing() {
            return Err(ConfigError::ValidationError(format!(
                "{} 不支持连接复用，pool_size 只能为 1",
                self.transport.protocol
            )));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        self.retry.operation_timeout()
    }
}

/// 配置错误
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO 错误: {0}")]
    IoError(String),

    #[error("解析错误: {0}")]
    ParseError(String),

    #[error("序列化错误: {0}")]
    SerializeError(String),

    #[error("验证错误: {0}")]
    ValidationError(String),
}
