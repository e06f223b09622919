//! 设备到云消息客户端
//!
//! 错误分类处理器链与带故障恢复的连接池。

pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod pipeline;
pub mod pool;
pub mod simulator;
pub mod transport;
