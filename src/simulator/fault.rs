//! 故障注入请求
//!
//! 故障注入请求是一条普通的设备到云消息，用应用属性描述故障类型、
//! 关闭原因、延迟与持续时间。模拟 Hub 收到后在延迟之后使连接降级。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::transport::Message;

/// 默认延迟（秒）
pub const DEFAULT_DELAY_SECS: u64 = 1;
/// 默认持续时间（秒）
pub const DEFAULT_DURATION_SECS: u64 = 10;
/// 关闭原因
pub const CLOSE_REASON_BOOM: &str = "boom";
pub const CLOSE_REASON_BYEBYE: &str = "byebye";

const PROP_FAULT_TYPE: &str = "fault-type";
const PROP_REASON: &str = "fault-reason";
const PROP_DELAY_MS: &str = "fault-delay-ms";
const PROP_DURATION_MS: &str = "fault-duration-ms";

/// 故障类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultType {
    /// 断开 TCP 连接
    Tcp,
    /// 关闭 AMQP 连接
    AmqpConnection,
    /// 关闭 AMQP 会话（该会话上所有链路失效）
    AmqpSession,
    /// 关闭设备到云链路
    AmqpD2CLink,
    /// 限流
    Throttle,
    /// 超出配额
    QuotaExceeded,
    /// 认证失败
    Auth,
    /// AMQP 优雅关闭
    GracefulShutdownAmqp,
    /// MQTT 优雅关闭
    GracefulShutdownMqtt,
}

impl FaultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultType::Tcp => "KillTcp",
            FaultType::AmqpConnection => "KillAmqpConnection",
            FaultType::AmqpSession => "KillAmqpSession",
            FaultType::AmqpD2CLink => "KillAmqpD2CLink",
            FaultType::Throttle => "InvokeThrottling",
            FaultType::QuotaExceeded => "InvokeMaxMessageQuota",
            FaultType::Auth => "InvokeAuthError",
            FaultType::GracefulShutdownAmqp => "ShutDownAmqp",
            FaultType::GracefulShutdownMqtt => "ShutDownMqtt",
        }
    }

    /// 断开整条物理连接
    pub fn kills_connection(&self) -> bool {
        matches!(
            self,
            FaultType::Tcp
                | FaultType::AmqpConnection
                | FaultType::GracefulShutdownAmqp
                | FaultType::GracefulShutdownMqtt
        )
    }

    /// 在持续时间内对设备的后续操作返回服务端错误
    pub fn is_service_condition(&self) -> bool {
        matches!(
            self,
            FaultType::Throttle | FaultType::QuotaExceeded | FaultType::Auth
        )
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fault = match s {
            "KillTcp" => FaultType::Tcp,
            "KillAmqpConnection" => FaultType::AmqpConnection,
            "KillAmqpSession" => FaultType::AmqpSession,
            "KillAmqpD2CLink" => FaultType::AmqpD2CLink,
            "InvokeThrottling" => FaultType::Throttle,
            "InvokeMaxMessageQuota" => FaultType::QuotaExceeded,
            "InvokeAuthError" => FaultType::Auth,
            "ShutDownAmqp" => FaultType::GracefulShutdownAmqp,
            "ShutDownMqtt" => FaultType::GracefulShutdownMqtt,
            other => return Err(format!("未知的故障类型: {other}")),
        };
        Ok(fault)
    }
}

/// 故障注入请求
#[derive(Debug, Clone, PartialEq)]
pub struct FaultInjection {
    pub fault_type: FaultType,
    pub reason: String,
    pub delay: Duration,
    pub duration: Duration,
}

impl FaultInjection {
    pub fn new(fault_type: FaultType) -> Self {
        Self {
            fault_type,
            reason: CLOSE_REASON_BOOM.to_string(),
            delay: Duration::from_secs(DEFAULT_DELAY_SECS),
            duration: Duration::from_secs(DEFAULT_DURATION_SECS),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// 编码为触发消息
    pub fn to_message(&self) -> Message {
        Message::empty()
            .with_property(PROP_FAULT_TYPE, self.fault_type.as_str())
            .with_property(PROP_REASON, self.reason.clone())
            .with_property(PROP_DELAY_MS, self.delay.as_millis().to_string())
            .with_property(PROP_DURATION_MS, self.duration.as_millis().to_string())
    }

    /// 从消息解码；不是触发消息时返回 `None`
    pub fn from_message(message: &Message) -> Option<Self> {
        let fault_type = message.property(PROP_FAULT_TYPE)?.parse().ok()?;
        let millis = |key: &str, default_secs: u64| {
            message
                .property(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(default_secs))
        };

        Some(Self {
            fault_type,
            reason: message
                .property(PROP_REASON)
                .unwrap_or(CLOSE_REASON_BOOM)
                .to_string(),
            delay: millis(PROP_DELAY_MS, DEFAULT_DELAY_SECS),
            duration: millis(PROP_DURATION_MS, DEFAULT_DURATION_SECS),
        })
    }
}
