//! 传输协议与协议原生错误映射
//!
//! AMQP 的错误条件、MQTT 的 CONNACK 返回码、HTTP 状态码各不相同，
//! 这里把它们统一映射到同一组原始错误形态，使同一个服务端故障
//! 无论经由哪种协议到达，都会被分类成同一种故障。

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{HubError, TransportError};

/// AMQP 单连接上允许复用的最大设备数
pub const AMQP_MAX_FAN_OUT: usize = 995;

/// 传输协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    AmqpTcp,
    #[serde(rename = "amqp_ws")]
    AmqpWebSocket,
    MqttTcp,
    #[serde(rename = "mqtt_ws")]
    MqttWebSocket,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::AmqpTcp => "amqp_tcp",
            Protocol::AmqpWebSocket => "amqp_ws",
            Protocol::MqttTcp => "mqtt_tcp",
            Protocol::MqttWebSocket => "mqtt_ws",
            Protocol::Http => "http",
        }
    }

    /// 是否为 AMQP 族协议
    pub fn is_amqp(&self) -> bool {
        matches!(self, Protocol::AmqpTcp | Protocol::AmqpWebSocket)
    }

    /// 是否为 MQTT 族协议
    pub fn is_mqtt(&self) -> bool {
        matches!(self, Protocol::MqttTcp | Protocol::MqttWebSocket)
    }

    /// 是否经由 WebSocket 承载
    pub fn is_websocket(&self) -> bool {
        matches!(self, Protocol::AmqpWebSocket | Protocol::MqttWebSocket)
    }

    /// 是否支持多设备复用同一物理连接
    pub fn supports_multiplexing(&self) -> bool {
        self.is_amqp()
    }

    /// 单个会话上允许附加的最大设备数
    pub fn max_fan_out(&self) -> usize {
        if self.supports_multiplexing() {
            AMQP_MAX_FAN_OUT
        } else {
            1
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 与协议无关的服务端故障代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCode {
    Unauthorized,
    DeviceNotFound,
    Throttled,
    QuotaExceeded,
    MessageTooLarge,
    MessageLockLost,
    ServerBusy,
}

impl ServiceCode {
    /// 对应的 AMQP 错误条件
    pub fn amqp_condition(&self) -> &'static str {
        match self {
            ServiceCode::Unauthorized => "amqp:unauthorized-access",
            ServiceCode::DeviceNotFound => "amqp:not-found",
            ServiceCode::Throttled => "com.microsoft:device-container-throttled",
            ServiceCode::QuotaExceeded => "amqp:resource-limit-exceeded",
            ServiceCode::MessageTooLarge => "amqp:link:message-size-exceeded",
            ServiceCode::MessageLockLost => "com.microsoft:message-lock-lost",
            ServiceCode::ServerBusy => "com.microsoft:server-busy",
        }
    }

    /// 对应的 HTTP 状态码
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceCode::Unauthorized => 401,
            ServiceCode::DeviceNotFound => 404,
            ServiceCode::Throttled => 429,
            ServiceCode::QuotaExceeded => 403,
            ServiceCode::MessageTooLarge => 413,
            ServiceCode::MessageLockLost => 412,
            ServiceCode::ServerBusy => 503,
        }
    }

    /// 对应的 MQTT CONNACK 返回码（MQTT 3.1.1 只能表达其中一部分）
    pub fn mqtt_return_code(&self) -> Option<u8> {
        match self {
            ServiceCode::Unauthorized => Some(5),
            ServiceCode::ServerBusy => Some(3),
            _ => None,
        }
    }
}

/// 按协议把服务端故障编码成该协议的原生错误，再映射回原始错误形态
pub fn service_error(protocol: Protocol, code: ServiceCode, description: &str) -> TransportError {
    if protocol.is_amqp() {
        return amqp_error(code.amqp_condition(), description);
    }
    if protocol.is_mqtt() {
        if let Some(rc) = code.mqtt_return_code() {
            return mqtt_connack_error(rc);
        }
        // MQTT 没有对应返回码的故障由服务端以应用层错误形式下发
        return hub_error_for(code, description).into();
    }
    http_status_error(code.http_status(), description)
}

/// 按协议构造“连接被关闭”错误
pub fn connection_closed_error(protocol: Protocol, reason: &str) -> TransportError {
    if protocol.is_websocket() {
        return TransportError::WebSocket(format!("连接已关闭: {reason}"));
    }
    match protocol {
        Protocol::AmqpTcp => amqp_error("amqp:connection:forced", reason),
        Protocol::Http => TransportError::Http(format!("连接已关闭: {reason}")),
        _ => TransportError::connection_closed(reason.to_string()),
    }
}

fn hub_error_for(code: ServiceCode, description: &str) -> HubError {
    let description = description.to_string();
    match code {
        ServiceCode::Unauthorized => HubError::Unauthorized(description),
        ServiceCode::DeviceNotFound => HubError::DeviceNotFound(description),
        ServiceCode::Throttled => HubError::Throttled(description),
        ServiceCode::QuotaExceeded => HubError::QuotaExceeded(description),
        ServiceCode::MessageTooLarge => HubError::MessageTooLarge(description),
        ServiceCode::MessageLockLost => HubError::MessageLockLost(description),
        ServiceCode::ServerBusy => HubError::ServerBusy(description),
    }
}

/// AMQP 错误条件 -> 原始错误
pub fn amqp_error(condition: &str, description: &str) -> TransportError {
    let detail = format!("{condition}: {description}");
    match condition {
        "amqp:unauthorized-access" => HubError::Unauthorized(detail).into(),
        "amqp:not-found" => HubError::DeviceNotFound(detail).into(),
        "amqp:resource-limit-exceeded" | "com.microsoft:iot-hub-quota-exceeded" => {
            HubError::QuotaExceeded(detail).into()
        }
        "amqp:link:message-size-exceeded" => HubError::MessageTooLarge(detail).into(),
        "com.microsoft:message-lock-lost" => HubError::MessageLockLost(detail).into(),
        "com.microsoft:server-busy" => HubError::ServerBusy(detail).into(),
        "com.microsoft:device-container-throttled" | "com.microsoft:iot-hub-throttled" => {
            HubError::Throttled(detail).into()
        }
        "amqp:internal-error" => HubError::Service {
            message: detail,
            transient: true,
        }
        .into(),
        "amqp:connection:forced" | "amqp:link:detach-forced" | "amqp:session:unattached-handle" => {
            TransportError::connection_closed(detail)
        }
        "amqp:connection:framing-error" | "amqp:decode-error" => TransportError::Codec(detail),
        _ => TransportError::other(detail),
    }
}

/// MQTT CONNACK 返回码 -> 原始错误
pub fn mqtt_connack_error(return_code: u8) -> TransportError {
    match return_code {
        1 => HubError::Service {
            message: "不支持的协议版本".to_string(),
            transient: false,
        }
        .into(),
        2 => HubError::Unauthorized("客户端标识被拒绝".to_string()).into(),
        3 => HubError::ServerBusy("服务不可用".to_string()).into(),
        4 => HubError::Unauthorized("用户名或密码错误".to_string()).into(),
        5 => HubError::Unauthorized("未授权".to_string()).into(),
        other => TransportError::other(format!("未知的 CONNACK 返回码: {other}")),
    }
}

/// HTTP 状态码 -> 原始错误
pub fn http_status_error(status: u16, body: &str) -> TransportError {
    let detail = format!("HTTP {status}: {body}");
    match status {
        401 => HubError::Unauthorized(detail).into(),
        403 => HubError::QuotaExceeded(detail).into(),
        404 => HubError::DeviceNotFound(detail).into(),
        412 => HubError::MessageLockLost(detail).into(),
        413 => HubError::MessageTooLarge(detail).into(),
        429 => HubError::Throttled(detail).into(),
        503 => HubError::ServerBusy(detail).into(),
        500..=599 => HubError::Service {
            message: detail,
            transient: true,
        }
        .into(),
        400..=499 => HubError::Service {
            message: detail,
            transient: false,
        }
        .into(),
        _ => TransportError::Http(detail),
    }
}
