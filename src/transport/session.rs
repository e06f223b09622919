//! 物理会话与单设备传输的 trait 定义

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::TransportError;
use super::message::Message;
use super::protocol::Protocol;
use crate::pool::{CredentialScope, DeviceIdentity};

/// 云到设备消息的处置方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 确认完成，消息从队列删除
    Complete,
    /// 放弃，消息重新入队
    Abandon,
    /// 拒绝，消息进入死信
    Reject,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Disposition::Complete => "complete",
            Disposition::Abandon => "abandon",
            Disposition::Reject => "reject",
        };
        f.write_str(s)
    }
}

/// 建立物理连接时使用的认证上下文
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Hub 名称
    pub hub_name: String,

    /// 凭据作用域：Hub 级凭据在连接上认证一次，设备级凭据在每条链路上认证
    pub scope: CredentialScope,

    /// 所属连接池槽位
    pub slot: usize,
}

/// 一条物理连接（一个协议）
///
/// 任意调用都可能随时失败；失败以传输层原始错误返回，由上层分类。
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// 会话 ID
    fn session_id(&self) -> &str;

    /// 会话协议
    fn protocol(&self) -> Protocol;

    /// 物理连接是否已断开
    fn is_closed(&self) -> bool;

    /// 为设备打开链路
    async fn open_link(&self, identity: &DeviceIdentity) -> Result<(), TransportError>;

    /// 关闭设备链路
    async fn close_link(&self, identity: &DeviceIdentity) -> Result<(), TransportError>;

    /// 发送一条或一批设备到云消息
    async fn send(
        &self,
        identity: &DeviceIdentity,
        messages: &[Message],
    ) -> Result<(), TransportError>;

    /// 接收一条云到设备消息，超时返回 `None`
    async fn receive(
        &self,
        identity: &DeviceIdentity,
        timeout: Duration,
    ) -> Result<Option<Message>, TransportError>;

    /// 处置已接收的消息
    async fn dispose(
        &self,
        identity: &DeviceIdentity,
        lock_token: &str,
        disposition: Disposition,
    ) -> Result<(), TransportError>;

    /// 关闭物理连接
    async fn close(&self) -> Result<(), TransportError>;
}

/// 物理连接工厂
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        protocol: Protocol,
        auth: &AuthContext,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// 绑定到单个设备身份的传输
///
/// 管道最内层的处理器，所有操作都接受取消令牌。
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    async fn send_event(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    async fn send_events(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    async fn receive(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, TransportError>;

    async fn complete(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    async fn abandon(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    async fn reject(
        &self,
        lock_token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    async fn close(&self, cancel: &CancellationToken) -> Result<(), TransportError>;
}
