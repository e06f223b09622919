//! 模拟会话
//!
//! 所有失败都经由协议错误映射产生，与真实协议栈给出的原始错误形态一致。

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::fault::{FaultInjection, FaultType};
use super::hub::{HubShared, MAX_MESSAGE_BYTES};
use crate::pool::{CredentialScope, DeviceIdentity};
use crate::transport::protocol::{amqp_error, connection_closed_error, service_error};
use crate::transport::{Disposition, Message, Protocol, ServiceCode, TransportError, TransportSession};

pub struct SimulatedSession {
    id: String,
    protocol: Protocol,
    scope: CredentialScope,
    hub: Arc<HubShared>,
    closed: CancellationToken,
    close_reason: Mutex<Option<String>>,
    links: Mutex<HashSet<String>>,
    me: Weak<SimulatedSession>,
}

impl SimulatedSession {
    pub(crate) fn new(protocol: Protocol, scope: CredentialScope, hub: Arc<HubShared>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: Uuid::new_v4().to_string(),
            protocol,
            scope,
            hub,
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            links: Mutex::new(HashSet::new()),
            me: me.clone(),
        })
    }

    fn links(&self) -> MutexGuard<'_, HashSet<String>> {
        self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn scope(&self) -> CredentialScope {
        self.scope
    }

    pub fn has_link(&self, device: &str) -> bool {
        self.links().contains(device)
    }

    /// 服务端断开整条连接
    pub fn kill(&self, reason: &str) {
        {
            let mut close_reason = self
                .close_reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if close_reason.is_none() {
                *close_reason = Some(reason.to_string());
            }
        }
        self.links().clear();
        self.closed.cancel();
        info!("模拟会话 {} 被断开: {}", self.id, reason);
    }

    /// 延迟之后对本会话施加故障
    pub fn schedule_fault(&self, device: &str, injection: FaultInjection) {
        let Some(session) = self.me.upgrade() else {
            return;
        };
        let device = device.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(injection.delay).await;
            session.apply_fault(&device, &injection);
        });
    }

    fn apply_fault(&self, device: &str, injection: &FaultInjection) {
        match injection.fault_type {
            t if t.kills_connection() => self.kill(&injection.reason),
            FaultType::AmqpSession if self.protocol.is_amqp() => {
                self.links().clear();
                info!("模拟会话 {} 的 AMQP 会话被关闭: {}", self.id, injection.reason);
            }
            FaultType::AmqpD2CLink if self.protocol.is_amqp() => {
                self.links().remove(device);
                info!("设备 {} 的设备到云链路被关闭: {}", device, injection.reason);
            }
            t if t.is_service_condition() => {
                self.hub.apply_condition(device, t, injection.duration)
            }
            // 非 AMQP 协议没有独立的会话/链路，退化为断开连接
            _ => self.kill(&injection.reason),
        }
    }

    fn closed_error(&self) -> TransportError {
        let reason = self
            .close_reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| "closed".to_string());
        connection_closed_error(self.protocol, &reason)
    }

    fn condition_error(&self, fault_type: FaultType) -> Option<TransportError> {
        let code = match fault_type {
            FaultType::Throttle => ServiceCode::Throttled,
            FaultType::QuotaExceeded => ServiceCode::QuotaExceeded,
            FaultType::Auth => ServiceCode::Unauthorized,
            _ => return None,
        };
        Some(service_error(self.protocol, code, fault_type.as_str()))
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    /// 连接可用、链路已打开且设备没有生效中的服务端故障
    fn ensure_usable(&self, device: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.has_link(device) {
            return Err(if self.protocol.is_amqp() {
                amqp_error("amqp:link:detach-forced", "link is not attached")
            } else {
                connection_closed_error(self.protocol, "link is not attached")
            });
        }
        match self.hub.active_condition(device).and_then(|t| self.condition_error(t)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TransportSession for SimulatedSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn open_link(&self, identity: &DeviceIdentity) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.hub.is_registered(identity.id()) {
            return Err(service_error(
                self.protocol,
                ServiceCode::DeviceNotFound,
                identity.id(),
            ));
        }
        if let Some(err) = self
            .hub
            .active_condition(identity.id())
            .and_then(|t| self.condition_error(t))
        {
            return Err(err);
        }
        self.links().insert(identity.id().to_string());
        debug!("模拟会话 {} 打开设备 {} 链路", self.id, identity);
        Ok(())
    }

    async fn close_link(&self, identity: &DeviceIdentity) -> Result<(), TransportError> {
        self.links().remove(identity.id());
        Ok(())
    }

    async fn send(
        &self,
        identity: &DeviceIdentity,
        messages: &[Message],
    ) -> Result<(), TransportError> {
        self.ensure_usable(identity.id())?;

        if let Some(large) = messages.iter().find(|m| m.wire_size() > MAX_MESSAGE_BYTES) {
            return Err(service_error(
                self.protocol,
                ServiceCode::MessageTooLarge,
                &format!("{} 字节超出上限 {}", large.wire_size(), MAX_MESSAGE_BYTES),
            ));
        }

        let mut telemetry = Vec::with_capacity(messages.len());
        for message in messages {
            match FaultInjection::from_message(message) {
                Some(injection) => {
                    debug!("设备 {} 请求故障注入: {:?}", identity, injection);
                    self.schedule_fault(identity.id(), injection);
                }
                None => telemetry.push(message.clone()),
            }
        }
        if !telemetry.is_empty() {
            self.hub.record_telemetry(identity.id(), &telemetry);
        }
        Ok(())
    }

    async fn receive(
        &self,
        identity: &DeviceIdentity,
        timeout: Duration,
    ) -> Result<Option<Message>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_usable(identity.id())?;
            let notify = self.hub.c2d_notify(identity.id()).ok_or_else(|| {
                service_error(self.protocol, ServiceCode::DeviceNotFound, identity.id())
            })?;
            let notified = notify.notified();

            if let Some(message) = self.hub.take_cloud_to_device(identity.id()) {
                return Ok(Some(message));
            }

            tokio::select! {
                _ = self.closed.cancelled() => return Err(self.closed_error()),
                woke = tokio::time::timeout_at(deadline, notified) => {
                    if woke.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn dispose(
        &self,
        identity: &DeviceIdentity,
        lock_token: &str,
        disposition: Disposition,
    ) -> Result<(), TransportError> {
        self.ensure_usable(identity.id())?;
        if self.hub.dispose(identity.id(), lock_token, disposition) {
            Ok(())
        } else {
            Err(service_error(
                self.protocol,
                ServiceCode::MessageLockLost,
                &format!("{disposition} {lock_token}"),
            ))
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.links().clear();
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedHub;
    use crate::transport::{AuthContext, HubError, SessionConnector};

    async fn linked_session(
        protocol: Protocol,
    ) -> (SimulatedHub, Arc<dyn TransportSession>, DeviceIdentity) {
        let hub = SimulatedHub::new("test-hub");
        hub.register_device("d0");
        let identity = DeviceIdentity::new("d0", CredentialScope::Device, protocol);
        let session = hub
            .connect(
                protocol,
                &AuthContext {
                    hub_name: "test-hub".into(),
                    scope: CredentialScope::Device,
                    slot: 0,
                },
            )
            .await
            .unwrap();
        session.open_link(&identity).await.unwrap();
        (hub, session, identity)
    }

    #[tokio::test]
    async fn test_trigger_message_kills_connection_after_delay() {
        let (hub, session, identity) = linked_session(Protocol::AmqpTcp).await;
        let trigger = FaultInjection::new(FaultType::Tcp).with_delay(Duration::from_millis(20));

        session
            .send(&identity, &[trigger.to_message()])
            .await
            .unwrap();
        assert!(hub.received_messages("d0").is_empty());
        assert!(!session.is_closed());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(session.is_closed());
        let err = session
            .send(&identity, &[Message::new("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[tokio::test]
    async fn test_d2c_link_fault_keeps_connection() {
        let (hub, session, identity) = linked_session(Protocol::AmqpWebSocket).await;
        hub.inject(
            "d0",
            FaultInjection::new(FaultType::AmqpD2CLink).with_delay(Duration::ZERO),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!session.is_closed());
        let err = session
            .send(&identity, &[Message::new("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));

        session.open_link(&identity).await.unwrap();
        session.send(&identity, &[Message::new("x")]).await.unwrap();
    }

    #[tokio::test]
    async fn test_throttle_condition_expires() {
        let (hub, session, identity) = linked_session(Protocol::MqttTcp).await;
        hub.inject(
            "d0",
            FaultInjection::new(FaultType::Throttle)
                .with_delay(Duration::ZERO)
                .with_duration(Duration::from_millis(100)),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = session
            .send(&identity, &[Message::new("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Hub(HubError::Throttled(_))));

        tokio::time::sleep(Duration::from_millis(150)).await;
        session.send(&identity, &[Message::new("x")]).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let (_hub, session, identity) = linked_session(Protocol::Http).await;
        let big = Message::new(vec![0u8; MAX_MESSAGE_BYTES + 1]);

        let err = session.send(&identity, &[big]).await.unwrap_err();
        assert!(matches!(err, TransportError::Hub(HubError::MessageTooLarge(_))));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let (_hub, session, identity) = linked_session(Protocol::AmqpTcp).await;

        let receiver = {
            let session = session.clone();
            let identity = identity.clone();
            tokio::spawn(async move { session.receive(&identity, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close().await.unwrap();

        assert!(receiver.await.unwrap().is_err());
    }
}
