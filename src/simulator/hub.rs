//! 内存中的模拟 IoT Hub
//!
//! 作为 `SessionConnector` 使用：每次 `connect` 产生一个新的模拟会话。
//! 记录每个设备收到的遥测、维护云到设备队列（锁令牌、放弃、死信），
//! 并按故障注入请求使连接、会话或链路降级。

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::fault::{FaultInjection, FaultType};
use super::session::SimulatedSession;
use crate::pool::CredentialScope;
use crate::transport::{
    AuthContext, Disposition, HubError, Message, Protocol, SessionConnector, TransportError,
    TransportSession,
};

/// 单条消息大小上限
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

struct ActiveCondition {
    fault_type: FaultType,
    until: Instant,
}

#[derive(Default)]
struct DeviceState {
    telemetry: Vec<Message>,
    cloud_to_device: VecDeque<Message>,
    locked: HashMap<String, Message>,
    dead_lettered: Vec<Message>,
    conditions: Vec<ActiveCondition>,
    telemetry_notify: Arc<Notify>,
    c2d_notify: Arc<Notify>,
}

#[derive(Default)]
struct HubState {
    devices: HashMap<String, DeviceState>,
    sessions: Vec<Weak<SimulatedSession>>,
    hub_credentials_revoked: bool,
}

/// 会话与 Hub 共享的状态
pub(crate) struct HubShared {
    name: String,
    state: Mutex<HubState>,
    connects: AtomicUsize,
    connect_latency: Mutex<Duration>,
}

impl HubShared {
    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn is_registered(&self, device: &str) -> bool {
        self.state().devices.contains_key(device)
    }

    /// 设备当前生效的服务端故障（顺带清理已过期的）
    pub(crate) fn active_condition(&self, device: &str) -> Option<FaultType> {
        let mut state = self.state();
        let entry = state.devices.get_mut(device)?;
        let now = Instant::now();
        entry.conditions.retain(|c| c.until > now);
        entry.conditions.last().map(|c| c.fault_type)
    }

    pub(crate) fn apply_condition(&self, device: &str, fault_type: FaultType, duration: Duration) {
        let mut state = self.state();
        if let Some(entry) = state.devices.get_mut(device) {
            entry.conditions.push(ActiveCondition {
                fault_type,
                until: Instant::now() + duration,
            });
            info!("设备 {} 注入故障 {}，持续 {:?}", device, fault_type, duration);
        }
    }

    pub(crate) fn record_telemetry(&self, device: &str, messages: &[Message]) -> bool {
        let mut state = self.state();
        let Some(entry) = state.devices.get_mut(device) else {
            return false;
        };
        entry.telemetry.extend(messages.iter().cloned());
        entry.telemetry_notify.notify_waiters();
        true
    }

    pub(crate) fn c2d_notify(&self, device: &str) -> Option<Arc<Notify>> {
        self.state()
            .devices
            .get(device)
            .map(|entry| entry.c2d_notify.clone())
    }

    /// 取出一条云到设备消息并加锁
    pub(crate) fn take_cloud_to_device(&self, device: &str) -> Option<Message> {
        let mut state = self.state();
        let entry = state.devices.get_mut(device)?;
        let mut message = entry.cloud_to_device.pop_front()?;
        let lock_token = Uuid::new_v4().to_string();
        message.lock_token = Some(lock_token.clone());
        entry.locked.insert(lock_token, message.clone());
        Some(message)
    }

    /// 处置已加锁的消息，锁不存在时返回 `false`
    pub(crate) fn dispose(&self, device: &str, lock_token: &str, disposition: Disposition) -> bool {
        let mut state = self.state();
        let Some(entry) = state.devices.get_mut(device) else {
            return false;
        };
        let Some(mut message) = entry.locked.remove(lock_token) else {
            return false;
        };
        match disposition {
            Disposition::Complete => {}
            Disposition::Abandon => {
                message.lock_token = None;
                entry.cloud_to_device.push_front(message);
                entry.c2d_notify.notify_waiters();
            }
            Disposition::Reject => entry.dead_lettered.push(message),
        }
        true
    }
}

/// 模拟 IoT Hub
#[derive(Clone)]
pub struct SimulatedHub {
    shared: Arc<HubShared>,
}

impl SimulatedHub {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(HubShared {
                name: name.into(),
                state: Mutex::new(HubState::default()),
                connects: AtomicUsize::new(0),
                connect_latency: Mutex::new(Duration::ZERO),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 每次建立连接的模拟耗时
    pub fn set_connect_latency(&self, latency: Duration) {
        *self
            .shared
            .connect_latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = latency;
    }

    fn connect_latency(&self) -> Duration {
        *self
            .shared
            .connect_latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 注册设备（幂等）
    pub fn register_device(&self, device: &str) {
        self.shared
            .state()
            .devices
            .entry(device.to_string())
            .or_default();
    }

    /// 累计建立的连接数
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// 当前未关闭的会话数
    pub fn live_sessions(&self) -> usize {
        self.sessions().iter().filter(|s| !s.is_closed()).count()
    }

    fn sessions(&self) -> Vec<Arc<SimulatedSession>> {
        let mut state = self.shared.state();
        state.sessions.retain(|s| s.strong_count() > 0);
        state.sessions.iter().filter_map(Weak::upgrade).collect()
    }

    /// 吊销（或恢复）Hub 级凭据；吊销后 Hub 级连接认证失败
    pub fn set_hub_credentials_revoked(&self, revoked: bool) {
        self.shared.state().hub_credentials_revoked = revoked;
    }

    /// 向设备发送云到设备消息
    pub fn send_cloud_to_device(&self, device: &str, message: Message) -> Result<(), HubError> {
        let mut state = self.shared.state();
        let entry = state
            .devices
            .get_mut(device)
            .ok_or_else(|| HubError::DeviceNotFound(device.to_string()))?;
        entry.cloud_to_device.push_back(message);
        entry.c2d_notify.notify_waiters();
        Ok(())
    }

    /// 设备已送达的遥测
    pub fn received_messages(&self, device: &str) -> Vec<Message> {
        self.shared
            .state()
            .devices
            .get(device)
            .map(|entry| entry.telemetry.clone())
            .unwrap_or_default()
    }

    pub fn dead_lettered(&self, device: &str) -> Vec<Message> {
        self.shared
            .state()
            .devices
            .get(device)
            .map(|entry| entry.dead_lettered.clone())
            .unwrap_or_default()
    }

    /// 排队中（未加锁）的云到设备消息数
    pub fn pending_cloud_to_device(&self, device: &str) -> usize {
        self.shared
            .state()
            .devices
            .get(device)
            .map(|entry| entry.cloud_to_device.len())
            .unwrap_or(0)
    }

    /// 等待指定消息送达
    pub async fn wait_for_message(&self, device: &str, message_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = {
                let state = self.shared.state();
                match state.devices.get(device) {
                    Some(entry) => entry.telemetry_notify.clone(),
                    None => return false,
                }
            };
            let notified = notify.notified();
            if self
                .received_messages(device)
                .iter()
                .any(|m| m.message_id == message_id)
            {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// 直接注入故障（不经过触发消息），作用于设备已打开链路的所有会话
    pub fn inject(&self, device: &str, injection: FaultInjection) {
        if injection.fault_type.is_service_condition() {
            let shared = self.shared.clone();
            let device = device.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(injection.delay).await;
                shared.apply_condition(&device, injection.fault_type, injection.duration);
            });
            return;
        }
        for session in self.sessions() {
            if session.has_link(device) {
                session.schedule_fault(device, injection.clone());
            }
        }
    }

    /// 断开所有连接
    pub fn drop_all_connections(&self) {
        for session in self.sessions() {
            session.kill("connection dropped");
        }
    }
}

#[async_trait]
impl SessionConnector for SimulatedHub {
    async fn connect(
        &self,
        protocol: Protocol,
        auth: &AuthContext,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let latency = self.connect_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let count = self.shared.connects.fetch_add(1, Ordering::SeqCst) + 1;

        if auth.scope == CredentialScope::Hub && self.shared.state().hub_credentials_revoked {
            return Err(TransportError::wrap(
                "建立连接失败",
                TransportError::Authentication(format!("{} 的 Hub 级凭据已吊销", auth.hub_name)),
            ));
        }

        let session = SimulatedSession::new(protocol, auth.scope, self.shared.clone());
        self.shared.state().sessions.push(Arc::downgrade(&session));
        debug!(
            "模拟 Hub {} 接受第 {} 个连接: 协议={}, 槽位={}",
            self.shared.name, count, protocol, auth.slot
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DeviceIdentity;

    fn auth(scope: CredentialScope) -> AuthContext {
        AuthContext {
            hub_name: "test-hub".into(),
            scope,
            slot: 0,
        }
    }

    #[tokio::test]
    async fn test_cloud_to_device_lifecycle() {
        let hub = SimulatedHub::new("test-hub");
        hub.register_device("d0");
        let identity = DeviceIdentity::new("d0", CredentialScope::Device, Protocol::AmqpTcp);
        let session = hub
            .connect(Protocol::AmqpTcp, &auth(CredentialScope::Device))
            .await
            .unwrap();
        session.open_link(&identity).await.unwrap();

        hub.send_cloud_to_device("d0", Message::new("one")).unwrap();
        hub.send_cloud_to_device("d0", Message::new("two")).unwrap();

        let first = session
            .receive(&identity, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        let token = first.lock_token.clone().unwrap();
        session
            .dispose(&identity, &token, Disposition::Abandon)
            .await
            .unwrap();
        assert_eq!(hub.pending_cloud_to_device("d0"), 2);

        let again = session
            .receive(&identity, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.payload_str(), Some("one"));
        let token = again.lock_token.clone().unwrap();
        session
            .dispose(&identity, &token, Disposition::Reject)
            .await
            .unwrap();
        assert_eq!(hub.dead_lettered("d0").len(), 1);

        // 同一个锁令牌不能处置两次
        let err = session
            .dispose(&identity, &token, Disposition::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Hub(HubError::MessageLockLost(_))));
    }

    #[tokio::test]
    async fn test_receive_times_out_with_none() {
        let hub = SimulatedHub::new("test-hub");
        hub.register_device("d0");
        let identity = DeviceIdentity::new("d0", CredentialScope::Device, Protocol::MqttTcp);
        let session = hub
            .connect(Protocol::MqttTcp, &auth(CredentialScope::Device))
            .await
            .unwrap();
        session.open_link(&identity).await.unwrap();

        let received = session
            .receive(&identity, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_unknown_device_is_rejected() {
        let hub = SimulatedHub::new("test-hub");
        let identity = DeviceIdentity::new("ghost", CredentialScope::Device, Protocol::Http);
        let session = hub
            .connect(Protocol::Http, &auth(CredentialScope::Device))
            .await
            .unwrap();

        let err = session.open_link(&identity).await.unwrap_err();
        assert!(matches!(err, TransportError::Hub(HubError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_revoked_hub_credentials() {
        let hub = SimulatedHub::new("test-hub");
        hub.set_hub_credentials_revoked(true);

        let err = hub
            .connect(Protocol::AmqpTcp, &auth(CredentialScope::Hub))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Other { .. }));
        assert!(
            hub.connect(Protocol::AmqpTcp, &auth(CredentialScope::Device))
                .await
                .is_ok()
        );
        assert_eq!(hub.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_message() {
        let hub = SimulatedHub::new("test-hub");
        hub.register_device("d0");
        let identity = DeviceIdentity::new("d0", CredentialScope::Device, Protocol::AmqpTcp);
        let session = hub
            .connect(Protocol::AmqpTcp, &auth(CredentialScope::Device))
            .await
            .unwrap();
        session.open_link(&identity).await.unwrap();

        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.wait_for_message("d0", "m-1", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session
            .send(&identity, &[Message::new("x").with_message_id("m-1")])
            .await
            .unwrap();

        assert!(waiter.await.unwrap());
        assert!(!hub.wait_for_message("d0", "missing", Duration::from_millis(20)).await);
    }
}
