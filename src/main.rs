use anyhow::Context;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use hublink::client::DeviceClient;
use hublink::config::{ConfigError, HubClientConfig};
use hublink::error::{AppError, Result};
use hublink::logger;
use hublink::pool::{ConnectionPoolManager, DeviceIdentity, PoolEvent};
use hublink::simulator::{FaultInjection, FaultType, SimulatedHub};
use hublink::transport::Message;

#[tokio::main]
async fn main() {
    if let Err(e) = start().await {
        let code = e.downcast_ref::<AppError>().map_or(1, AppError::exit_code);
        eprintln!("hublink 退出 ({code}): {e:#}");
        std::process::exit(code);
    }
}

async fn start() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => HubClientConfig::from_file_with_env(&path)
            .map_err(AppError::from)
            .with_context(|| format!("加载配置文件 {path} 失败"))?,
        None => HubClientConfig::default(),
    };

    // 守卫需要活到 start 返回
    let _guard = logger::init(&config.logger).map_err(AppError::from)?;

    info!(
        "启动 hublink 演示: 协议={}, 设备数={}, 连接池大小={}",
        config.transport.protocol, config.pool.devices_count, config.pool.pool_size
    );

    let hub = Arc::new(SimulatedHub::new(&config.transport.hub_name));
    let clients = build_clients(&config, &hub)?;

    tokio::select! {
        result = run(&config, &hub, &clients) => {
            if let Err(e) = &result {
                error!("演示失败: {:#}", e);
            }
            shutdown(&clients).await;
            Ok(result?)
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("收到中断信号，正在关闭");
            shutdown(&clients).await;
            Ok(())
        }
    }
}

fn build_clients(config: &HubClientConfig, hub: &Arc<SimulatedHub>) -> Result<Vec<DeviceClient>> {
    let protocol = config.transport.protocol;
    let shared = if protocol.supports_multiplexing() {
        let pool = Arc::new(ConnectionPoolManager::new(
            protocol,
            &config.transport.hub_name,
            config.pool.clone(),
            hub.clone(),
        )?);
        spawn_event_logger(&pool);
        Some(pool)
    } else {
        None
    };

    let mut clients = Vec::with_capacity(config.pool.devices_count);
    for i in 0..config.pool.devices_count {
        let id = format!("{}-{i}", config.simulation.device_prefix);
        hub.register_device(&id);

        let identity = DeviceIdentity::new(&id, config.pool.credential_scope, protocol);
        let mut builder = DeviceClient::builder(identity, hub.clone())
            .hub_name(&config.transport.hub_name)
            .retry_policy(config.retry.clone());
        if let Some(pool) = &shared {
            builder = builder.pool(pool.clone());
        }
        clients.push(builder.build()?);
    }
    Ok(clients)
}

fn spawn_event_logger(pool: &Arc<ConnectionPoolManager>) {
    let mut events = pool.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PoolEvent::SessionOpened {
                    slot,
                    generation,
                    session_id,
                } => info!(slot, generation, %session_id, "会话已建立"),
                PoolEvent::SessionFaulted { slot, generation } => {
                    warn!(slot, generation, "会话故障")
                }
                PoolEvent::RebuildFailed { slot, error } => error!(slot, %error, "会话重建失败"),
                other => tracing::debug!("连接池事件: {:?}", other),
            }
        }
    });
}

async fn run(
    config: &HubClientConfig,
    hub: &SimulatedHub,
    clients: &[DeviceClient],
) -> Result<()> {
    let Some(first) = clients.first() else {
        return Err(AppError::Unknown("没有配置任何设备".to_string()));
    };

    try_join_all(clients.iter().map(|c| c.open())).await?;
    info!("{} 个设备已打开，物理连接数 {}", clients.len(), hub.live_sessions());

    send_round(config, clients, "before").await?;

    let fault_type: FaultType = config
        .simulation
        .fault
        .parse()
        .map_err(|e: String| AppError::Config(ConfigError::ValidationError(e)))?;
    let delay = Duration::from_millis(config.simulation.fault_delay_ms);
    first
        .send_event(FaultInjection::new(fault_type).with_delay(delay).to_message())
        .await?;
    info!("设备 {} 请求注入故障 {}，{:?} 后生效", first.identity(), fault_type, delay);
    tokio::time::sleep(delay * 2).await;

    send_round(config, clients, "after").await?;

    for client in clients {
        let id = client.identity().id();
        let last = format!("{id}-after-{}", config.simulation.messages_per_device.saturating_sub(1));
        if !hub.wait_for_message(id, &last, Duration::from_secs(5)).await {
            return Err(AppError::Unknown(format!("设备 {id} 的消息 {last} 未送达")));
        }
    }

    info!(
        "全部消息已送达，累计建立连接 {} 次",
        hub.connect_count()
    );
    for info in clients[0].pool().sessions().await {
        info!("槽位快照: {}", serde_json::to_string(&info)?);
    }
    Ok(())
}

async fn send_round(config: &HubClientConfig, clients: &[DeviceClient], phase: &str) -> Result<()> {
    try_join_all(clients.iter().map(|client| async move {
        let id = client.identity().id();
        for n in 0..config.simulation.messages_per_device {
            let body = serde_json::json!({ "device": id, "phase": phase, "seq": n });
            let message = Message::from_json(&body)?.with_message_id(format!("{id}-{phase}-{n}"));
            client.send_event(message).await?;
        }
        Ok::<_, AppError>(())
    }))
    .await?;
    Ok(())
}

async fn shutdown(clients: &[DeviceClient]) {
    for client in clients {
        if let Err(e) = client.close().await {
            warn!("关闭设备 {} 失败: {}", client.identity(), e);
        }
        client.dispose().await;
    }
    if let Some(client) = clients.first() {
        client.pool().shutdown().await;
    }
    info!("hublink 演示结束");
}
