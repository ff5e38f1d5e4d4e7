//! NATS 连接（分布式广播使用）

use async_nats::{Client, ConnectOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::backoff::{execute_with_backoff_selective, network_connect_backoff};
use crate::config::NatsConfig;
use crate::error::{CoreError, Result};

/// 连接到 NATS，瞬态失败按退避策略重试
pub async fn connect(nats_config: &NatsConfig) -> Result<Client> {
    info!(url = %nats_config.url, "Connecting to NATS");
    let url = nats_config.url.clone();
    execute_with_backoff_selective(
        || connect_once(url.clone()),
        network_connect_backoff(),
        Arc::new(|e: &CoreError| e.is_retriable()),
    )
    .await
}

async fn connect_once(url: String) -> Result<Client> {
    let options = ConnectOptions::new()
        .ping_interval(Duration::from_secs(20))
        .connection_timeout(Duration::from_secs(5))
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Connected => info!("NATS connected"),
                async_nats::Event::Disconnected => warn!("NATS disconnected"),
                async_nats::Event::LameDuckMode => warn!("NATS server entering lame duck mode"),
                async_nats::Event::SlowConsumer(sid) => warn!(sid, "NATS slow consumer detected"),
                async_nats::Event::ServerError(err) => error!(error = %err, "NATS server error"),
                async_nats::Event::ClientError(err) => error!(error = %err, "NATS client error"),
                async_nats::Event::Draining => info!("NATS connection draining"),
                async_nats::Event::Closed => info!("NATS connection closed"),
            }
        });

    options.connect(url.as_str()).await.map_err(|e| {
        warn!(error = %e, "NATS connection attempt failed");
        CoreError::from(e)
    })
}
