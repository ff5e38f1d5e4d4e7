use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use armada_core::broadcast::{Broadcast, LocalBroadcast, NatsBroadcast};
use armada_core::config::{ArmadaConfig, BroadcastTransport};
use armada_core::constants::BROADCAST_AGENT_MESSAGES;
use armada_core::core_types::NodeId;
use armada_core::shutdown::{GracefulShutdown, with_cancellation};

use crate::application::ports::{Protocol, Store};
use crate::application::services::manager::{Manager, ManagerOptions};
use crate::domain::messages::AgentMessage;
use crate::infrastructure::lifecycle::LifecycleManager;
use crate::infrastructure::persistence::MemoryStore;

/// 服务器启动器 - 负责整个应用程序的引导过程
pub struct ServerBootstrapper {
    config: ArmadaConfig,
    shutdown: GracefulShutdown,
    protocols: Vec<Arc<dyn Protocol>>,
}

/// 运行中的服务器实例
pub struct RunningServer {
    manager: Arc<Manager>,
    lifecycle: LifecycleManager,
}

impl ServerBootstrapper {
    pub fn new(config: ArmadaConfig) -> Self {
        Self {
            config,
            shutdown: GracefulShutdown::new(),
            protocols: Vec::new(),
        }
    }

    /// 注册一个 Agent 通信协议
    pub fn with_protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// 启动服务器，返回运行中的实例
    pub async fn start(self) -> Result<RunningServer> {
        let node_id = self.config.node_id();
        info!(
            node_id = %node_id,
            transport = ?self.config.broadcast.transport,
            "Armada Server starting"
        );

        let lifecycle = LifecycleManager::new(self.shutdown.clone()).with_shutdown_timeout(
            std::time::Duration::from_secs(self.config.server.shutdown_timeout_sec),
        );
        lifecycle.start_signal_listener();

        let token = self.shutdown.child_token();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(
            node_id.clone(),
            &self.config.broadcast,
            token.child_token(),
        ));
        let agent_messages = self.agent_message_broadcast(node_id, token.child_token()).await?;

        let manager = Arc::new(Manager::new(
            store,
            self.protocols,
            agent_messages,
            ManagerOptions::from(&self.config),
            token,
        ));
        manager.start().await.context("failed to start manager")?;

        info!("Armada Server started successfully");
        Ok(RunningServer { manager, lifecycle })
    }

    /// 按配置选择 Agent 消息广播的传输方式
    async fn agent_message_broadcast(
        &self,
        node_id: NodeId,
        token: CancellationToken,
    ) -> Result<Arc<dyn Broadcast<AgentMessage>>> {
        let options = AgentMessage::broadcast_options(&self.config.broadcast);
        let broadcast: Arc<dyn Broadcast<AgentMessage>> = match self.config.broadcast.transport {
            BroadcastTransport::Local => Arc::new(LocalBroadcast::new(
                BROADCAST_AGENT_MESSAGES,
                node_id,
                options,
                token,
            )),
            BroadcastTransport::Nats => {
                let client =
                    with_cancellation(armada_core::nats::connect(&self.config.nats), token.clone())
                        .await
                        .context("NATS connect aborted by shutdown")?
                        .context("failed to connect to NATS")?;
                Arc::new(
                    NatsBroadcast::new(
                        client,
                        &self.config.nats.subject_prefix,
                        BROADCAST_AGENT_MESSAGES,
                        node_id,
                        options,
                        token,
                    )
                    .await?,
                )
            }
        };
        Ok(broadcast)
    }
}

impl RunningServer {
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// 等待停机信号后依次关闭 Manager 与已注册服务
    pub async fn wait_for_shutdown(mut self) -> Result<()> {
        self.lifecycle.wait_for_shutdown_signal().await;
        self.manager
            .shutdown(self.lifecycle.shutdown_timeout())
            .await?;
        self.lifecycle.graceful_shutdown().await;

        info!("Armada Server shut down gracefully.");
        Ok(())
    }
}
