use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use armada_core::shutdown::{GracefulShutdown, wait_for_tasks_with_timeout};

/// 服务优先级，数值越小越先停止
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServicePriority {
    High = 1,
    Medium = 2,
    Low = 3,
}

#[derive(Debug)]
pub struct ServiceInfo {
    pub name: String,
    pub priority: ServicePriority,
    pub handle: JoinHandle<()>,
}

/// 生命周期管理器
///
/// 负责统一管理后台服务的生命周期，包括：
/// - 服务注册
/// - 停机信号监听
/// - 按优先级的限时关闭
pub struct LifecycleManager {
    shutdown: GracefulShutdown,
    services: Vec<ServiceInfo>,
    shutdown_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(shutdown: GracefulShutdown) -> Self {
        Self {
            shutdown,
            services: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// 获取关闭令牌
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token.clone()
    }

    pub fn register_service(
        &mut self,
        name: impl Into<String>,
        priority: ServicePriority,
        handle: JoinHandle<()>,
    ) {
        let name = name.into();
        info!("Registering service: {} (priority: {:?})", name, priority);
        self.services.push(ServiceInfo {
            name,
            priority,
            handle,
        });
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn list_service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    /// 启动信号监听（后台任务）
    pub fn start_signal_listener(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown.wait_for_signal().await;
        });
    }

    pub async fn wait_for_shutdown_signal(&self) {
        info!("Waiting for shutdown signal...");
        self.shutdown.cancelled().await;
        info!("Shutdown signal received");
    }

    /// 取消根令牌并按优先级等待所有服务退出；全部按时退出时返回 true
    pub async fn graceful_shutdown(&mut self) -> bool {
        info!(
            "Starting graceful shutdown of {} services",
            self.services.len()
        );
        self.shutdown.trigger();

        let mut services: Vec<ServiceInfo> = self.services.drain(..).collect();
        services.sort_by_key(|s| s.priority);
        let handles: Vec<JoinHandle<()>> = services
            .into_iter()
            .map(|service| {
                info!(
                    "Shutting down service: {} (priority: {:?})",
                    service.name, service.priority
                );
                service.handle
            })
            .collect();

        let clean = wait_for_tasks_with_timeout(handles, self.shutdown_timeout).await;
        if clean {
            info!("All services shut down successfully");
        }
        clean
    }
}
