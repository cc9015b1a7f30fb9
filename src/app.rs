use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use localcloud_core::AppConfig;
use localcloud_queue::QueueManager;
use localcloud_scheduler::SchedulerEngine;

/// 主应用程序
///
/// 持有队列管理器和调度引擎，供上层框架在注册完处理函数后
/// 以嵌入方式使用；`run` 驻留到收到关闭信号为止。
pub struct Application {
    config: AppConfig,
    queues: QueueManager,
    scheduler: SchedulerEngine,
}

impl Application {
    pub fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序");
        config.validate().context("配置校验失败")?;

        let queues = QueueManager::new(config.queue.clone());
        let scheduler = SchedulerEngine::new(config.scheduler.clone());

        Ok(Self {
            config,
            queues,
            scheduler,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 队列管理器（注册队列、发送消息的入口）
    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    /// 调度引擎（注册定时任务的入口）
    pub fn scheduler(&self) -> &SchedulerEngine {
        &self.scheduler
    }

    /// 运行应用程序：恢复调度器状态后驻留，直到收到关闭信号
    ///
    /// 队列状态在 `add_queue` 时按队列恢复；调度器快照是单文件，
    /// 需要在全部任务注册完成后统一恢复。
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.scheduler
            .restore_from_disk()
            .await
            .context("恢复调度器状态失败")?;

        info!("应用程序已启动");
        let _ = shutdown_rx.recv().await;

        info!("开始关闭应用程序");
        // 先停队列（消息投递依赖处理函数），再停调度器
        self.queues.shutdown().await;
        self.scheduler.shutdown().await;
        info!("应用程序已关闭");
        Ok(())
    }
}
