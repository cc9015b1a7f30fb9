//! 以库方式嵌入本地云事件模拟运行时
//!
//! 上层框架通过 [`app::Application`] 构建两个引擎，注册队列与
//! 定时任务的处理函数后调用 `run` 驻留。

pub mod app;
pub mod shutdown;

pub use app::Application;
pub use localcloud_core::{
    AppConfig, JobDefinition, JobExecution, LocalCloudError, LocalCloudResult, QueueMessage,
    ScheduledJob,
};
pub use localcloud_queue::{QueueHandler, QueueManager};
pub use localcloud_scheduler::{JobHandler, SchedulerEngine};
pub use shutdown::ShutdownManager;
