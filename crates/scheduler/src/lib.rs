//! # 调度引擎
//!
//! 本地开发环境下的云定时任务模拟：支持 CRON / rate 表达式、固定
//! 间隔和一次性延迟三种调度方式，带超时约束与全局并发闸门的执行，
//! 有界执行历史，以及跨进程重启的状态恢复（含漂移纠偏）。

use async_trait::async_trait;

use localcloud_core::{JobExecution, LocalCloudResult, ScheduledJob};

pub mod cron_utils;
pub mod engine;
pub mod persistence;
pub mod recovery;
pub mod registry;

pub use cron_utils::{CronResolver, ExpressionType, Resolution, ResolveOptions};
pub use engine::{validate_job_name, JobStats, SchedulerEngine};
pub use persistence::{load_scheduler_snapshot, save_scheduler_snapshot, SchedulerSnapshot};
pub use registry::ExecutionRegistry;

/// 任务处理函数
///
/// 返回值会被记录到执行历史中；返回错误即表示执行失败，
/// 不会作为未捕获异常向上传播。
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(
        &self,
        job: &ScheduledJob,
        execution: &JobExecution,
    ) -> LocalCloudResult<serde_json::Value>;
}
