pub mod config;
pub mod errors;
pub mod models;

pub use config::{
    AppConfig, CleanupConfig, CronConfig, ExecutionConfig, LogConfig, PersistenceConfig,
    QueueConfig, RestartBehaviorConfig, SchedulerConfig,
};
pub use errors::{LocalCloudError, LocalCloudResult};
pub use models::{ExecutionStatus, JobDefinition, JobExecution, QueueMessage, ScheduledJob};
