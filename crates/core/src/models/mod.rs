//! # 数据模型
//!
//! 定义本地云事件模拟运行时的核心数据结构。
//!
//! ## 核心模型
//!
//! ### QueueMessage - 队列消息
//! 在单个队列的 incoming / processing / dlq 三个列表之间流转的消息单元。
//!
//! ### JobDefinition / ScheduledJob - 调度任务
//! `JobDefinition` 是外部接线层注册时提供的定义；`ScheduledJob` 是注册后
//! 携带运行时计数器（run_count、last_run、next_run）的任务记录。
//!
//! ### JobExecution - 执行记录
//! 单次任务执行的状态与结果，追加到有界的执行历史中。
//!
//! 所有时间字段使用 `DateTime<Utc>`，状态使用枚举类型，全部模型可序列化
//! 以支持文件持久化。

pub mod job;
pub mod message;

pub use job::{ExecutionStatus, JobDefinition, JobExecution, ScheduledJob};
pub use message::QueueMessage;
