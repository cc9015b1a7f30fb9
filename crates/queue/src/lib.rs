//! # 队列引擎
//!
//! 本地开发环境下的云消息队列模拟：按队列维护
//! incoming / processing / dlq 三个消息列表，批量/并行投递给用户
//! 处理函数，失败时按指数退避重试，重试耗尽后进入死信队列，
//! 并通过原子文件快照实现崩溃安全的持久化。

use async_trait::async_trait;

use localcloud_core::{LocalCloudResult, QueueMessage};

pub mod manager;
pub mod persistence;
mod processor;
pub mod state;

pub use manager::{validate_queue_name, QueueManager};
pub use persistence::{load_queue_snapshot, save_queue_snapshot, QueueSnapshot};
pub use state::{MessageState, QueueStats};

/// 队列消息处理函数
///
/// 返回错误即表示投递失败，由批处理器按重试/死信策略处理，
/// 不会作为未捕获异常向上传播。
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> LocalCloudResult<()>;
}
