use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use localcloud_core::{QueueConfig, QueueMessage};

use crate::QueueHandler;

/// 消息所在的列表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Incoming,
    Processing,
    Dlq,
}

/// 单个队列的可变状态
///
/// 不变式：一条消息在任意观察点只会出现在三个列表之一；
/// `processing_batch` 为 true 时不允许启动第二次批处理。
#[derive(Debug, Default)]
pub struct QueueState {
    pub incoming: VecDeque<QueueMessage>,
    pub processing: Vec<QueueMessage>,
    pub dlq: Vec<QueueMessage>,
    /// 当前批处理定时器，至多一个
    pub batch_timer: Option<JoinHandle<()>>,
    /// 批处理重入保护
    pub processing_batch: bool,
    /// 投递中的消息数
    pub active_processing: usize,
}

impl QueueState {
    pub fn pending_count(&self) -> usize {
        self.incoming.len() + self.processing.len() + self.dlq.len()
    }

    /// 按ID更新 processing 列表中的消息副本（重试计数回写）
    pub fn update_processing(&mut self, message: &QueueMessage) {
        if let Some(slot) = self.processing.iter_mut().find(|m| m.id == message.id) {
            *slot = message.clone();
        }
    }

    /// 从 processing 列表移除消息（投递成功或移入死信时调用）
    pub fn remove_processing(&mut self, message_id: &str) -> Option<QueueMessage> {
        let index = self.processing.iter().position(|m| m.id == message_id)?;
        Some(self.processing.remove(index))
    }
}

/// 队列条目：状态 + 处理函数 + 并发控制
pub struct QueueEntry {
    pub name: String,
    pub handler: Arc<dyn QueueHandler>,
    pub state: Mutex<QueueState>,
    /// 限制单队列同时投递的消息数
    pub semaphore: Arc<Semaphore>,
}

impl QueueEntry {
    pub fn new(name: &str, handler: Arc<dyn QueueHandler>, max_concurrent: usize) -> Self {
        Self {
            name: name.to_string(),
            handler,
            state: Mutex::new(QueueState::default()),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry").field("name", &self.name).finish()
    }
}

/// 队列统计信息（管理面板用）
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub incoming: usize,
    pub processing: usize,
    pub dlq: usize,
    pub active_processing: usize,
    pub processing_batch: bool,
    pub config: QueueConfig,
}
