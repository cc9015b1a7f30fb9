use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use localcloud_core::QueueMessage;

use crate::manager::QueueManager;
use crate::state::{QueueEntry, QueueState};

/// 批处理器：将 incoming 按批次搬入 processing 并投递给处理函数，
/// 按重试/退避/死信策略处理每条消息的结果。
impl QueueManager {
    /// 在持有队列锁的前提下安排一次批处理
    ///
    /// incoming 达到 batch_size 时取消等待中的定时器并立即触发；
    /// 否则在没有定时器且没有在途批次时启动 batch_window_ms 定时器。
    pub(crate) fn schedule_processing_locked(
        &self,
        entry: &Arc<QueueEntry>,
        state: &mut QueueState,
    ) {
        if self.is_shutting_down() {
            return;
        }

        if state.incoming.len() >= self.inner.config.batch_size {
            if let Some(timer) = state.batch_timer.take() {
                timer.abort();
            }
            let manager = self.clone();
            let entry = entry.clone();
            tokio::spawn(async move {
                manager.process_batch(&entry).await;
            });
            return;
        }

        if state.batch_timer.is_none() && !state.processing_batch {
            let manager = self.clone();
            let entry_for_timer = entry.clone();
            let window = Duration::from_millis(self.inner.config.batch_window_ms);
            state.batch_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                manager.process_batch(&entry_for_timer).await;
            }));
        }
    }

    /// 执行一次批处理
    ///
    /// `processing_batch` 作为重入保护：定时器触发与手动触发竞争时，
    /// 后到者直接返回，避免同一队列的双重批处理。
    pub(crate) async fn process_batch(&self, entry: &Arc<QueueEntry>) {
        if self.is_shutting_down() {
            return;
        }

        let batch: Vec<QueueMessage> = {
            let mut state = entry.state.lock().await;
            if state.processing_batch {
                debug!("队列 '{}' 已有批处理在途，跳过", entry.name);
                return;
            }
            // 定时器句柄到这里要么已经完成要么即将被本次批处理取代，
            // 只解除登记，不能 abort（可能正是当前任务自身）
            state.batch_timer = None;

            let take = state.incoming.len().min(self.inner.config.batch_size);
            if take == 0 {
                return;
            }
            state.processing_batch = true;

            let batch: Vec<QueueMessage> = state.incoming.drain(..take).collect();
            state.processing.extend(batch.iter().cloned());
            state.active_processing += batch.len();
            batch
        };

        debug!("队列 '{}' 开始批处理 {} 条消息", entry.name, batch.len());

        if self.inner.config.parallel {
            let futures: Vec<_> = batch
                .into_iter()
                .map(|message| {
                    let manager = self.clone();
                    let entry = entry.clone();
                    async move { manager.dispatch_message(&entry, message).await }
                })
                .collect();
            join_all(futures).await;
        } else {
            for message in batch {
                self.dispatch_message(entry, message).await;
            }
        }

        let remaining = {
            let mut state = entry.state.lock().await;
            state.processing_batch = false;
            state.incoming.len()
        };

        if self.inner.config.persistence.enabled {
            self.persist_queue(entry).await;
        }

        if remaining > 0 {
            let mut state = entry.state.lock().await;
            self.schedule_processing_locked(entry, &mut state);
        }
    }

    /// 投递单条消息并应用重试/死信策略
    ///
    /// 失败且未耗尽重试次数时递增 attempts 后原地重新投递（消息保持在
    /// processing 列表中，不回到 incoming）；启用退避时延迟
    /// `2^attempts * 100ms`。失败且已耗尽时移入死信队列。
    pub(crate) async fn dispatch_message(&self, entry: &Arc<QueueEntry>, mut message: QueueMessage) {
        let max_retries = self.inner.config.max_retries;

        loop {
            // 每次尝试单独持有并发许可：退避等待期间把执行槽让给
            // 同批次的其他消息
            let permit = match entry.semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let outcome = entry.handler.handle(&message).await;
            drop(permit);

            match outcome {
                Ok(()) => {
                    let mut state = entry.state.lock().await;
                    state.remove_processing(&message.id);
                    debug!("队列 '{}' 消息 {} 投递成功", entry.name, message.id);
                    break;
                }
                Err(e) => {
                    let error = e.to_string();
                    if message.attempts < max_retries {
                        let backoff_ms = if self.inner.config.retry_backoff {
                            2u64.pow(message.attempts + 1) * 100
                        } else {
                            0
                        };
                        message.mark_retry(
                            &error,
                            Utc::now() + chrono::Duration::milliseconds(backoff_ms as i64),
                        );
                        {
                            let mut state = entry.state.lock().await;
                            state.update_processing(&message);
                        }
                        warn!(
                            "队列 '{}' 消息 {} 投递失败（第{}次尝试），{}ms后重试: {}",
                            entry.name, message.id, message.attempts, backoff_ms, error
                        );
                        if backoff_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        }
                    } else {
                        message.mark_dead(&error);
                        let mut state = entry.state.lock().await;
                        state.remove_processing(&message.id);
                        state.dlq.push(message.clone());
                        info!(
                            "队列 '{}' 消息 {} 重试耗尽（attempts={}），移入死信队列",
                            entry.name, message.id, message.attempts
                        );
                        break;
                    }
                }
            }
        }

        let mut state = entry.state.lock().await;
        state.active_processing = state.active_processing.saturating_sub(1);
    }
}
