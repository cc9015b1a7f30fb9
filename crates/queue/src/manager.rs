use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use localcloud_core::{LocalCloudError, LocalCloudResult, QueueConfig, QueueMessage};

use crate::persistence::{load_queue_snapshot, save_queue_snapshot, QueueSnapshot};
use crate::state::{MessageState, QueueEntry, QueueStats};
use crate::QueueHandler;

/// 队列管理器
///
/// 进程内唯一的队列注册表，持有所有队列的状态并暴露管理操作。
/// 批处理器在状态存在后由定时器自主驱动（见 processor.rs）。
#[derive(Clone)]
pub struct QueueManager {
    pub(crate) inner: Arc<QueueManagerInner>,
}

pub(crate) struct QueueManagerInner {
    pub(crate) queues: RwLock<HashMap<String, Arc<QueueEntry>>>,
    pub(crate) config: QueueConfig,
    pub(crate) shutting_down: AtomicBool,
    // 后台任务句柄用同步锁：必须在启动时同步写入，
    // 否则紧随其后的 shutdown 会错过未登记的句柄
    autosave: StdMutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    pub fn new(config: QueueConfig) -> Self {
        info!(
            "创建队列管理器: batch_size={} batch_window_ms={} max_retries={} parallel={}",
            config.batch_size, config.batch_window_ms, config.max_retries, config.parallel
        );
        let manager = Self {
            inner: Arc::new(QueueManagerInner {
                queues: RwLock::new(HashMap::new()),
                config,
                shutting_down: AtomicBool::new(false),
                autosave: StdMutex::new(None),
            }),
        };
        manager.start_autosave_task();
        manager
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Relaxed)
    }

    pub(crate) fn persistence_dir(&self) -> PathBuf {
        PathBuf::from(&self.inner.config.persistence.directory)
    }

    /// 注册队列并绑定处理函数
    ///
    /// 重复注册同名队列是幂等的：记录警告但不报错。
    /// 启用持久化且 load_on_startup 时会从磁盘恢复队列状态。
    pub async fn add_queue(&self, name: &str, handler: Arc<dyn QueueHandler>) -> LocalCloudResult<()> {
        validate_queue_name(name)?;

        {
            let queues = self.inner.queues.read().await;
            if queues.contains_key(name) {
                warn!("队列 '{name}' 已存在，忽略重复注册");
                return Ok(());
            }
        }

        let entry = Arc::new(QueueEntry::new(
            name,
            handler,
            self.inner.config.max_concurrent,
        ));

        let persistence = &self.inner.config.persistence;
        if persistence.enabled && persistence.load_on_startup {
            match load_queue_snapshot(&self.persistence_dir(), name) {
                Ok(Some(snapshot)) => self.restore_queue(&entry, snapshot).await,
                Ok(None) => debug!("队列 '{name}' 无持久化快照，冷启动"),
                Err(e) => warn!("加载队列 '{name}' 快照失败（按冷启动处理）: {e}"),
            }
        }

        self.inner
            .queues
            .write()
            .await
            .insert(name.to_string(), entry);
        info!("队列 '{name}' 已注册");
        Ok(())
    }

    /// 删除队列
    ///
    /// 仍有未处理消息时记录数据丢失警告但继续执行；取消队列定时器，
    /// 若启用持久化则在删除前写入最终快照。
    pub async fn remove_queue(&self, name: &str) -> LocalCloudResult<()> {
        let entry = {
            let mut queues = self.inner.queues.write().await;
            queues
                .remove(name)
                .ok_or_else(|| LocalCloudError::queue_not_found(name))?
        };

        {
            let mut state = entry.state.lock().await;
            let pending = state.pending_count();
            if pending > 0 {
                warn!("删除队列 '{name}' 时仍有 {pending} 条消息，将丢失内存中的副本");
            }
            if let Some(timer) = state.batch_timer.take() {
                timer.abort();
            }
        }

        if self.inner.config.persistence.enabled {
            self.persist_queue(&entry).await;
        }

        info!("队列 '{name}' 已删除");
        Ok(())
    }

    pub async fn has_queue(&self, name: &str) -> bool {
        self.inner.queues.read().await.contains_key(name)
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn stats(&self, name: &str) -> LocalCloudResult<QueueStats> {
        let entry = self.get_entry(name).await?;
        let state = entry.state.lock().await;
        Ok(QueueStats {
            name: name.to_string(),
            incoming: state.incoming.len(),
            processing: state.processing.len(),
            dlq: state.dlq.len(),
            active_processing: state.active_processing,
            processing_batch: state.processing_batch,
            config: self.inner.config.clone(),
        })
    }

    /// 按列表检视消息（管理接口用，返回副本）
    pub async fn messages(
        &self,
        name: &str,
        message_state: MessageState,
    ) -> LocalCloudResult<Vec<QueueMessage>> {
        let entry = self.get_entry(name).await?;
        let state = entry.state.lock().await;
        Ok(match message_state {
            MessageState::Incoming => state.incoming.iter().cloned().collect(),
            MessageState::Processing => state.processing.clone(),
            MessageState::Dlq => state.dlq.clone(),
        })
    }

    /// 入队一条消息，返回消息ID
    ///
    /// 入队后若 incoming 达到 batch_size 立即触发批处理（取消等待中的
    /// 定时器）；否则在没有定时器时启动一个 batch_window_ms 的定时器。
    pub async fn send_message(
        &self,
        name: &str,
        payload: serde_json::Value,
        attributes: HashMap<String, String>,
    ) -> LocalCloudResult<String> {
        let entry = self.get_entry(name).await?;
        let message = QueueMessage::new(payload, attributes);
        let id = message.id.clone();

        {
            let mut state = entry.state.lock().await;
            state.incoming.push_back(message);
            debug!(
                "消息 {} 入队 '{}' (incoming={})",
                id,
                name,
                state.incoming.len()
            );
            self.schedule_processing_locked(&entry, &mut state);
        }

        Ok(id)
    }

    /// 手动触发一次批处理
    pub async fn trigger_processing(&self, name: &str) -> LocalCloudResult<()> {
        let entry = self.get_entry(name).await?;
        let manager = self.clone();
        tokio::spawn(async move {
            manager.process_batch(&entry).await;
        });
        Ok(())
    }

    /// 将死信队列中的全部消息重新入队
    ///
    /// 每条消息重置尝试计数并分配新ID（保留 original_id），随后触发调度。
    /// 死信队列为空时返回0，不视为错误。
    pub async fn process_dlq(&self, name: &str) -> LocalCloudResult<usize> {
        let entry = self.get_entry(name).await?;
        let count = {
            let mut state = entry.state.lock().await;
            let dead: Vec<QueueMessage> = state.dlq.drain(..).collect();
            let count = dead.len();
            for message in dead {
                state.incoming.push_back(message.into_reprocessed());
            }
            if count > 0 {
                self.schedule_processing_locked(&entry, &mut state);
            }
            count
        };

        if self.inner.config.persistence.enabled {
            self.persist_queue(&entry).await;
        }
        info!("队列 '{name}' 死信重新入队 {count} 条");
        Ok(count)
    }

    /// 清空死信队列，返回清除的消息数
    pub async fn purge_dlq(&self, name: &str) -> LocalCloudResult<usize> {
        let entry = self.get_entry(name).await?;
        let count = {
            let mut state = entry.state.lock().await;
            let count = state.dlq.len();
            state.dlq.clear();
            count
        };

        if self.inner.config.persistence.enabled {
            self.persist_queue(&entry).await;
        }
        info!("队列 '{name}' 死信队列已清空，共 {count} 条");
        Ok(count)
    }

    /// 优雅关闭：阻止新的批处理，取消定时器，等待在途投递结束，
    /// 最后写入最终快照（最多等待 30 秒）
    pub async fn shutdown(&self) {
        info!("队列管理器开始关闭");
        self.inner.shutting_down.store(true, Ordering::Relaxed);

        if let Some(handle) = self.inner.autosave.lock().ok().and_then(|mut slot| slot.take()) {
            handle.abort();
        }

        let entries: Vec<Arc<QueueEntry>> = {
            let queues = self.inner.queues.read().await;
            queues.values().cloned().collect()
        };

        for entry in &entries {
            let mut state = entry.state.lock().await;
            if let Some(timer) = state.batch_timer.take() {
                timer.abort();
            }
        }

        // 协作式等待：在途的处理函数调用不会被强制中断
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let mut in_flight = 0usize;
            for entry in &entries {
                let state = entry.state.lock().await;
                in_flight += state.active_processing;
                if state.processing_batch {
                    in_flight += 1;
                }
            }
            if in_flight == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("等待在途消息超时（仍有 {in_flight} 个），放弃等待");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let persistence = &self.inner.config.persistence;
        if persistence.enabled && persistence.save_on_shutdown {
            for entry in &entries {
                self.persist_queue(entry).await;
            }
        }
        info!("队列管理器已关闭");
    }

    pub(crate) async fn get_entry(&self, name: &str) -> LocalCloudResult<Arc<QueueEntry>> {
        self.inner
            .queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LocalCloudError::queue_not_found(name))
    }

    /// 写入单个队列的快照；持久化失败只记录日志，内存状态仍是事实来源
    pub(crate) async fn persist_queue(&self, entry: &Arc<QueueEntry>) {
        if !self.inner.config.persistence.enabled {
            return;
        }
        let snapshot = {
            let state = entry.state.lock().await;
            QueueSnapshot {
                incoming: state.incoming.iter().cloned().collect(),
                processing: state.processing.clone(),
                dlq: state.dlq.clone(),
                saved_at: Utc::now(),
            }
        };
        if let Err(e) = save_queue_snapshot(&self.persistence_dir(), &entry.name, &snapshot) {
            warn!("保存队列 '{}' 快照失败: {e}", entry.name);
        }
    }

    /// 从快照恢复队列状态
    ///
    /// incoming 非空时重新安排一次批处理；processing 中的消息错开随机
    /// 延迟后重新投递，已耗尽重试次数的直接移入死信队列。
    async fn restore_queue(&self, entry: &Arc<QueueEntry>, snapshot: QueueSnapshot) {
        let max_retries = self.inner.config.max_retries;
        let mut redispatch = Vec::new();

        {
            let mut state = entry.state.lock().await;
            state.incoming = snapshot.incoming.into();
            state.dlq = snapshot.dlq;

            for mut message in snapshot.processing {
                if message.is_exhausted(max_retries) {
                    warn!(
                        "队列 '{}' 恢复时消息 {} 已耗尽重试次数，移入死信队列",
                        entry.name, message.id
                    );
                    message.mark_dead("进程重启时重试次数已耗尽");
                    state.dlq.push(message);
                } else {
                    state.processing.push(message.clone());
                    state.active_processing += 1;
                    redispatch.push(message);
                }
            }

            info!(
                "队列 '{}' 从快照恢复: incoming={} processing={} dlq={} (保存于 {})",
                entry.name,
                state.incoming.len(),
                state.processing.len(),
                state.dlq.len(),
                snapshot.saved_at
            );

            if !state.incoming.is_empty() {
                self.schedule_processing_locked(entry, &mut state);
            }
        }

        // 在途消息错开小的随机延迟重新投递，避免恢复风暴
        for message in redispatch {
            let manager = self.clone();
            let entry = entry.clone();
            let stagger = Duration::from_millis(rand::rng().random_range(0..500));
            tokio::spawn(async move {
                tokio::time::sleep(stagger).await;
                manager.dispatch_message(&entry, message).await;
                if manager.inner.config.persistence.enabled {
                    manager.persist_queue(&entry).await;
                }
            });
        }
    }

    fn start_autosave_task(&self) {
        let persistence = &self.inner.config.persistence;
        if !persistence.enabled || persistence.save_interval_ms == 0 {
            return;
        }
        let interval_ms = persistence.save_interval_ms;
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.tick().await; // 首个tick立即返回，跳过
            loop {
                interval.tick().await;
                let entries: Vec<Arc<QueueEntry>> = {
                    let queues = manager.inner.queues.read().await;
                    queues.values().cloned().collect()
                };
                for entry in entries {
                    manager.persist_queue(&entry).await;
                }
            }
        });
        if let Ok(mut slot) = self.inner.autosave.lock() {
            *slot = Some(handle);
        }
    }
}

/// 队列名称校验：非空，仅允许字母、数字、下划线和连字符
pub fn validate_queue_name(name: &str) -> LocalCloudResult<()> {
    if name.is_empty() {
        return Err(LocalCloudError::invalid_name(name, "名称不能为空"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(LocalCloudError::invalid_name(
            name,
            "名称只能包含字母、数字、下划线和连字符",
        ));
    }
    Ok(())
}
