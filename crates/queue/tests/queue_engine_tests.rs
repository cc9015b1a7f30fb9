//! 队列引擎的端到端测试：批处理触发、重试/死信、重新入队与持久化恢复

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use localcloud_core::{LocalCloudError, LocalCloudResult, PersistenceConfig, QueueConfig, QueueMessage};
use localcloud_queue::{MessageState, QueueHandler, QueueManager};

/// 记录每次投递的处理函数，可配置前 N 次调用失败
struct RecordingHandler {
    calls: Mutex<Vec<QueueMessage>>,
    fail_remaining: AtomicI64,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Self::failing(0)
    }

    fn failing(times: i64) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_remaining: AtomicI64::new(times),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls(&self) -> Vec<QueueMessage> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueHandler for RecordingHandler {
    async fn handle(&self, message: &QueueMessage) -> LocalCloudResult<()> {
        self.calls.lock().unwrap().push(message.clone());
        if self.fail_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(LocalCloudError::handler_failure("模拟的处理失败"));
        }
        Ok(())
    }
}

/// 按消息内容决定成败的处理函数，记录每次成功投递距创建的耗时
struct SelectiveHandler {
    started: Instant,
    delivered: Mutex<Vec<(serde_json::Value, Duration)>>,
}

impl SelectiveHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn delivered(&self) -> Vec<(serde_json::Value, Duration)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueHandler for SelectiveHandler {
    async fn handle(&self, message: &QueueMessage) -> LocalCloudResult<()> {
        if message
            .payload
            .get("fail")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return Err(LocalCloudError::handler_failure("模拟的处理失败"));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((message.payload.clone(), self.started.elapsed()));
        Ok(())
    }
}

fn test_config() -> QueueConfig {
    QueueConfig {
        batch_size: 10,
        batch_window_ms: 50,
        max_retries: 2,
        parallel: true,
        max_concurrent: 5,
        retry_backoff: false,
        persistence: PersistenceConfig {
            enabled: false,
            ..PersistenceConfig::default()
        },
    }
}

/// 轮询等待条件成立，超时则断言失败
async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "等待超时: {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// 轮询等待死信队列达到指定长度
async fn wait_for_dlq(manager: &QueueManager, queue: &str, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let dlq = manager.messages(queue, MessageState::Dlq).await.unwrap();
        if dlq.len() == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "等待超时: 死信队列长度 {expected}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn send(manager: &QueueManager, queue: &str, n: usize) {
    for i in 0..n {
        manager
            .send_message(queue, serde_json::json!({ "n": i }), HashMap::new())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_batch_window_flushes_partial_batch() {
    let manager = QueueManager::new(test_config());
    let handler = RecordingHandler::new();
    manager.add_queue("orders", handler.clone()).await.unwrap();

    // 不足 batch_size，依靠窗口定时器触发
    send(&manager, "orders", 3).await;
    wait_until("3条消息全部投递", || handler.call_count() == 3).await;

    let stats = manager.stats("orders").await.unwrap();
    assert_eq!(stats.incoming, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.dlq, 0);
}

#[tokio::test]
async fn test_full_batch_triggers_immediately() {
    let mut config = test_config();
    config.batch_size = 5;
    config.batch_window_ms = 60_000; // 窗口足够长，只有立即触发才能在超时前投递
    let manager = QueueManager::new(config);
    let handler = RecordingHandler::new();
    manager.add_queue("orders", handler.clone()).await.unwrap();

    send(&manager, "orders", 5).await;
    wait_until("满批立即投递", || handler.call_count() == 5).await;
}

#[tokio::test]
async fn test_retry_exhaustion_moves_to_dlq() {
    let manager = QueueManager::new(test_config());
    // 永远失败：初次 + 2次重试后进入死信队列
    let handler = RecordingHandler::failing(i64::MAX);
    manager.add_queue("orders", handler.clone()).await.unwrap();

    send(&manager, "orders", 1).await;
    wait_for_dlq(&manager, "orders", 1).await;

    // 共 max_retries + 1 次尝试
    assert_eq!(handler.call_count(), 3);

    let dlq = manager.messages("orders", MessageState::Dlq).await.unwrap();
    assert_eq!(dlq[0].attempts, 2);
    assert!(dlq[0].error.is_some());
    assert!(dlq[0].failed_at.is_some());

    // 死信消息不再占用 processing
    let stats = manager.stats("orders").await.unwrap();
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.active_processing, 0);
}

#[tokio::test]
async fn test_retry_backoff_delays_before_dlq() {
    let mut config = test_config();
    config.retry_backoff = true;
    let manager = QueueManager::new(config);
    let handler = RecordingHandler::failing(i64::MAX);
    manager.add_queue("orders", handler.clone()).await.unwrap();

    let started = Instant::now();
    send(&manager, "orders", 1).await;
    wait_for_dlq(&manager, "orders", 1).await;
    let elapsed = started.elapsed();

    // max_retries=2：两次退避共 200ms + 400ms，死信不会更早出现
    assert_eq!(handler.call_count(), 3);
    assert!(
        elapsed >= Duration::from_millis(600),
        "退避等待被跳过: {elapsed:?}"
    );

    let dlq = manager.messages("orders", MessageState::Dlq).await.unwrap();
    assert_eq!(dlq[0].attempts, 2);
}

#[tokio::test]
async fn test_backoff_wait_releases_concurrency_slot() {
    let mut config = test_config();
    config.retry_backoff = true;
    config.max_concurrent = 1;
    let manager = QueueManager::new(config);
    let handler = SelectiveHandler::new();
    manager.add_queue("orders", handler.clone()).await.unwrap();

    // 失败消息在先：退避等待期间执行槽必须让给同批次的后续消息
    manager
        .send_message("orders", serde_json::json!({ "fail": true }), HashMap::new())
        .await
        .unwrap();
    manager
        .send_message("orders", serde_json::json!({ "n": 1 }), HashMap::new())
        .await
        .unwrap();

    wait_for_dlq(&manager, "orders", 1).await;

    let delivered = handler.delivered();
    assert_eq!(delivered.len(), 1);
    assert!(
        delivered[0].1 < Duration::from_millis(500),
        "成功消息被退避等待阻塞: {:?}",
        delivered[0].1
    );
}

#[tokio::test]
async fn test_dlq_redrive_resets_attempts() {
    let manager = QueueManager::new(test_config());
    // 前3次失败（刚好把第一条消息打入死信队列），之后成功
    let handler = RecordingHandler::failing(3);
    manager.add_queue("orders", handler.clone()).await.unwrap();

    send(&manager, "orders", 1).await;
    wait_for_dlq(&manager, "orders", 1).await;

    let dlq = manager.messages("orders", MessageState::Dlq).await.unwrap();
    let original_id = dlq[0].id.clone();

    let redriven = manager.process_dlq("orders").await.unwrap();
    assert_eq!(redriven, 1);

    wait_until("重新入队的消息投递成功", || handler.call_count() == 4).await;

    // 重新入队的消息：新ID、计数清零、保留原始ID
    let last = handler.calls().pop().unwrap();
    assert!(last.reprocessed);
    assert_eq!(last.attempts, 0);
    assert_ne!(last.id, original_id);
    assert_eq!(last.original_id.as_deref(), Some(original_id.as_str()));

    let dlq = manager.messages("orders", MessageState::Dlq).await.unwrap();
    assert!(dlq.is_empty());
}

#[tokio::test]
async fn test_purge_dlq() {
    let manager = QueueManager::new(test_config());
    let handler = RecordingHandler::failing(i64::MAX);
    manager.add_queue("orders", handler.clone()).await.unwrap();

    send(&manager, "orders", 2).await;
    wait_for_dlq(&manager, "orders", 2).await;

    assert_eq!(manager.purge_dlq("orders").await.unwrap(), 2);
    assert_eq!(manager.purge_dlq("orders").await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_queue_is_an_error() {
    let manager = QueueManager::new(test_config());
    let result = manager
        .send_message("missing", serde_json::json!({}), HashMap::new())
        .await;
    assert!(matches!(result, Err(LocalCloudError::QueueNotFound { .. })));
    assert!(manager.stats("missing").await.is_err());
    assert!(manager.process_dlq("missing").await.is_err());
}

#[tokio::test]
async fn test_duplicate_add_queue_is_idempotent() {
    let manager = QueueManager::new(test_config());
    let handler = RecordingHandler::new();
    manager.add_queue("orders", handler.clone()).await.unwrap();
    manager.add_queue("orders", handler.clone()).await.unwrap();
    assert_eq!(manager.queue_names().await, vec!["orders".to_string()]);
}

#[tokio::test]
async fn test_remove_queue_drops_state() {
    let manager = QueueManager::new(test_config());
    let handler = RecordingHandler::new();
    manager.add_queue("orders", handler.clone()).await.unwrap();

    manager.remove_queue("orders").await.unwrap();
    assert!(!manager.has_queue("orders").await);
    assert!(matches!(
        manager.remove_queue("orders").await,
        Err(LocalCloudError::QueueNotFound { .. })
    ));
}

#[tokio::test]
async fn test_persistence_restores_incoming_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.batch_size = 100;
    config.batch_window_ms = 60_000; // 确保消息在关闭前不会被投递
    config.persistence = PersistenceConfig {
        enabled: true,
        directory: dir.path().to_string_lossy().into_owned(),
        save_interval_ms: 0,
        save_on_shutdown: true,
        load_on_startup: true,
    };

    // 第一个进程：入队后直接关闭
    {
        let manager = QueueManager::new(config.clone());
        let handler = RecordingHandler::new();
        manager.add_queue("orders", handler.clone()).await.unwrap();
        send(&manager, "orders", 4).await;
        manager.shutdown().await;
        assert_eq!(handler.call_count(), 0);
    }

    // 第二个进程：恢复后投递
    config.batch_window_ms = 50;
    let manager = QueueManager::new(config);
    let handler = RecordingHandler::new();
    manager.add_queue("orders", handler.clone()).await.unwrap();

    wait_until("恢复的消息全部投递", || handler.call_count() == 4).await;
}

#[tokio::test]
async fn test_persistence_restores_dlq_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.persistence = PersistenceConfig {
        enabled: true,
        directory: dir.path().to_string_lossy().into_owned(),
        save_interval_ms: 0,
        save_on_shutdown: true,
        load_on_startup: true,
    };

    {
        let manager = QueueManager::new(config.clone());
        let handler = RecordingHandler::failing(i64::MAX);
        manager.add_queue("orders", handler.clone()).await.unwrap();
        send(&manager, "orders", 1).await;
        wait_for_dlq(&manager, "orders", 1).await;
        manager.shutdown().await;
    }

    let manager = QueueManager::new(config);
    let handler = RecordingHandler::new();
    manager.add_queue("orders", handler.clone()).await.unwrap();

    let dlq = manager.messages("orders", MessageState::Dlq).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].attempts, 2);
}

#[tokio::test]
async fn test_shutdown_immediately_after_startup_stops_autosave() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.persistence = PersistenceConfig {
        enabled: true,
        directory: dir.path().to_string_lossy().into_owned(),
        save_interval_ms: 40,
        save_on_shutdown: false,
        load_on_startup: false,
    };

    // 启动后立刻关闭，自动保存任务必须被取消而不是泄漏
    let manager = QueueManager::new(config);
    manager.shutdown().await;

    let handler = RecordingHandler::new();
    manager.add_queue("orders", handler).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!dir.path().join("orders.json").exists());
}
