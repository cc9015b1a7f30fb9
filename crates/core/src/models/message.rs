use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// 队列消息
///
/// 消息由其所在的队列独占，在 incoming / processing / dlq 三个列表之间移动，
/// 任意时刻只会出现在其中一个列表里。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reprocessed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
}

impl QueueMessage {
    /// 创建新消息，ID由入队时间戳和随机后缀派生
    pub fn new(payload: serde_json::Value, attributes: HashMap<String, String>) -> Self {
        Self {
            id: generate_message_id(),
            timestamp: Utc::now(),
            attempts: 0,
            payload,
            attributes,
            next_attempt: None,
            error: None,
            failed_at: None,
            reprocessed: false,
            original_id: None,
        }
    }

    /// 记录一次失败后的重试：递增尝试次数并标记下次投递时间
    pub fn mark_retry(&mut self, error: &str, next_attempt: DateTime<Utc>) {
        self.attempts += 1;
        self.error = Some(error.to_string());
        self.next_attempt = Some(next_attempt);
    }

    /// 标记为死信：记录最终错误和失败时间
    pub fn mark_dead(&mut self, error: &str) {
        self.error = Some(error.to_string());
        self.failed_at = Some(Utc::now());
        self.next_attempt = None;
    }

    /// 从死信队列重新入队：重置尝试计数并分配新ID，保留原始ID便于追溯
    pub fn into_reprocessed(mut self) -> Self {
        let original = self.original_id.take().unwrap_or_else(|| self.id.clone());
        Self {
            id: generate_message_id(),
            timestamp: Utc::now(),
            attempts: 0,
            payload: self.payload,
            attributes: self.attributes,
            next_attempt: None,
            error: None,
            failed_at: None,
            reprocessed: true,
            original_id: Some(original),
        }
    }

    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.attempts >= max_retries
    }
}

fn generate_message_id() -> String {
    let suffix: u32 = rand::rng().random();
    format!("{}-{:08x}", Utc::now().timestamp_millis(), suffix)
}
