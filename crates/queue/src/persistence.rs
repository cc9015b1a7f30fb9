use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use localcloud_core::{LocalCloudError, LocalCloudResult, QueueMessage};

/// 队列快照：`<dir>/<queue>.json` 的文件内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub incoming: Vec<QueueMessage>,
    pub processing: Vec<QueueMessage>,
    pub dlq: Vec<QueueMessage>,
    pub saved_at: DateTime<Utc>,
}

/// 原子写入队列快照
///
/// 先写入同目录下的临时文件再重命名，崩溃不会破坏现有快照文件。
pub fn save_queue_snapshot(
    dir: &Path,
    queue: &str,
    snapshot: &QueueSnapshot,
) -> LocalCloudResult<()> {
    fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, snapshot)?;
    temp.flush()?;

    let target = dir.join(format!("{queue}.json"));
    temp.persist(&target)
        .map_err(|e| LocalCloudError::persistence_error(format!("重命名快照文件失败: {e}")))?;

    debug!(
        "队列 '{}' 快照已保存: incoming={} processing={} dlq={}",
        queue,
        snapshot.incoming.len(),
        snapshot.processing.len(),
        snapshot.dlq.len()
    );
    Ok(())
}

/// 读取队列快照；文件不存在视为冷启动，返回 None
pub fn load_queue_snapshot(dir: &Path, queue: &str) -> LocalCloudResult<Option<QueueSnapshot>> {
    let path = dir.join(format!("{queue}.json"));
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(&path)?;
    let snapshot: QueueSnapshot = serde_json::from_str(&data)?;
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn snapshot_with(incoming: usize) -> QueueSnapshot {
        QueueSnapshot {
            incoming: (0..incoming)
                .map(|i| QueueMessage::new(serde_json::json!({ "n": i }), HashMap::new()))
                .collect(),
            processing: vec![],
            dlq: vec![],
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = snapshot_with(3);
        save_queue_snapshot(dir.path(), "orders", &snapshot).unwrap();

        let loaded = load_queue_snapshot(dir.path(), "orders").unwrap().unwrap();
        assert_eq!(loaded.incoming.len(), 3);
        assert_eq!(loaded.incoming[0].id, snapshot.incoming[0].id);
    }

    #[test]
    fn test_missing_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_queue_snapshot(dir.path(), "nothing").unwrap().is_none());
    }

    #[test]
    fn test_overwrite_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        save_queue_snapshot(dir.path(), "orders", &snapshot_with(1)).unwrap();
        save_queue_snapshot(dir.path(), "orders", &snapshot_with(5)).unwrap();

        let loaded = load_queue_snapshot(dir.path(), "orders").unwrap().unwrap();
        assert_eq!(loaded.incoming.len(), 5);
    }

    #[test]
    fn test_stray_temp_file_does_not_break_previous_snapshot() {
        // 模拟在临时文件写入与重命名之间崩溃：残留的临时文件
        // 不影响既有快照的读取
        let dir = tempfile::tempdir().unwrap();
        save_queue_snapshot(dir.path(), "orders", &snapshot_with(2)).unwrap();

        let stray = dir.path().join(".tmpcrash");
        fs::write(&stray, b"{ truncated").unwrap();

        let loaded = load_queue_snapshot(dir.path(), "orders").unwrap().unwrap();
        assert_eq!(loaded.incoming.len(), 2);
    }
}
