use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use localcloud_core::{JobExecution, LocalCloudError, LocalCloudResult, ScheduledJob};

/// 快照格式版本号，结构不兼容时递增
const SNAPSHOT_VERSION: u32 = 1;

const SNAPSHOT_FILE: &str = "scheduler-state.json";

/// 调度器快照：`<dir>/scheduler-state.json` 的文件内容
///
/// 包含全部已注册任务的运行时状态和截断后的执行历史。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub version: u32,
    pub jobs: Vec<ScheduledJob>,
    pub executions: Vec<JobExecution>,
    pub saved_at: DateTime<Utc>,
}

impl SchedulerSnapshot {
    pub fn new(jobs: Vec<ScheduledJob>, executions: Vec<JobExecution>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            jobs,
            executions,
            saved_at: Utc::now(),
        }
    }
}

/// 原子写入调度器快照
///
/// 与队列快照相同的写法：先写同目录临时文件再重命名，
/// 崩溃不会破坏既有快照。
pub fn save_scheduler_snapshot(dir: &Path, snapshot: &SchedulerSnapshot) -> LocalCloudResult<()> {
    fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, snapshot)?;
    temp.flush()?;

    let target = dir.join(SNAPSHOT_FILE);
    temp.persist(&target)
        .map_err(|e| LocalCloudError::persistence_error(format!("重命名快照文件失败: {e}")))?;

    debug!(
        "调度器快照已保存: jobs={} executions={}",
        snapshot.jobs.len(),
        snapshot.executions.len()
    );
    Ok(())
}

/// 读取调度器快照；文件不存在视为冷启动，返回 None
pub fn load_scheduler_snapshot(dir: &Path) -> LocalCloudResult<Option<SchedulerSnapshot>> {
    let path = dir.join(SNAPSHOT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(&path)?;
    let snapshot: SchedulerSnapshot = serde_json::from_str(&data)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(LocalCloudError::persistence_error(format!(
            "不支持的快照版本: {}",
            snapshot.version
        )));
    }
    Ok(Some(snapshot))
}
