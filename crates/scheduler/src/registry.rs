use std::collections::VecDeque;

use tracing::{debug, warn};

use localcloud_core::{ExecutionStatus, JobExecution};

/// 全局执行登记表
///
/// 维护有界的执行历史（环形缓冲语义）和当前在途执行计数，
/// 供并发闸门和管理接口查询。
#[derive(Debug)]
pub struct ExecutionRegistry {
    history: VecDeque<JobExecution>,
    max_history: usize,
    running: usize,
}

impl ExecutionRegistry {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: VecDeque::new(),
            max_history,
            running: 0,
        }
    }

    /// 当前在途执行数
    pub fn running_count(&self) -> usize {
        self.running
    }

    /// 登记一次开始的执行
    pub fn record_start(&mut self, execution: JobExecution) {
        self.running += 1;
        self.history.push_back(execution);
        self.trim();
    }

    /// 回写执行结果（按ID更新历史中的记录）
    pub fn record_finish(&mut self, execution: &JobExecution) {
        self.running = self.running.saturating_sub(1);
        if let Some(slot) = self.history.iter_mut().find(|e| e.id == execution.id) {
            *slot = execution.clone();
        }
    }

    /// 最近的执行记录（时间升序的尾部）
    pub fn recent(&self, limit: usize) -> Vec<JobExecution> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// 当前仍在运行的执行
    pub fn running_executions(&self) -> Vec<JobExecution> {
        self.history.iter().filter(|e| e.is_running()).cloned().collect()
    }

    /// 历史全量（持久化用，已截断到上限）
    pub fn all(&self) -> Vec<JobExecution> {
        self.history.iter().cloned().collect()
    }

    /// 从持久化记录恢复历史
    ///
    /// 崩溃时仍处于 running 状态的记录在恢复时标记为失败，
    /// 在途计数不恢复（重启后没有真正在途的执行）。
    pub fn restore(&mut self, executions: Vec<JobExecution>) {
        for mut execution in executions {
            if execution.status == ExecutionStatus::Running {
                warn!("执行 {} 在进程重启时被中断，标记为失败", execution.id);
                execution.fail("进程重启中断");
            }
            self.history.push_back(execution);
        }
        self.trim();
        debug!("恢复了 {} 条执行历史", self.history.len());
    }

    /// 截断到上限，丢弃最旧的记录
    pub fn trim(&mut self) {
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(job_id: &str) -> JobExecution {
        let mut execution = JobExecution::start(job_id);
        execution.complete(None);
        execution
    }

    #[test]
    fn test_running_counter() {
        let mut registry = ExecutionRegistry::new(10);
        let execution = JobExecution::start("job-1");
        registry.record_start(execution.clone());
        assert_eq!(registry.running_count(), 1);
        assert_eq!(registry.running_executions().len(), 1);

        let mut done = execution;
        done.complete(Some(serde_json::json!("ok")));
        registry.record_finish(&done);
        assert_eq!(registry.running_count(), 0);
        assert!(registry.running_executions().is_empty());
        assert_eq!(registry.recent(10)[0].status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut registry = ExecutionRegistry::new(3);
        for i in 0..5 {
            let mut execution = finished(&format!("job-{i}"));
            execution.job_id = format!("job-{i}");
            registry.record_start(execution.clone());
            registry.record_finish(&execution);
        }
        let recent = registry.recent(10);
        assert_eq!(recent.len(), 3);
        // 最旧的被淘汰
        assert_eq!(recent[0].job_id, "job-2");
    }

    #[test]
    fn test_restore_marks_interrupted_as_failed() {
        let mut registry = ExecutionRegistry::new(10);
        let interrupted = JobExecution::start("job-1");
        registry.restore(vec![interrupted, finished("job-2")]);

        assert_eq!(registry.running_count(), 0);
        let recent = registry.recent(10);
        assert_eq!(recent[0].status, ExecutionStatus::Failed);
        assert_eq!(recent[1].status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_recent_returns_tail() {
        let mut registry = ExecutionRegistry::new(10);
        for i in 0..6 {
            let mut execution = finished("job");
            execution.job_id = format!("job-{i}");
            registry.record_start(execution.clone());
            registry.record_finish(&execution);
        }
        let recent = registry.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].job_id, "job-5");
    }
}
