use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 任务定义：由外部接线层（HTTP/CLI）注册时提供
///
/// `cron_expression`、`interval_ms`、`delay_ms` 三者互斥，必须且只能提供一个。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// 逻辑归属标记（注册来源模块）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl JobDefinition {
    pub fn cron<N: Into<String>, E: Into<String>>(name: N, expression: E) -> Self {
        Self {
            name: name.into(),
            cron_expression: Some(expression.into()),
            interval_ms: None,
            delay_ms: None,
            enabled: true,
            max_runs: None,
            metadata: serde_json::Value::Null,
            timezone: None,
            module: None,
        }
    }

    pub fn interval<N: Into<String>>(name: N, interval_ms: u64) -> Self {
        Self {
            name: name.into(),
            cron_expression: None,
            interval_ms: Some(interval_ms),
            delay_ms: None,
            enabled: true,
            max_runs: None,
            metadata: serde_json::Value::Null,
            timezone: None,
            module: None,
        }
    }

    pub fn one_shot<N: Into<String>>(name: N, delay_ms: u64) -> Self {
        Self {
            name: name.into(),
            cron_expression: None,
            interval_ms: None,
            delay_ms: Some(delay_ms),
            enabled: true,
            max_runs: Some(1),
            metadata: serde_json::Value::Null,
            timezone: None,
            module: None,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_runs(mut self, max_runs: u64) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn with_timezone<S: Into<String>>(mut self, tz: S) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn with_module<S: Into<String>>(mut self, module: S) -> Self {
        self.module = Some(module.into());
        self
    }
}

/// 已注册的调度任务（定义 + 运行时计数器）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    pub next_run: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub run_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

impl ScheduledJob {
    /// 从任务定义创建，`next_run` 由调用方（解析器）计算后填入
    pub fn from_definition(definition: &JobDefinition, next_run: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: definition.name.clone(),
            cron_expression: definition.cron_expression.clone(),
            interval_ms: definition.interval_ms,
            delay_ms: definition.delay_ms,
            next_run,
            last_run: None,
            enabled: definition.enabled,
            run_count: 0,
            max_runs: definition.max_runs,
            metadata: definition.metadata.clone(),
            created_at: Utc::now(),
            timezone: definition.timezone.clone(),
            module: definition.module.clone(),
        }
    }

    /// 判断持久化的任务与当前注册的定义在调度语义上是否一致
    pub fn matches_definition(&self, definition: &JobDefinition) -> bool {
        self.cron_expression == definition.cron_expression
            && self.interval_ms == definition.interval_ms
            && self.delay_ms == definition.delay_ms
            && self.max_runs == definition.max_runs
            && self.timezone == definition.timezone
    }

    /// 是否已达到运行次数上限
    pub fn reached_max_runs(&self) -> bool {
        self.max_runs.is_some_and(|max| self.run_count >= max)
    }
}

/// 任务执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// 单次任务执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: String,
    pub job_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobExecution {
    pub fn start(job_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: ExecutionStatus::Running,
            result: None,
            error: None,
        }
    }

    pub fn complete(&mut self, result: Option<serde_json::Value>) {
        self.end_time = Some(Utc::now());
        self.status = ExecutionStatus::Completed;
        self.result = result;
    }

    pub fn fail(&mut self, error: &str) {
        self.end_time = Some(Utc::now());
        self.status = ExecutionStatus::Failed;
        self.error = Some(error.to_string());
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }

    /// 执行时长（毫秒），仍在运行时为 None
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_definition() {
        let def = JobDefinition::cron("nightly-report", "0 0 2 * * *").with_module("reports");
        let next = Utc::now();
        let job = ScheduledJob::from_definition(&def, next);
        assert_eq!(job.name, "nightly-report");
        assert_eq!(job.run_count, 0);
        assert_eq!(job.next_run, next);
        assert!(job.enabled);
        assert_eq!(job.module.as_deref(), Some("reports"));
    }

    #[test]
    fn test_matches_definition_detects_schedule_change() {
        let def = JobDefinition::cron("sync", "0 0 * * * *");
        let job = ScheduledJob::from_definition(&def, Utc::now());
        assert!(job.matches_definition(&def));

        let changed = JobDefinition::cron("sync", "0 30 * * * *");
        assert!(!job.matches_definition(&changed));

        let changed = JobDefinition::cron("sync", "0 0 * * * *").with_max_runs(5);
        assert!(!job.matches_definition(&changed));
    }

    #[test]
    fn test_reached_max_runs() {
        let def = JobDefinition::interval("poller", 1000).with_max_runs(2);
        let mut job = ScheduledJob::from_definition(&def, Utc::now());
        assert!(!job.reached_max_runs());
        job.run_count = 2;
        assert!(job.reached_max_runs());
    }

    #[test]
    fn test_execution_lifecycle() {
        let mut exec = JobExecution::start("job-1");
        assert!(exec.is_running());
        assert!(exec.duration_ms().is_none());

        exec.complete(Some(serde_json::json!({"rows": 10})));
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.duration_ms().is_some());
    }
}
