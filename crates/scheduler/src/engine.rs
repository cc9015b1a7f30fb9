use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use localcloud_core::{
    JobDefinition, JobExecution, LocalCloudError, LocalCloudResult, ScheduledJob, SchedulerConfig,
};

use crate::cron_utils::CronResolver;
use crate::persistence::{load_scheduler_snapshot, save_scheduler_snapshot, SchedulerSnapshot};
use crate::recovery::{compute_next_run, reconcile_next_run};
use crate::registry::ExecutionRegistry;
use crate::JobHandler;

/// 并发闸门拒绝后的延后间隔
const CONCURRENCY_DEFER_MS: u64 = 30_000;

/// 单个任务的运行时状态，由任务级互斥锁保护
struct JobState {
    job: ScheduledJob,
    timer: Option<JoinHandle<()>>,
    running: bool,
}

/// 已注册任务：不变的定义与处理函数 + 可变的运行时状态
struct JobEntry {
    name: String,
    definition: JobDefinition,
    handler: Arc<dyn JobHandler>,
    state: Mutex<JobState>,
}

impl std::fmt::Debug for JobEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// 任务统计信息（管理接口用）
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub job: ScheduledJob,
    pub running: bool,
    pub description: String,
    pub upcoming: Vec<DateTime<Utc>>,
}

/// 调度引擎
///
/// 进程内唯一的任务注册表。每个启用的任务持有一个指向下一次
/// 执行时间的一次性定时器，执行结束后重新计算并重新武装；执行
/// 通过统一闸门（关闭中/重入/禁用/并发上限）后才真正运行。
///
/// 锁顺序：先任务状态锁，后执行登记表锁。
#[derive(Clone)]
pub struct SchedulerEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    jobs: RwLock<HashMap<String, Arc<JobEntry>>>,
    executions: Mutex<ExecutionRegistry>,
    config: SchedulerConfig,
    shutting_down: AtomicBool,
    /// 恢复完成前不写快照，避免注册期间把磁盘上的旧状态覆盖掉
    restored: AtomicBool,
    // 后台任务句柄用同步锁：必须在启动时同步写入，
    // 否则紧随其后的 shutdown 会错过未登记的句柄
    cleanup: StdMutex<Option<JoinHandle<()>>>,
    autosave: StdMutex<Option<JoinHandle<()>>>,
}

impl SchedulerEngine {
    pub fn new(config: SchedulerConfig) -> Self {
        info!(
            "创建调度引擎: max_concurrent={} default_timeout_ms={} max_history={}",
            config.execution.max_concurrent,
            config.execution.default_timeout_ms,
            config.cleanup.max_execution_history
        );
        let engine = Self {
            inner: Arc::new(EngineInner {
                jobs: RwLock::new(HashMap::new()),
                executions: Mutex::new(ExecutionRegistry::new(
                    config.cleanup.max_execution_history,
                )),
                restored: AtomicBool::new(
                    !(config.persistence.enabled && config.persistence.load_on_startup),
                ),
                config,
                shutting_down: AtomicBool::new(false),
                cleanup: StdMutex::new(None),
                autosave: StdMutex::new(None),
            }),
        };
        engine.start_cleanup_task();
        engine.start_autosave_task();
        engine
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Relaxed)
    }

    fn persistence_dir(&self) -> PathBuf {
        PathBuf::from(&self.inner.config.persistence.directory)
    }

    /// 注册任务并绑定处理函数
    ///
    /// 调度方式（cron / interval / delay）必须且只能指定一种；非法的
    /// CRON 表达式在注册时同步报错，不会等到首次执行。重复注册同名
    /// 任务是幂等的：记录警告但不报错。
    pub async fn add_job(
        &self,
        definition: JobDefinition,
        handler: Arc<dyn JobHandler>,
    ) -> LocalCloudResult<()> {
        validate_job_name(&definition.name)?;
        validate_schedule_kind(&definition)?;

        {
            let jobs = self.inner.jobs.read().await;
            if jobs.contains_key(&definition.name) {
                warn!("任务 '{}' 已存在，忽略重复注册", definition.name);
                return Ok(());
            }
        }

        let now = Utc::now();
        let mut job = ScheduledJob::from_definition(&definition, now);
        job.next_run = compute_next_run(
            &job,
            self.inner.config.restart_behavior.preserve_natural_timing,
            &self.inner.config.cron,
            now,
        );

        let name = definition.name.clone();
        let enabled = job.enabled;
        let next_run = job.next_run;
        let entry = Arc::new(JobEntry {
            name: name.clone(),
            definition,
            handler,
            state: Mutex::new(JobState {
                job,
                timer: None,
                running: false,
            }),
        });

        if enabled && !self.is_shutting_down() {
            let mut state = entry.state.lock().await;
            self.arm_timer_locked(&entry, &mut state);
        }

        self.inner
            .jobs
            .write()
            .await
            .insert(name.clone(), entry);
        info!("任务 '{name}' 已注册，下次执行时间 {next_run}");

        self.persist().await;
        Ok(())
    }

    /// 注销任务，取消其定时器
    pub async fn remove_job(&self, name: &str) -> LocalCloudResult<()> {
        let entry = {
            let mut jobs = self.inner.jobs.write().await;
            jobs.remove(name)
                .ok_or_else(|| LocalCloudError::job_not_found(name))?
        };

        {
            let mut state = entry.state.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            if state.running {
                warn!("任务 '{name}' 注销时仍在执行，当前执行不会被中断");
            }
        }

        info!("任务 '{name}' 已注销");
        self.persist().await;
        Ok(())
    }

    /// 启用任务并重新武装定时器
    pub async fn enable_job(&self, name: &str) -> LocalCloudResult<()> {
        let entry = self.get_entry(name).await?;
        {
            let mut state = entry.state.lock().await;
            if !state.job.enabled {
                state.job.enabled = true;
                let now = Utc::now();
                state.job.next_run = compute_next_run(
                    &state.job,
                    self.inner.config.restart_behavior.preserve_natural_timing,
                    &self.inner.config.cron,
                    now,
                );
                self.arm_timer_locked(&entry, &mut state);
                info!("任务 '{name}' 已启用，下次执行时间 {}", state.job.next_run);
            }
        }
        self.persist().await;
        Ok(())
    }

    /// 禁用任务并取消其定时器，在途执行不受影响
    pub async fn disable_job(&self, name: &str) -> LocalCloudResult<()> {
        let entry = self.get_entry(name).await?;
        {
            let mut state = entry.state.lock().await;
            state.job.enabled = false;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            info!("任务 '{name}' 已禁用");
        }
        self.persist().await;
        Ok(())
    }

    /// 手动触发一次执行
    ///
    /// 与定时触发走同一个闸门：关闭中、正在执行、已禁用或达到
    /// 并发上限时同样会被拒绝或延后。
    pub async fn trigger_job(&self, name: &str) -> LocalCloudResult<()> {
        let entry = self.get_entry(name).await?;
        {
            // 取消等待中的定时器，避免手动触发后产生一次过早的重复执行
            let mut state = entry.state.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
        let engine = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            engine.execute_job(&name, false).await;
        });
        Ok(())
    }

    pub async fn has_job(&self, name: &str) -> bool {
        self.inner.jobs.read().await.contains_key(name)
    }

    pub async fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.jobs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// 全部任务的当前快照（管理接口用，返回副本）
    pub async fn jobs(&self) -> Vec<ScheduledJob> {
        let entries: Vec<Arc<JobEntry>> = {
            let jobs = self.inner.jobs.read().await;
            jobs.values().cloned().collect()
        };
        let mut result = Vec::with_capacity(entries.len());
        for entry in entries {
            result.push(entry.state.lock().await.job.clone());
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    pub async fn job_stats(&self, name: &str) -> LocalCloudResult<JobStats> {
        let entry = self.get_entry(name).await?;
        let state = entry.state.lock().await;
        let job = state.job.clone();
        let running = state.running;
        drop(state);

        let (description, upcoming) = if let Some(expression) = &job.cron_expression {
            let upcoming = CronResolver::next_n(expression, 3).unwrap_or_default();
            (CronResolver::describe(expression), upcoming)
        } else if let Some(interval_ms) = job.interval_ms {
            let interval = chrono::Duration::milliseconds(interval_ms as i64);
            let upcoming = (0..3).map(|i| job.next_run + interval * i).collect();
            (format!("每 {interval_ms}ms 执行一次"), upcoming)
        } else {
            let upcoming = if job.reached_max_runs() {
                vec![]
            } else {
                vec![job.next_run]
            };
            ("一次性延迟任务".to_string(), upcoming)
        };

        Ok(JobStats {
            job,
            running,
            description,
            upcoming,
        })
    }

    /// 最近的执行历史（时间升序）
    pub async fn recent_executions(&self, limit: usize) -> Vec<JobExecution> {
        self.inner.executions.lock().await.recent(limit)
    }

    pub async fn running_executions(&self) -> Vec<JobExecution> {
        self.inner.executions.lock().await.running_executions()
    }

    /// 从磁盘恢复运行时状态，在全部任务注册完成后调用一次
    ///
    /// 按名称匹配快照中的任务：合并已恢复的计数器（last_run /
    /// run_count / 创建信息）到当前注册的定义，并对保存的下次执行
    /// 时间做对账（定义变更、过期、快速重启、漂移纠偏）。快照中
    /// 没有重新注册的任务将被丢弃。
    pub async fn restore_from_disk(&self) -> LocalCloudResult<()> {
        let persistence = &self.inner.config.persistence;
        if !persistence.enabled || !persistence.load_on_startup {
            return Ok(());
        }

        let snapshot = match load_scheduler_snapshot(&self.persistence_dir()) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!("无调度器快照，冷启动");
                self.inner.restored.store(true, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) => {
                warn!("加载调度器快照失败（按冷启动处理）: {e}");
                self.inner.restored.store(true, Ordering::Relaxed);
                return Ok(());
            }
        };

        let now = Utc::now();
        let behavior = &self.inner.config.restart_behavior;
        let jobs = self.inner.jobs.read().await;

        for saved in &snapshot.jobs {
            let Some(entry) = jobs.get(&saved.name) else {
                warn!("快照中的任务 '{}' 未重新注册，丢弃其状态", saved.name);
                continue;
            };

            let mut state = entry.state.lock().await;
            // 合并：保留当前定义的调度语义，恢复运行时计数器和身份
            state.job.id = saved.id.clone();
            state.job.created_at = saved.created_at;
            state.job.last_run = saved.last_run;
            state.job.run_count = saved.run_count;
            state.job.next_run = reconcile_next_run(
                &state.job,
                saved,
                &entry.definition,
                behavior,
                &self.inner.config.cron,
                snapshot.saved_at,
                now,
            );

            if state.job.enabled && !state.job.reached_max_runs() {
                self.arm_timer_locked(entry, &mut state);
            } else if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            info!(
                "任务 '{}' 已恢复: run_count={} 下次执行时间 {}",
                saved.name, state.job.run_count, state.job.next_run
            );
        }
        drop(jobs);

        self.inner
            .executions
            .lock()
            .await
            .restore(snapshot.executions);

        self.inner.restored.store(true, Ordering::Relaxed);
        self.persist().await;
        Ok(())
    }

    /// 优雅关闭：阻止新的执行，取消定时器和后台任务，等待在途
    /// 执行结束，最后写入最终快照（最多等待 30 秒）
    pub async fn shutdown(&self) {
        info!("调度引擎开始关闭");
        self.inner.shutting_down.store(true, Ordering::Relaxed);

        if let Some(handle) = self.inner.cleanup.lock().ok().and_then(|mut slot| slot.take()) {
            handle.abort();
        }
        if let Some(handle) = self.inner.autosave.lock().ok().and_then(|mut slot| slot.take()) {
            handle.abort();
        }

        let entries: Vec<Arc<JobEntry>> = {
            let jobs = self.inner.jobs.read().await;
            jobs.values().cloned().collect()
        };
        for entry in &entries {
            let mut state = entry.state.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }

        // 协作式等待：在途的任务执行不会被强制中断
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let running = self.inner.executions.lock().await.running_count();
            if running == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("等待在途执行超时（仍有 {running} 个），放弃等待");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let persistence = &self.inner.config.persistence;
        if persistence.enabled && persistence.save_on_shutdown {
            self.persist().await;
        }
        info!("调度引擎已关闭");
    }

    async fn get_entry(&self, name: &str) -> LocalCloudResult<Arc<JobEntry>> {
        self.inner
            .jobs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LocalCloudError::job_not_found(name))
    }

    /// 武装指向 next_run 的一次性定时器，替换已有的定时器
    ///
    /// 只能在持有任务状态锁且不在定时器任务自身内部时调用
    /// abort（见 execute_job 开头对 timer 槽位的清空约定）。
    fn arm_timer_locked(&self, entry: &Arc<JobEntry>, state: &mut JobState) {
        if let Some(old) = state.timer.take() {
            old.abort();
        }

        let delay = (state.job.next_run - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let engine = self.clone();
        let name = entry.name.clone();
        state.timer = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            engine.execute_job(&name, true).await;
        }));
    }

    /// 执行一次任务（定时器到期和手动触发的共同入口）
    ///
    /// 闸门按顺序：关闭中 → 上一次执行未结束 → 已禁用或达到次数
    /// 上限 → 全局并发上限（延后 30 秒重试）。通过闸门后在超时
    /// 约束下调用处理函数，结束时更新计数器并重新武装定时器。
    ///
    /// `from_timer` 标记调用来自定时器任务自身：此时 timer 槽位
    /// 只清空不 abort。手动触发路径则必须 abort，槽位里可能是
    /// 触发与取锁之间刚武装的新定时器。
    pub(crate) async fn execute_job(&self, name: &str, from_timer: bool) {
        if self.is_shutting_down() {
            debug!(
                "任务 '{name}' 的执行被拒绝: {}",
                LocalCloudError::ShuttingDown
            );
            return;
        }
        let Ok(entry) = self.get_entry(name).await else {
            debug!("任务 '{name}' 已注销，跳过执行");
            return;
        };

        let execution = {
            let mut state = entry.state.lock().await;
            if from_timer {
                state.timer = None;
            } else if let Some(timer) = state.timer.take() {
                timer.abort();
            }

            if state.running {
                warn!("任务 '{name}' 上一次执行尚未结束，跳过本次触发");
                return;
            }
            if !state.job.enabled || state.job.reached_max_runs() {
                debug!("任务 '{name}' 已禁用或达到次数上限，不再执行");
                return;
            }

            let mut executions = self.inner.executions.lock().await;
            if executions.running_count() >= self.inner.config.execution.max_concurrent {
                drop(executions);
                let next_run = Utc::now() + chrono::Duration::milliseconds(CONCURRENCY_DEFER_MS as i64);
                warn!(
                    "任务 '{name}' 被延后至 {next_run}: {}（上限 {}）",
                    LocalCloudError::ConcurrencyLimitReached,
                    self.inner.config.execution.max_concurrent
                );
                state.job.next_run = next_run;
                self.arm_timer_locked(&entry, &mut state);
                return;
            }

            state.running = true;
            let execution = JobExecution::start(&state.job.id);
            executions.record_start(execution.clone());
            execution
        };

        let start_time = execution.start_time;
        info!("任务 '{name}' 开始执行 (execution={})", execution.id);

        let timeout = Duration::from_millis(self.inner.config.execution.default_timeout_ms);
        let job_snapshot = entry.state.lock().await.job.clone();
        let outcome =
            tokio::time::timeout(timeout, entry.handler.execute(&job_snapshot, &execution)).await;

        let mut finished = execution;
        match outcome {
            Ok(Ok(result)) => {
                finished.complete(Some(result));
                info!(
                    "任务 '{name}' 执行成功，耗时 {}ms",
                    finished.duration_ms().unwrap_or(0)
                );
            }
            Ok(Err(e)) => {
                finished.fail(&e.to_string());
                warn!("任务 '{name}' 执行失败: {e}");
            }
            Err(_) => {
                let e = LocalCloudError::ExecutionTimeout {
                    job: name.to_string(),
                    timeout_ms: self.inner.config.execution.default_timeout_ms,
                };
                finished.fail(&e.to_string());
                warn!("任务 '{name}' 执行超时（{timeout:?}）");
            }
        }

        {
            let mut state = entry.state.lock().await;
            state.running = false;
            state.job.last_run = Some(start_time);
            state.job.run_count += 1;

            // 一次性延迟任务执行后即终结
            if state.job.delay_ms.is_some()
                && state.job.cron_expression.is_none()
                && state.job.interval_ms.is_none()
            {
                state.job.enabled = false;
            }

            if state.job.enabled && !state.job.reached_max_runs() && !self.is_shutting_down() {
                state.job.next_run = compute_next_run(
                    &state.job,
                    self.inner.config.restart_behavior.preserve_natural_timing,
                    &self.inner.config.cron,
                    Utc::now(),
                );
                self.arm_timer_locked(&entry, &mut state);
                debug!("任务 '{name}' 下次执行时间 {}", state.job.next_run);
            } else if state.job.reached_max_runs() {
                info!("任务 '{name}' 已达到运行次数上限，停止调度");
            }

            self.inner.executions.lock().await.record_finish(&finished);
        }

        self.persist().await;
    }

    /// 写入调度器快照；持久化失败只记录日志，内存状态仍是事实来源
    async fn persist(&self) {
        if !self.inner.config.persistence.enabled {
            return;
        }
        if !self.inner.restored.load(Ordering::Relaxed) {
            debug!("尚未完成状态恢复，跳过快照写入");
            return;
        }
        let jobs = self.jobs().await;
        let executions = self.inner.executions.lock().await.all();
        let snapshot = SchedulerSnapshot::new(jobs, executions);
        if let Err(e) = save_scheduler_snapshot(&self.persistence_dir(), &snapshot) {
            warn!("保存调度器快照失败: {e}");
        }
    }

    fn start_cleanup_task(&self) {
        let interval_ms = self.inner.config.cleanup.cleanup_interval_ms;
        if interval_ms == 0 {
            return;
        }
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.tick().await; // 首个tick立即返回，跳过
            loop {
                interval.tick().await;
                engine.inner.executions.lock().await.trim();
            }
        });
        if let Ok(mut slot) = self.inner.cleanup.lock() {
            *slot = Some(handle);
        }
    }

    fn start_autosave_task(&self) {
        let persistence = &self.inner.config.persistence;
        if !persistence.enabled || persistence.save_interval_ms == 0 {
            return;
        }
        let interval_ms = persistence.save_interval_ms;
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.tick().await; // 首个tick立即返回，跳过
            loop {
                interval.tick().await;
                engine.persist().await;
            }
        });
        if let Ok(mut slot) = self.inner.autosave.lock() {
            *slot = Some(handle);
        }
    }
}

/// 任务名称校验：非空，仅允许字母、数字、下划线和连字符
pub fn validate_job_name(name: &str) -> LocalCloudResult<()> {
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

/// 调度方式校验：cron / interval / delay 三者必须且只能指定一个
fn validate_schedule_kind(definition: &JobDefinition) -> LocalCloudResult<()> {
    let kinds = [
        definition.cron_expression.is_some(),
        definition.interval_ms.is_some(),
        definition.delay_ms.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();

    if kinds != 1 {
        return Err(LocalCloudError::configuration_error(format!(
            "任务 '{}' 必须且只能指定 cron、interval、delay 之一",
            definition.name
        )));
    }
    if let Some(expression) = &definition.cron_expression {
        if !CronResolver::is_valid(expression) {
            return Err(LocalCloudError::invalid_expression(
                expression,
                "无法解析的调度表达式",
            ));
        }
    }
    if definition.interval_ms == Some(0) {
        return Err(LocalCloudError::configuration_error(format!(
            "任务 '{}' 的执行间隔必须大于 0",
            definition.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_job_name() {
        assert!(validate_job_name("nightly-report").is_ok());
        assert!(validate_job_name("sync_v2").is_ok());
        assert!(validate_job_name("").is_err());
        assert!(validate_job_name("bad name").is_err());
    }

    #[test]
    fn test_validate_schedule_kind() {
        assert!(validate_schedule_kind(&JobDefinition::cron("a", "0 0 * * * *")).is_ok());
        assert!(validate_schedule_kind(&JobDefinition::interval("b", 1000)).is_ok());
        assert!(validate_schedule_kind(&JobDefinition::one_shot("c", 500)).is_ok());

        // 没有任何调度方式
        let mut none = JobDefinition::interval("d", 1000);
        none.interval_ms = None;
        assert!(validate_schedule_kind(&none).is_err());

        // 同时指定两种
        let mut both = JobDefinition::interval("e", 1000);
        both.delay_ms = Some(500);
        assert!(validate_schedule_kind(&both).is_err());

        // 非法 CRON 表达式
        assert!(validate_schedule_kind(&JobDefinition::cron("f", "not a cron")).is_err());

        // 间隔为 0
        assert!(validate_schedule_kind(&JobDefinition::interval("g", 0)).is_err());
    }
}
