use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use localcloud_core::{CronConfig, JobDefinition, RestartBehaviorConfig, ScheduledJob};

use crate::cron_utils::{CronResolver, ResolveOptions};

/// 计算任务的下一次执行时间
///
/// CRON任务交给解析器；间隔任务在保持自然节奏时以 last_run 为锚点
/// 取第一个严格在未来的网格点（`last_run + k * interval`），否则从
/// 当前时间顺延；一次性延迟任务从当前时间顺延。
pub fn compute_next_run(
    job: &ScheduledJob,
    preserve_natural_timing: bool,
    cron_config: &CronConfig,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if let Some(expression) = &job.cron_expression {
        let options = ResolveOptions {
            timezone: job
                .timezone
                .clone()
                .or_else(|| Some(cron_config.default_timezone.clone())),
            preserve_natural_timing,
            current_date: Some(now),
        };
        let resolution = CronResolver::resolve(expression, job.last_run, &options);
        if !resolution.valid {
            warn!(
                "任务 '{}' 的表达式 '{}' 无效，使用回退时间 {}",
                job.name, expression, resolution.next_run
            );
        }
        return resolution.next_run;
    }

    if let Some(interval_ms) = job.interval_ms {
        let interval = Duration::milliseconds(interval_ms.max(1) as i64);
        if preserve_natural_timing {
            if let Some(last_run) = job.last_run {
                // 沿 last_run 网格向前滚动到第一个未来时间点
                let elapsed = now - last_run;
                let steps = (elapsed.num_milliseconds() / interval.num_milliseconds()).max(0) + 1;
                return last_run + interval * steps as i32;
            }
        }
        return now + interval;
    }

    let delay_ms = job.delay_ms.unwrap_or(0);
    now + Duration::milliseconds(delay_ms as i64)
}

/// 重启恢复：决定持久化的 next_run 是保留、重算还是纠偏
///
/// `job` 是合并后的任务（当前注册的定义 + 恢复的 last_run/run_count），
/// `saved` 是磁盘上的原始记录。规则按优先级：
/// 1. 定义已变更（调度语义不同）→ 忽略保存值，按新定义从 last_run 重算
/// 2. 保存值已过期 → 重算
/// 3. 距上次停机在快速重启阈值内 → 原样信任保存值
/// 4. 与理论值偏差超过漂移阈值 → 采用重算值（自愈纠偏），否则保留
pub fn reconcile_next_run(
    job: &ScheduledJob,
    saved: &ScheduledJob,
    definition: &JobDefinition,
    behavior: &RestartBehaviorConfig,
    cron_config: &CronConfig,
    saved_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if !saved.matches_definition(definition) {
        info!(
            "任务 '{}' 的定义已变更，忽略保存的下次执行时间并重新计算",
            saved.name
        );
        return compute_next_run(job, behavior.preserve_natural_timing, cron_config, now);
    }

    if saved.next_run <= now {
        debug!(
            "任务 '{}' 保存的下次执行时间 {} 已过期，重新计算",
            saved.name, saved.next_run
        );
        return compute_next_run(job, behavior.preserve_natural_timing, cron_config, now);
    }

    let downtime = now - saved_at;
    if downtime <= Duration::milliseconds(behavior.rapid_restart_threshold_ms as i64) {
        debug!(
            "任务 '{}' 处于快速重启窗口内（停机 {}ms），信任保存值 {}",
            saved.name,
            downtime.num_milliseconds(),
            saved.next_run
        );
        return saved.next_run;
    }

    let theoretical = compute_next_run(job, behavior.preserve_natural_timing, cron_config, now);
    let drift = (saved.next_run - theoretical).num_milliseconds().abs();
    if drift > behavior.max_timing_drift_ms as i64 {
        warn!(
            "任务 '{}' 保存值 {} 与理论值 {} 偏差 {}ms 超过阈值，采用重算值",
            saved.name, saved.next_run, theoretical, drift
        );
        theoretical
    } else {
        debug!(
            "任务 '{}' 保存值与理论值偏差 {}ms 在容忍范围内，保留保存值",
            saved.name, drift
        );
        saved.next_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn at(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn hourly_job(last_run: Option<DateTime<Utc>>, next_run: DateTime<Utc>) -> (ScheduledJob, JobDefinition) {
        let definition = JobDefinition::cron("sync", "0 0 * * * *");
        let mut job = ScheduledJob::from_definition(&definition, next_run);
        job.last_run = last_run;
        (job, definition)
    }

    fn behavior() -> RestartBehaviorConfig {
        RestartBehaviorConfig::default() // drift 60s, rapid restart 30s
    }

    #[test]
    fn test_compute_next_run_interval_natural_grid() {
        let definition = JobDefinition::interval("poll", 60_000);
        let mut job = ScheduledJob::from_definition(&definition, at("2025-01-01 00:00:00"));
        job.last_run = Some(at("2025-01-01 00:00:00"));

        // 停机3.5个周期后，下一个网格点是 last_run + 4 * interval
        let next = compute_next_run(&job, true, &CronConfig::default(), at("2025-01-01 00:03:30"));
        assert_eq!(next, at("2025-01-01 00:04:00"));

        // 不保持自然节奏时从当前时间顺延
        let next = compute_next_run(&job, false, &CronConfig::default(), at("2025-01-01 00:03:30"));
        assert_eq!(next, at("2025-01-01 00:04:30"));
    }

    #[test]
    fn test_definition_change_forces_recompute() {
        let now = at("2025-01-01 10:40:00");
        let (saved, _) = hourly_job(Some(at("2025-01-01 10:00:00")), at("2025-01-01 20:00:00"));
        // 定义从整点改为半点：保存值被忽略，按新定义从 last_run 重算
        let changed = JobDefinition::cron("sync", "0 30 * * * *");
        let mut merged = ScheduledJob::from_definition(&changed, saved.next_run);
        merged.last_run = saved.last_run;

        let next = reconcile_next_run(
            &merged,
            &saved,
            &changed,
            &behavior(),
            &CronConfig::default(),
            now,
            now,
        );
        assert_eq!(next, at("2025-01-01 11:30:00"));
    }

    #[test]
    fn test_stale_next_run_recomputed() {
        let now = at("2025-01-01 10:30:00");
        let (saved, definition) =
            hourly_job(Some(at("2025-01-01 08:00:00")), at("2025-01-01 09:00:00"));
        let next = reconcile_next_run(
            &saved,
            &saved,
            &definition,
            &behavior(),
            &CronConfig::default(),
            now,
            now,
        );
        assert_eq!(next, at("2025-01-01 11:00:00"));
    }

    #[test]
    fn test_rapid_restart_trusts_saved_value() {
        let now = at("2025-01-01 10:00:10");
        let saved_at = at("2025-01-01 10:00:00"); // 10秒前停机，阈值30秒内
        // 保存值明显偏离整点网格，但快速重启时原样信任
        let (saved, definition) =
            hourly_job(Some(at("2025-01-01 09:58:00")), at("2025-01-01 10:42:00"));
        let next = reconcile_next_run(
            &saved,
            &saved,
            &definition,
            &behavior(),
            &CronConfig::default(),
            saved_at,
            now,
        );
        assert_eq!(next, at("2025-01-01 10:42:00"));
    }

    #[test]
    fn test_drift_beyond_threshold_corrected() {
        // 保存的 next_run 在未来10分钟，但停机2小时（超出快速重启阈值），
        // 理论值与保存值偏差超过60秒 → 采用重算值
        let now = at("2025-01-01 12:00:00");
        let saved_at = at("2025-01-01 10:00:00");
        let (saved, definition) =
            hourly_job(Some(at("2025-01-01 09:00:00")), at("2025-01-01 12:10:00"));
        let next = reconcile_next_run(
            &saved,
            &saved,
            &definition,
            &behavior(),
            &CronConfig::default(),
            saved_at,
            now,
        );
        assert_eq!(next, at("2025-01-01 13:00:00"));
    }

    #[test]
    fn test_small_drift_keeps_saved_value() {
        // 偏差在阈值内：保留保存值，容忍小的时钟偏移
        let now = at("2025-01-01 12:00:00");
        let saved_at = at("2025-01-01 10:00:00");
        let (saved, definition) = hourly_job(
            Some(at("2025-01-01 09:00:00")),
            at("2025-01-01 13:00:30"), // 与理论值 13:00:00 偏差30秒
        );
        let next = reconcile_next_run(
            &saved,
            &saved,
            &definition,
            &behavior(),
            &CronConfig::default(),
            saved_at,
            now,
        );
        assert_eq!(next, at("2025-01-01 13:00:30"));
    }
}
