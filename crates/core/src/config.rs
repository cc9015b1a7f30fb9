use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::LocalCloudError;

/// 应用配置：队列引擎 + 调度引擎 + 日志
///
/// 所有字段都有默认值，配置文件只需覆盖需要修改的部分。
/// 加载顺序：默认值 -> TOML文件 -> `LOCALCLOUD_` 环境变量。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 单批最多投递的消息数
    pub batch_size: usize,
    /// 自动触发批处理前的最大等待时间
    pub batch_window_ms: u64,
    /// 消息进入死信队列前允许的最大重试次数
    pub max_retries: u32,
    /// 批内消息是否并行投递
    pub parallel: bool,
    /// 单队列同时投递的消息数上限
    pub max_concurrent: usize,
    /// 重试是否采用指数退避（2^attempts * 100ms）
    pub retry_backoff: bool,
    pub persistence: PersistenceConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_window_ms: 1000,
            max_retries: 3,
            parallel: true,
            max_concurrent: 5,
            retry_backoff: true,
            persistence: PersistenceConfig {
                directory: ".localcloud/queues".to_string(),
                ..PersistenceConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub directory: String,
    pub save_interval_ms: u64,
    pub save_on_shutdown: bool,
    pub load_on_startup: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: ".localcloud".to_string(),
            save_interval_ms: 5000,
            save_on_shutdown: true,
            load_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub persistence: PersistenceConfig,
    pub execution: ExecutionConfig,
    pub cleanup: CleanupConfig,
    pub restart_behavior: RestartBehaviorConfig,
    pub cron: CronConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceConfig {
                directory: ".localcloud/scheduler".to_string(),
                ..PersistenceConfig::default()
            },
            execution: ExecutionConfig::default(),
            cleanup: CleanupConfig::default(),
            restart_behavior: RestartBehaviorConfig::default(),
            cron: CronConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// 全局同时运行的任务数上限
    pub max_concurrent: usize,
    /// 单次执行的超时时间
    pub default_timeout_ms: u64,
    pub retry_on_error: bool,
    pub max_retries: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            default_timeout_ms: 60_000,
            retry_on_error: false,
            max_retries: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// 执行历史保留的最大条数（环形缓冲语义）
    pub max_execution_history: usize,
    pub cleanup_interval_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_execution_history: 100,
            cleanup_interval_ms: 60_000,
        }
    }
}

/// 重启行为：决定恢复持久化任务时如何处理保存的 next_run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartBehaviorConfig {
    /// 以 last_run 为锚点计算下次执行，保持调度的自然节奏
    pub preserve_natural_timing: bool,
    /// 跳过停机期间错过的执行，而不是补跑
    pub skip_missed_runs: bool,
    /// 保存值与理论值的偏差超过该阈值时采用重新计算的值
    pub max_timing_drift_ms: u64,
    /// 距上次停机小于该阈值的重启视为快速重载，直接信任保存值
    pub rapid_restart_threshold_ms: u64,
}

impl Default for RestartBehaviorConfig {
    fn default() -> Self {
        Self {
            preserve_natural_timing: true,
            skip_missed_runs: true,
            max_timing_drift_ms: 60_000,
            rapid_restart_threshold_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    pub default_timezone: String,
    pub log_cron_details: bool,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            default_timezone: "UTC".to_string(),
            log_cron_details: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/localcloud.toml", "localcloud.toml"];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("LOCALCLOUD")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LocalCloudError> {
        if self.queue.batch_size == 0 {
            return Err(LocalCloudError::configuration_error(
                "queue.batch_size 必须大于0",
            ));
        }
        if self.queue.max_concurrent == 0 {
            return Err(LocalCloudError::configuration_error(
                "queue.max_concurrent 必须大于0",
            ));
        }
        if self.scheduler.execution.max_concurrent == 0 {
            return Err(LocalCloudError::configuration_error(
                "scheduler.execution.max_concurrent 必须大于0",
            ));
        }
        if self.scheduler.execution.default_timeout_ms == 0 {
            return Err(LocalCloudError::configuration_error(
                "scheduler.execution.default_timeout_ms 必须大于0",
            ));
        }
        if self.scheduler.cleanup.max_execution_history == 0 {
            return Err(LocalCloudError::configuration_error(
                "scheduler.cleanup.max_execution_history 必须大于0",
            ));
        }
        if self.scheduler.restart_behavior.max_timing_drift_ms == 0 {
            return Err(LocalCloudError::configuration_error(
                "scheduler.restart_behavior.max_timing_drift_ms 必须大于0",
            ));
        }
        for (label, persistence) in [
            ("queue", &self.queue.persistence),
            ("scheduler", &self.scheduler.persistence),
        ] {
            if persistence.enabled && persistence.directory.trim().is_empty() {
                return Err(LocalCloudError::configuration_error(format!(
                    "{label}.persistence.directory 启用持久化时不能为空"
                )));
            }
        }
        match self.log.format.as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(LocalCloudError::configuration_error(format!(
                    "不支持的日志格式: {other}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.scheduler.execution.max_concurrent, 10);
        assert_eq!(config.scheduler.restart_behavior.rapid_restart_threshold_ms, 30_000);
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("localcloud.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[queue]\nbatch_size = 25\n").unwrap();

        let config = AppConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.queue.batch_size, 25);
        // 未覆盖的字段保持默认值
        assert_eq!(config.queue.max_retries, 3);
        assert!(config.queue.parallel);
    }

    #[test]
    fn test_invalid_batch_size_rejected() {
        let mut config = AppConfig::default();
        config.queue.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_config_file_errors() {
        assert!(AppConfig::load(Some("/nonexistent/localcloud.toml")).is_err());
    }

    #[test]
    fn test_empty_persistence_directory_rejected() {
        let mut config = AppConfig::default();
        config.scheduler.persistence.directory = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
