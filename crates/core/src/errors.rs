use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalCloudError {
    #[error("无效的名称: {name} - {reason}")]
    InvalidName { name: String, reason: String },
    #[error("无效的调度表达式: {expr} - {message}")]
    InvalidExpression { expr: String, message: String },
    #[error("任务执行超时: {job} (超时时间 {timeout_ms}ms)")]
    ExecutionTimeout { job: String, timeout_ms: u64 },
    #[error("处理函数执行失败: {0}")]
    HandlerFailure(String),
    #[error("队列未找到: {name}")]
    QueueNotFound { name: String },
    #[error("任务未找到: {name}")]
    JobNotFound { name: String },
    #[error("持久化错误: {0}")]
    Persistence(String),
    #[error("已达到并发上限，任务被延后")]
    ConcurrencyLimitReached,
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("系统正在关闭")]
    ShuttingDown,
}

pub type LocalCloudResult<T> = Result<T, LocalCloudError>;

impl LocalCloudError {
    pub fn invalid_name<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_expression<E: Into<String>, M: Into<String>>(expr: E, message: M) -> Self {
        Self::InvalidExpression {
            expr: expr.into(),
            message: message.into(),
        }
    }

    pub fn queue_not_found<S: Into<String>>(name: S) -> Self {
        Self::QueueNotFound { name: name.into() }
    }

    pub fn job_not_found<S: Into<String>>(name: S) -> Self {
        Self::JobNotFound { name: name.into() }
    }

    pub fn handler_failure<S: Into<String>>(msg: S) -> Self {
        Self::HandlerFailure(msg.into())
    }

    pub fn persistence_error<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn configuration_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
}

impl From<std::io::Error> for LocalCloudError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for LocalCloudError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
