use std::str::FromStr;

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::{debug, warn};

use localcloud_core::{LocalCloudError, LocalCloudResult};

/// 表达式类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionType {
    Cron,
    Rate,
    Unknown,
}

/// 解析选项
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// IANA时区名，未指定或无法识别时按UTC计算
    pub timezone: Option<String>,
    /// 为 true 且提供了 last_run 时，以 last_run 为锚点计算下一次执行，
    /// 保持调度的自然节奏（例如始终落在整点）
    pub preserve_natural_timing: bool,
    /// 计算基准时间，默认为当前时间
    pub current_date: Option<DateTime<Utc>>,
}

/// 解析结果
///
/// `resolve` 永远不会返回错误：表达式非法时 `valid` 为 false，
/// `next_run` 回退为下一个整点，由调用方记录日志而不中断。
#[derive(Debug, Clone)]
pub struct Resolution {
    pub next_run: DateTime<Utc>,
    pub valid: bool,
    pub description: String,
}

/// CRON / rate 表达式解析器
///
/// 接受5/6/7字段的CRON语法，以及云风格的 `rate(N unit)` 简写。
/// rate 表达式会被确定性地编译为等价的CRON表达式。
pub struct CronResolver;

impl CronResolver {
    /// 计算表达式在 `current_date` 之后的下一次执行时间
    pub fn resolve(
        expression: &str,
        last_run: Option<DateTime<Utc>>,
        options: &ResolveOptions,
    ) -> Resolution {
        let now = options.current_date.unwrap_or_else(Utc::now);

        let normalized = match normalize_expression(expression) {
            Ok(normalized) => normalized,
            Err(e) => {
                warn!("调度表达式非法，回退到下一个整点: {}", e);
                return Resolution {
                    next_run: fallback_next_hour(now),
                    valid: false,
                    description: format!("无效表达式: {expression}"),
                };
            }
        };

        let schedule = match Schedule::from_str(&normalized) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!("CRON表达式解析失败 '{normalized}': {e}，回退到下一个整点");
                return Resolution {
                    next_run: fallback_next_hour(now),
                    valid: false,
                    description: format!("无效表达式: {expression}"),
                };
            }
        };

        let tz = resolve_timezone(options.timezone.as_deref());
        let anchor = if options.preserve_natural_timing {
            last_run.unwrap_or(now)
        } else {
            now
        };

        // 从锚点向后找，跳过所有已过期的候选时间，保证结果严格在未来
        let next_run = schedule
            .after(&anchor.with_timezone(&tz))
            .map(|t| t.with_timezone(&Utc))
            .find(|t| *t > now);

        match next_run {
            Some(next_run) => Resolution {
                next_run,
                valid: true,
                description: describe_schedule(&schedule, now),
            },
            None => {
                // 表达式合法但不再有未来的执行时间（例如指定了过去的年份）
                warn!("表达式 '{expression}' 没有未来的执行时间，回退到下一个整点");
                Resolution {
                    next_run: fallback_next_hour(now),
                    valid: false,
                    description: format!("无未来执行时间: {expression}"),
                }
            }
        }
    }

    /// 计算接下来的 count 次执行时间
    pub fn next_n(expression: &str, count: usize) -> LocalCloudResult<Vec<DateTime<Utc>>> {
        let normalized = normalize_expression(expression)?;
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| LocalCloudError::invalid_expression(expression, e.to_string()))?;
        Ok(schedule.upcoming(Utc).take(count).collect())
    }

    /// 校验表达式是否合法（CRON或rate）
    pub fn is_valid(expression: &str) -> bool {
        match normalize_expression(expression) {
            Ok(normalized) => Schedule::from_str(&normalized).is_ok(),
            Err(_) => false,
        }
    }

    /// 识别表达式类型
    pub fn detect_type(expression: &str) -> ExpressionType {
        let trimmed = expression.trim();
        if trimmed.starts_with("rate(") && trimmed.ends_with(')') {
            return ExpressionType::Rate;
        }
        let fields = trimmed.split_whitespace().count();
        if (5..=7).contains(&fields) && Self::is_valid(trimmed) {
            return ExpressionType::Cron;
        }
        ExpressionType::Unknown
    }

    /// 生成人类可读的频率描述
    pub fn describe(expression: &str) -> String {
        match normalize_expression(expression)
            .ok()
            .and_then(|n| Schedule::from_str(&n).ok())
        {
            Some(schedule) => describe_schedule(&schedule, Utc::now()),
            None => format!("无效表达式: {expression}"),
        }
    }
}

/// 将5/6/7字段CRON或rate表达式规范化为 `cron` crate 可解析的形式
///
/// 5字段表达式补充秒字段；rate表达式编译为等价CRON。其余字段数非法。
pub fn normalize_expression(expression: &str) -> LocalCloudResult<String> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(LocalCloudError::invalid_expression(expression, "表达式为空"));
    }

    if trimmed.starts_with("rate(") {
        return rate_to_cron(trimmed);
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {trimmed}")),
        6 | 7 => Ok(trimmed.to_string()),
        n => Err(LocalCloudError::invalid_expression(
            expression,
            format!("字段数必须为5、6或7，实际为{n}"),
        )),
    }
}

/// 将 `rate(N unit)` 编译为等价的6字段CRON表达式
///
/// 转换是全函数且纯函数：
/// - 分钟: 1..=59
/// - 小时: 1..=23，或24的倍数（折算为天）
/// - 天: 1..=365
pub fn rate_to_cron(expression: &str) -> LocalCloudResult<String> {
    let trimmed = expression.trim();
    let inner = trimmed
        .strip_prefix("rate(")
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| LocalCloudError::invalid_expression(expression, "rate语法格式错误"))?;

    let parts: Vec<&str> = inner.split_whitespace().collect();
    if parts.len() != 2 {
        return Err(LocalCloudError::invalid_expression(
            expression,
            "rate语法应为 rate(N unit)",
        ));
    }

    let value: u64 = parts[0].parse().map_err(|_| {
        LocalCloudError::invalid_expression(expression, format!("无效的数值: {}", parts[0]))
    })?;
    if value == 0 {
        return Err(LocalCloudError::invalid_expression(expression, "数值必须为正整数"));
    }

    match parts[1] {
        "minute" | "minutes" => {
            if value > 59 {
                return Err(LocalCloudError::invalid_expression(
                    expression,
                    "分钟数不能超过59",
                ));
            }
            Ok(format!("0 */{value} * * * *"))
        }
        "hour" | "hours" => {
            if value <= 23 {
                Ok(format!("0 0 */{value} * * *"))
            } else if value % 24 == 0 {
                let days = value / 24;
                if days > 365 {
                    return Err(LocalCloudError::invalid_expression(
                        expression,
                        "折算天数不能超过365",
                    ));
                }
                Ok(format!("0 0 0 */{days} * *"))
            } else {
                Err(LocalCloudError::invalid_expression(
                    expression,
                    "超过23的小时数必须是24的倍数",
                ))
            }
        }
        "day" | "days" => {
            if value > 365 {
                return Err(LocalCloudError::invalid_expression(
                    expression,
                    "天数不能超过365",
                ));
            }
            Ok(format!("0 0 0 */{value} * *"))
        }
        unit => Err(LocalCloudError::invalid_expression(
            expression,
            format!("不支持的时间单位: {unit}"),
        )),
    }
}

/// 解析失败时的兜底时间：下一个整点
pub fn fallback_next_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    truncated + Duration::hours(1)
}

fn resolve_timezone(timezone: Option<&str>) -> Tz {
    match timezone {
        Some(name) => match Tz::from_str(name) {
            Ok(tz) => tz,
            Err(_) => {
                warn!("无法识别的时区 '{name}'，按UTC计算");
                Tz::UTC
            }
        },
        None => Tz::UTC,
    }
}

/// 基于接下来两次执行时间的间隔给出频率描述
fn describe_schedule(schedule: &Schedule, from: DateTime<Utc>) -> String {
    let upcoming: Vec<DateTime<Utc>> = schedule.after(&from).take(2).collect();
    if upcoming.len() < 2 {
        return "无法确定频率".to_string();
    }
    let seconds = (upcoming[1] - upcoming[0]).num_seconds();
    debug!("调度频率间隔: {seconds}秒");
    match seconds {
        s if s < 60 => format!("每{s}秒"),
        s if s < 3600 => format!("每{}分钟", s / 60),
        s if s < 86400 => format!("每{}小时", s / 3600),
        s if s < 604800 => format!("每{}天", s / 86400),
        s => format!("每{}周", s / 604800),
    }
}
