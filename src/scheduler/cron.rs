//! 手写日历表达式解析器
//!
//! 接受 5 或 6 字段（空白分隔）：[秒] 分 时 日 月 周。
//! 每个字段支持 `*`、整数、逗号列表、`a-b` 区间（a <= b）、`base/n` 步进（n >= 1，
//! base 为 `*`、区间或整数）。5 字段时秒默认为 {0}。
//! 解析结果每个字段为排序去重的整数集合。

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression: expected 5 or 6 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field} field: {reason}")]
    Field { field: &'static str, reason: String },
}

/// 解析后的日历表达式：六组有效值集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    second: Vec<u32>,
    minute: Vec<u32>,
    hour: Vec<u32>,
    day: Vec<u32>,
    month: Vec<u32>,
    weekday: Vec<u32>,
}

const FIELD_NAMES: [&str; 6] = ["second", "minute", "hour", "day", "month", "weekday"];
const FIELD_RANGES: [(u32, u32); 6] = [(0, 59), (0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 && parts.len() != 6 {
            return Err(CronError::FieldCount(parts.len()));
        }

        // 5 字段时秒固定为 {0}
        let mut fields: Vec<Vec<u32>> = Vec::with_capacity(6);
        let offset = if parts.len() == 6 {
            fields.push(parse_field(parts[0], FIELD_NAMES[0], FIELD_RANGES[0])?);
            1
        } else {
            fields.push(vec![0]);
            0
        };
        for i in 1..6 {
            fields.push(parse_field(parts[i - 1 + offset], FIELD_NAMES[i], FIELD_RANGES[i])?);
        }

        let mut it = fields.into_iter();
        Ok(Self {
            second: it.next().unwrap_or_default(),
            minute: it.next().unwrap_or_default(),
            hour: it.next().unwrap_or_default(),
            day: it.next().unwrap_or_default(),
            month: it.next().unwrap_or_default(),
            weekday: it.next().unwrap_or_default(),
        })
    }

    /// from 之后（严格大于）的下一个匹配时刻
    ///
    /// 先前进一秒并截掉亚秒，然后逐秒扫描。逐秒扫描是可接受的：Next 只在任务
    /// 入队与触发后各调用一次。扫描上限约四年，防御永不匹配的日/月组合
    /// （如 2 月 30 日）。
    pub fn next<Tz: TimeZone>(&self, from: DateTime<Tz>) -> DateTime<Tz> {
        let mut t = from + Duration::seconds(1);
        if let Some(truncated) = t.with_nanosecond(0) {
            t = truncated;
        }

        const MAX_SCAN_SECS: i64 = 4 * 366 * 24 * 3600;
        for _ in 0..MAX_SCAN_SECS {
            if self.matches(&t) {
                return t;
            }
            t = t + Duration::seconds(1);
        }

        tracing::error!("cron schedule never matches within scan horizon");
        t
    }

    fn matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        if !self.second.contains(&t.second())
            || !self.minute.contains(&t.minute())
            || !self.hour.contains(&t.hour())
            || !self.month.contains(&t.month())
        {
            return false;
        }

        // 日与周的合取规则：两者都受限时须同时匹配；只一个受限时只看那个；
        // 都不受限则不约束（标准 cron 折衷）
        let day_matches = self.day.contains(&t.day());
        let weekday_matches = self.weekday.contains(&t.weekday().num_days_from_sunday());

        let day_specified = !is_full_range(&self.day, FIELD_RANGES[3]);
        let weekday_specified = !is_full_range(&self.weekday, FIELD_RANGES[5]);

        match (day_specified, weekday_specified) {
            (true, true) => day_matches && weekday_matches,
            (true, false) => day_matches,
            (false, true) => weekday_matches,
            (false, false) => true,
        }
    }

    #[cfg(test)]
    pub(crate) fn seconds(&self) -> &[u32] {
        &self.second
    }
}

fn is_full_range(values: &[u32], (min, max): (u32, u32)) -> bool {
    values.len() as u32 == max - min + 1
}

fn parse_field(field: &str, name: &'static str, (min, max): (u32, u32)) -> Result<Vec<u32>, CronError> {
    let err = |reason: String| CronError::Field { field: name, reason };

    if field == "*" {
        return Ok((min..=max).collect());
    }

    let mut values = Vec::new();
    for part in field.split(',') {
        if let Some((base, step)) = part.split_once('/') {
            let step: u32 = step
                .parse()
                .map_err(|_| err(format!("invalid step value: {}", part)))?;
            if step < 1 {
                return Err(err(format!("step must be >= 1: {}", part)));
            }

            let base_values: Vec<u32> = if base == "*" {
                (min..=max).collect()
            } else if base.contains('-') {
                parse_range(base, min, max).map_err(&err)?
            } else {
                let start: u32 = base
                    .parse()
                    .map_err(|_| err(format!("invalid base value: {}", base)))?;
                if start < min || start > max {
                    return Err(err(format!("value {} out of range [{}, {}]", start, min, max)));
                }
                (start..=max).collect()
            };
            values.extend(base_values.into_iter().step_by(step as usize));
        } else if part.contains('-') {
            values.extend(parse_range(part, min, max).map_err(&err)?);
        } else {
            let value: u32 = part
                .parse()
                .map_err(|_| err(format!("invalid value: {}", part)))?;
            if value < min || value > max {
                return Err(err(format!("value {} out of range [{}, {}]", value, min, max)));
            }
            values.push(value);
        }
    }

    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn parse_range(range: &str, min: u32, max: u32) -> Result<Vec<u32>, String> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| format!("invalid range format: {}", range))?;
    let start: u32 = start.parse().map_err(|_| format!("invalid range start: {}", range))?;
    let end: u32 = end.parse().map_err(|_| format!("invalid range end: {}", range))?;

    if start < min || start > max {
        return Err(format!("range start {} out of range [{}, {}]", start, min, max));
    }
    if end < min || end > max {
        return Err(format!("range end {} out of range [{}, {}]", end, min, max));
    }
    if start > end {
        return Err(format!("range start {} greater than end {}", start, end));
    }
    Ok((start..=end).collect())
}

/// 表达式是否合法
pub fn is_valid_expression(expr: &str) -> bool {
    CronSchedule::parse(expr).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_five_fields_default_second() {
        let schedule = CronSchedule::parse("30 12 * * *").unwrap();
        assert_eq!(schedule.seconds(), &[0]);
    }

    #[test]
    fn test_field_count_rejected() {
        assert!(matches!(CronSchedule::parse("* * *"), Err(CronError::FieldCount(3))));
        assert!(matches!(
            CronSchedule::parse("* * * * * * *"),
            Err(CronError::FieldCount(7))
        ));
    }

    #[test]
    fn test_lists_ranges_steps() {
        let schedule = CronSchedule::parse("0 1,3,5 2-4 */10 * *").unwrap();
        assert_eq!(schedule.minute, vec![1, 3, 5]);
        assert_eq!(schedule.hour, vec![2, 3, 4]);
        assert_eq!(schedule.day, vec![1, 11, 21, 31]);

        // base 为整数的步进：从 base 到上限
        let schedule = CronSchedule::parse("0 10/20 * * * *").unwrap();
        assert_eq!(schedule.minute, vec![10, 30, 50]);

        // base 为区间的步进
        let schedule = CronSchedule::parse("0 0-30/15 * * * *").unwrap();
        assert_eq!(schedule.minute, vec![0, 15, 30]);
    }

    #[test]
    fn test_invalid_fields() {
        assert!(CronSchedule::parse("60 * * * * *").is_err());
        assert!(CronSchedule::parse("* 24 * * *").is_err());  // hour 越界
        assert!(CronSchedule::parse("* * 0 * *").is_err());   // day 最小为 1
        assert!(CronSchedule::parse("* * * 13 *").is_err());
        assert!(CronSchedule::parse("* * * * 7").is_err());
        assert!(CronSchedule::parse("5-2 * * * *").is_err()); // 区间反向
        assert!(CronSchedule::parse("*/0 * * * *").is_err()); // 步长必须 >= 1
        assert!(CronSchedule::parse("abc * * * *").is_err());
    }

    #[test]
    fn test_literal_round_trip() {
        // 每个字面量只匹配该分钟值
        for m in [0u32, 17, 59] {
            let schedule = CronSchedule::parse(&format!("{} * * * *", m)).unwrap();
            assert_eq!(schedule.minute, vec![m]);

            let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let next = schedule.next(from);
            assert_eq!(next.minute(), m);
            assert_eq!(next.second(), 0);
        }
    }

    #[test]
    fn test_next_strictly_increases() {
        let schedule = CronSchedule::parse("* * * * * *").unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let t1 = schedule.next(t0);
        let t2 = schedule.next(t1);
        assert!(t1 > t0);
        assert!(t2 > t1);
        assert_eq!((t1 - t0).num_seconds(), 1);
    }

    #[test]
    fn test_next_skips_to_match() {
        // 每天 12:00:00
        let schedule = CronSchedule::parse("0 0 12 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap();
        let next = schedule.next(from);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_day_weekday_conjunction() {
        // 12:00，15 号且周一：两个字段都受限，须同时满足
        let schedule = CronSchedule::parse("0 12 15 * 1").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.next(from);

        assert_eq!(next.day(), 15);
        assert_eq!(next.weekday().num_days_from_sunday(), 1);
        assert_eq!(next.hour(), 12);
        // 2024-01-15 恰是周一
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_only_weekday_specified() {
        // 仅周字段受限：日字段为 * 时不参与判定
        let schedule = CronSchedule::parse("0 0 12 * * 0").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.next(from);
        // 2024-01-07 是周日
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 7, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_is_valid_expression() {
        assert!(is_valid_expression("* * * * *"));
        assert!(is_valid_expression("*/5 * * * * *"));
        assert!(!is_valid_expression("not a cron"));
    }
}
