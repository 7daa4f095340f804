//! 参与结构等价比较的字段白名单。
//!
//! # 教案式说明
//! - **意图 (Why)**：只有显式登记的字段才参与比较；新增字段默认不影响等价判定，
//!   需要参与时在对应表中追加一行即可；
//! - **逻辑 (How)**：每个实体类型一张静态表，元素为 `(字段名, 取值函数)`；取值函数把字段
//!   投影为带类型的 [`FieldValue`]，时间戳在投影时截断到 100ms 桶；
//! - **契约 (What)**：子步骤与自定义计时这类集合关系不在表中，由 [`crate::verify`] 的递归规则处理。

use std::fmt;

use chrono::{DateTime, Utc};
use spark_profiler::{CustomTiming, Session, Ticks, Timing};
use uuid::Uuid;

/// 时间戳比较粒度（毫秒）。
pub const TIMESTAMP_BUCKET_MILLIS: i64 = 100;

/// 字段名与取值函数。
pub type FieldAccessor<T> = (&'static str, fn(&T) -> FieldValue);

/// 投影后的字段值。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FieldValue {
    Text(String),
    OptionalText(Option<String>),
    Uuid(Uuid),
    Ticks(Ticks),
    OptionalTicks(Option<Ticks>),
    Flag(bool),
    /// 截断到 [`TIMESTAMP_BUCKET_MILLIS`] 的毫秒时间戳，保留原值用于诊断输出。
    Timestamp { bucket: i64, original: DateTime<Utc> },
}

impl FieldValue {
    pub fn timestamp(value: DateTime<Utc>) -> Self {
        Self::Timestamp {
            bucket: value.timestamp_millis().div_euclid(TIMESTAMP_BUCKET_MILLIS),
            original: value,
        }
    }

    /// 按比较语义判断相等：时间戳只比较所在桶。
    pub fn matches(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (Self::Timestamp { bucket: left, .. }, Self::Timestamp { bucket: right, .. }) => {
                left == right
            }
            (left, right) => left == right,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{text:?}"),
            Self::OptionalText(Some(text)) => write!(f, "Some({text:?})"),
            Self::OptionalText(None) | Self::OptionalTicks(None) => f.write_str("None"),
            Self::Uuid(id) => write!(f, "{id}"),
            Self::Ticks(ticks) => write!(f, "{} ticks", ticks.get()),
            Self::OptionalTicks(Some(ticks)) => write!(f, "Some({} ticks)", ticks.get()),
            Self::Flag(flag) => write!(f, "{flag}"),
            Self::Timestamp { original, .. } => {
                write!(f, "{}", original.format("%Y-%m-%dT%H:%M:%S%.3fZ"))
            }
        }
    }
}

pub static SESSION_FIELDS: &[FieldAccessor<Session>] = &[
    ("id", |session| FieldValue::Uuid(session.id)),
    ("name", |session| FieldValue::Text(session.name.clone())),
    ("started_at", |session| FieldValue::timestamp(session.started_at)),
    ("duration", |session| FieldValue::Ticks(session.duration)),
    ("machine_name", |session| {
        FieldValue::OptionalText(session.machine_name.clone())
    }),
    ("user", |session| FieldValue::OptionalText(session.user.clone())),
];

pub static TIMING_FIELDS: &[FieldAccessor<Timing>] = &[
    ("id", |timing| FieldValue::Uuid(timing.id)),
    ("name", |timing| FieldValue::Text(timing.name.clone())),
    ("start", |timing| FieldValue::Ticks(timing.start)),
    ("duration", |timing| FieldValue::Ticks(timing.duration)),
];

pub static CUSTOM_TIMING_FIELDS: &[FieldAccessor<CustomTiming>] = &[
    ("id", |entry| FieldValue::Uuid(entry.id)),
    ("command", |entry| FieldValue::OptionalText(entry.command.clone())),
    ("execute_type", |entry| {
        FieldValue::OptionalText(entry.execute_type.clone())
    }),
    ("start", |entry| FieldValue::Ticks(entry.start)),
    ("duration", |entry| FieldValue::Ticks(entry.duration)),
    ("first_fetch", |entry| FieldValue::OptionalTicks(entry.first_fetch)),
    ("errored", |entry| FieldValue::Flag(entry.errored)),
];

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_within_a_bucket_match() {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let early = FieldValue::timestamp(base + chrono::TimeDelta::milliseconds(20));
        let late = FieldValue::timestamp(base + chrono::TimeDelta::milliseconds(70));
        let next = FieldValue::timestamp(base + chrono::TimeDelta::milliseconds(100));
        assert!(early.matches(&late));
        assert!(!late.matches(&next));
        assert_ne!(early, late);
    }

    #[test]
    fn timestamps_before_epoch_truncate_downwards() {
        let before = Utc.timestamp_millis_opt(-150).unwrap();
        let also_before = Utc.timestamp_millis_opt(-110).unwrap();
        let after = Utc.timestamp_millis_opt(-50).unwrap();
        assert!(FieldValue::timestamp(before).matches(&FieldValue::timestamp(also_before)));
        assert!(!FieldValue::timestamp(before).matches(&FieldValue::timestamp(after)));
    }

    #[test]
    fn display_is_readable() {
        assert_eq!(FieldValue::Text("load".into()).to_string(), "\"load\"");
        assert_eq!(FieldValue::OptionalTicks(None).to_string(), "None");
        assert_eq!(
            FieldValue::Ticks(Ticks::from_millis(2)).to_string(),
            "20000 ticks"
        );
    }
}
