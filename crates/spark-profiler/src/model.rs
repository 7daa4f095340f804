//! # 剖析会话数据模型
//!
//! ## 核心意图（Why）
//! - 将一次请求的测量结果表达为不可变的值对象树：[`Session`] 拥有唯一的根 [`Timing`]，
//!   每个 [`Timing`] 独占其子步骤与按分类分组的 [`CustomTiming`] 列表；
//! - 会话停止后才会产出这些值，因此模型本身不承担“打开/关闭”语义，构建期状态见 [`crate::session`]。
//!
//! ## 契约（What）
//! - `start` 为相对会话起点的偏移，`duration` 为关闭时刻减去 `start`；
//! - `children` 与每个分类下的条目都保持创建顺序，结构等价校验依赖该顺序做位置比较；
//! - `started_at` 以毫秒精度序列化，往返后会丢失亚毫秒部分。

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Ticks;

/// 一个被测量的步骤。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub id: Uuid,
    pub name: String,
    pub start: Ticks,
    pub duration: Ticks,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Timing>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_timings: BTreeMap<String, Vec<CustomTiming>>,
}

impl Timing {
    /// 关闭时刻（相对会话起点）。
    pub fn stop(&self) -> Ticks {
        self.start + self.duration
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn has_custom_timings(&self) -> bool {
        self.custom_timings.values().any(|entries| !entries.is_empty())
    }

    /// 扣除直接子步骤后的自身耗时。
    ///
    /// 子步骤之间不重叠，因此直接求和即可。
    pub fn duration_without_children(&self) -> Ticks {
        let children = self
            .children
            .iter()
            .fold(Ticks::ZERO, |acc, child| acc + child.duration);
        self.duration - children
    }

    /// 耗时是否低于 `threshold_ms`。
    pub fn is_trivial(&self, threshold_ms: f64) -> bool {
        self.duration.as_millis_f64() < threshold_ms
    }

    pub fn custom_timing_count(&self) -> usize {
        self.custom_timings.values().map(Vec::len).sum()
    }

    /// 先序遍历整棵子树，附带相对本节点的深度。
    pub fn descendants(&self) -> TimingHierarchy<'_> {
        TimingHierarchy {
            pending: vec![(0, self)],
        }
    }
}

/// 挂在某个步骤下的叶子级计时，例如一次 SQL 或外部 HTTP 调用。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomTiming {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_type: Option<String>,
    pub start: Ticks,
    pub duration: Ticks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_fetch: Option<Ticks>,
    #[serde(default)]
    pub errored: bool,
}

/// 一次完整的剖析运行。
///
/// # 教案式说明
/// - **意图 (Why)**：作为停止后的不可变聚合根，交给存储或结构等价校验器；
/// - **契约 (What)**：`duration` 恒等于 `root.duration`；`name` 记录发起请求的描述；
/// - **风险 (Trade-offs)**：字段公开以便序列化与测试构造变体，调用方修改副本后需自行维护上述等式。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    pub duration: Ticks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub root: Timing,
}

impl Session {
    /// 先序遍历全部步骤，根节点深度为 0。
    pub fn hierarchy(&self) -> TimingHierarchy<'_> {
        self.root.descendants()
    }

    /// 按名称查找第一个匹配的步骤（先序）。
    pub fn find_timing(&self, name: &str) -> Option<&Timing> {
        self.hierarchy()
            .map(|(_, timing)| timing)
            .find(|timing| timing.name == name)
    }

    pub fn timing_count(&self) -> usize {
        self.hierarchy().count()
    }

    /// 渲染缩进文本树，便于写入日志。
    ///
    /// 每行形如 `> step = 1.5ms`，自定义计时以 `(category: n)` 的形式追加在行尾。
    pub fn render_plain_text(&self, decimal_places: usize) -> String {
        self.render_filtered(decimal_places, 0.0)
    }

    /// 与 [`render_plain_text`](Self::render_plain_text) 相同，但省略耗时低于 `trivial_ms`
    /// 且既无子步骤也无自定义计时的叶子步骤；根步骤始终输出。
    pub fn render_filtered(&self, decimal_places: usize, trivial_ms: f64) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "{} at {}",
            self.machine_name.as_deref().unwrap_or("unknown"),
            self.started_at.format("%Y-%m-%d %H:%M:%S%.3f UTC")
        );
        for (depth, timing) in self.hierarchy() {
            let hidden = depth > 0
                && timing.is_trivial(trivial_ms)
                && !timing.has_children()
                && !timing.has_custom_timings();
            if hidden {
                continue;
            }
            out.push('\n');
            for _ in 0..depth {
                out.push('>');
            }
            if depth > 0 {
                out.push(' ');
            }
            let _ = write!(
                out,
                "{} = {:.*}ms",
                timing.name,
                decimal_places,
                timing.duration.as_millis_f64()
            );
            for (category, entries) in &timing.custom_timings {
                if !entries.is_empty() {
                    let _ = write!(out, " ({category}: {})", entries.len());
                }
            }
        }
        out
    }
}

/// [`Timing`] 树的先序迭代器，产出 `(深度, 节点)`。
pub struct TimingHierarchy<'a> {
    pending: Vec<(usize, &'a Timing)>,
}

impl<'a> Iterator for TimingHierarchy<'a> {
    type Item = (usize, &'a Timing);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, timing) = self.pending.pop()?;
        self.pending
            .extend(timing.children.iter().rev().map(|child| (depth + 1, child)));
        Some((depth, timing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn leaf(name: &str, start: u64, duration: u64) -> Timing {
        Timing {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            start: Ticks::from_millis(start),
            duration: Ticks::from_millis(duration),
            children: Vec::new(),
            custom_timings: BTreeMap::new(),
        }
    }

    fn sample() -> Session {
        let mut inner = leaf("inner", 1, 2);
        inner.custom_timings.insert(
            "sql".to_owned(),
            vec![CustomTiming {
                id: Uuid::new_v4(),
                command: Some("select 1".to_owned()),
                execute_type: None,
                start: Ticks::from_millis(1),
                duration: Ticks::from_millis(1),
                first_fetch: None,
                errored: false,
            }],
        );
        let mut outer = leaf("outer", 0, 4);
        outer.children.push(inner);
        outer.children.push(leaf("tail", 3, 1));
        let mut root = leaf("/home", 0, 5);
        root.children.push(outer);
        Session {
            id: Uuid::new_v4(),
            name: "/home".to_owned(),
            started_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            duration: root.duration,
            machine_name: Some("web-01".to_owned()),
            user: None,
            root,
        }
    }

    #[test]
    fn hierarchy_is_preorder_with_depth() {
        let session = sample();
        let visited: Vec<(usize, &str)> = session
            .hierarchy()
            .map(|(depth, timing)| (depth, timing.name.as_str()))
            .collect();
        assert_eq!(
            visited,
            vec![(0, "/home"), (1, "outer"), (2, "inner"), (2, "tail")]
        );
        assert_eq!(session.timing_count(), 4);
    }

    #[test]
    fn derived_durations() {
        let session = sample();
        let outer = session.find_timing("outer").unwrap();
        assert_eq!(outer.duration_without_children(), Ticks::from_millis(1));
        assert_eq!(outer.stop(), Ticks::from_millis(4));
        assert!(session.find_timing("tail").unwrap().is_trivial(2.0));
        assert!(session.find_timing("inner").unwrap().has_custom_timings());
        assert_eq!(session.find_timing("inner").unwrap().custom_timing_count(), 1);
        assert!(session.find_timing("missing").is_none());
    }

    #[test]
    fn plain_text_rendering() {
        let text = sample().render_plain_text(1);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "web-01 at 2024-01-02 03:04:05.000 UTC");
        assert_eq!(lines[1], "/home = 5.0ms");
        assert_eq!(lines[2], "> outer = 4.0ms");
        assert_eq!(lines[3], ">> inner = 2.0ms (sql: 1)");
        assert_eq!(lines[4], ">> tail = 1.0ms");
    }

    #[test]
    fn filtered_rendering_hides_trivial_leaves() {
        let text = sample().render_filtered(2, 2.0);
        let lines: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(
            lines,
            ["/home = 5.00ms", "> outer = 4.00ms", ">> inner = 2.00ms (sql: 1)"]
        );
    }

    #[test]
    fn json_drops_sub_millisecond_start() {
        let mut session = sample();
        session.started_at = session.started_at + chrono::TimeDelta::microseconds(1_250);
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.root, session.root);
        assert_ne!(back.started_at, session.started_at);
        assert_eq!(
            back.started_at,
            session.started_at - chrono::TimeDelta::microseconds(250)
        );
    }
}
