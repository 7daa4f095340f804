//! # 结构等价校验器
//!
//! ## 核心意图（Why）
//! - 判断两棵剖析会话树（例如原始会话与经过存储往返的会话）是否表示同一次测量；
//! - 不等价时报告第一处差异的路径、字段与两侧取值，作为测试失败信息返回而非直接 panic。
//!
//! ## 比较规则（How）
//! 1. 会话级字段按 [`SESSION_FIELDS`] 逐一比较；
//! 2. 根步骤递归比较：节点字段按 [`TIMING_FIELDS`]；任一侧存在非空自定义计时时，两侧的分类集合、
//!    每个分类的条目数必须一致，条目按位置用 [`CUSTOM_TIMING_FIELDS`] 比较；任一侧有子步骤时，
//!    两侧子步骤数量必须一致，并按位置递归；
//! 3. 时间戳截断到 100ms 桶后再比较，其余标量精确匹配；
//! 4. 发现第一处差异立即停止遍历。
//!
//! ## 契约（What）
//! - 纯函数：只借用输入，不做任何修改；
//! - 路径形如 `session.root.children[1].custom_timings["sql"][0]`。

use std::collections::BTreeMap;
use std::fmt;

use spark_profiler::{CustomTiming, Session, Timing};
use thiserror::Error;

use crate::fields::{
    CUSTOM_TIMING_FIELDS, FieldAccessor, FieldValue, SESSION_FIELDS, TIMING_FIELDS,
};

/// 差异种类。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MismatchKind {
    /// 白名单字段取值不同。
    Scalar,
    /// 子步骤数量不同。
    ChildCount,
    /// 某个自定义计时分类只存在于一侧。
    MissingCategory,
    /// 同一分类下的条目数不同。
    EntryCount,
    /// 一侧有自定义计时，另一侧没有。
    CustomTimingsPresence,
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Scalar => "scalar mismatch",
            Self::ChildCount => "child count mismatch",
            Self::MissingCategory => "missing custom timing category",
            Self::EntryCount => "custom timing count mismatch",
            Self::CustomTimingsPresence => "custom timings present on one side only",
        };
        f.write_str(label)
    }
}

/// 第一处结构差异。
///
/// `left`/`right` 为两侧取值的可读形式；对于缺失分类，缺失的一侧为 `<absent>`。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{kind} at {path}.{field}: {left} != {right}")]
pub struct StructuralMismatch {
    pub path: String,
    pub field: String,
    pub left: String,
    pub right: String,
    pub kind: MismatchKind,
}

impl StructuralMismatch {
    fn new(
        path: &str,
        field: impl Into<String>,
        left: impl ToString,
        right: impl ToString,
        kind: MismatchKind,
    ) -> Self {
        Self {
            path: path.to_owned(),
            field: field.into(),
            left: left.to_string(),
            right: right.to_string(),
            kind,
        }
    }
}

const ABSENT: &str = "<absent>";

/// 比较两个会话。
pub fn compare_sessions(left: &Session, right: &Session) -> Result<(), StructuralMismatch> {
    compare_fields("session", SESSION_FIELDS, left, right)?;
    walk_timing("session.root", &left.root, &right.root)
}

/// 比较两棵步骤子树，路径以 `root` 开头。
pub fn compare_timings(left: &Timing, right: &Timing) -> Result<(), StructuralMismatch> {
    walk_timing("root", left, right)
}

/// 断言两个会话结构等价，否则以差异描述 panic。
#[track_caller]
pub fn assert_sessions_eq(left: &Session, right: &Session) {
    if let Err(mismatch) = compare_sessions(left, right) {
        tracing::debug!(
            path = %mismatch.path,
            field = %mismatch.field,
            kind = ?mismatch.kind,
            "sessions differ"
        );
        panic!("sessions are not structurally equal: {mismatch}");
    }
}

fn compare_fields<T>(
    path: &str,
    fields: &[FieldAccessor<T>],
    left: &T,
    right: &T,
) -> Result<(), StructuralMismatch> {
    for (name, accessor) in fields {
        let (left_value, right_value) = (accessor(left), accessor(right));
        if !left_value.matches(&right_value) {
            return Err(StructuralMismatch::new(
                path,
                *name,
                left_value,
                right_value,
                MismatchKind::Scalar,
            ));
        }
    }
    Ok(())
}

fn walk_timing(path: &str, left: &Timing, right: &Timing) -> Result<(), StructuralMismatch> {
    compare_fields(path, TIMING_FIELDS, left, right)?;
    compare_custom_timings(path, &left.custom_timings, &right.custom_timings)?;

    if left.has_children() || right.has_children() {
        if left.children.len() != right.children.len() {
            return Err(StructuralMismatch::new(
                path,
                "children",
                left.children.len(),
                right.children.len(),
                MismatchKind::ChildCount,
            ));
        }
        for (index, (left_child, right_child)) in
            left.children.iter().zip(&right.children).enumerate()
        {
            walk_timing(&format!("{path}.children[{index}]"), left_child, right_child)?;
        }
    }
    Ok(())
}

fn compare_custom_timings(
    path: &str,
    left: &BTreeMap<String, Vec<CustomTiming>>,
    right: &BTreeMap<String, Vec<CustomTiming>>,
) -> Result<(), StructuralMismatch> {
    let (left_present, right_present) = (!left.is_empty(), !right.is_empty());
    if !left_present && !right_present {
        return Ok(());
    }
    if left_present != right_present {
        return Err(StructuralMismatch::new(
            path,
            "custom_timings",
            describe_categories(left),
            describe_categories(right),
            MismatchKind::CustomTimingsPresence,
        ));
    }

    if let Some(category) = left.keys().find(|key| !right.contains_key(*key)) {
        return Err(missing_category(path, category, "present", ABSENT));
    }
    if let Some(category) = right.keys().find(|key| !left.contains_key(*key)) {
        return Err(missing_category(path, category, ABSENT, "present"));
    }

    for (category, left_entries) in left {
        let Some(right_entries) = right.get(category) else {
            continue;
        };
        let field = format!("custom_timings[{category:?}]");
        if left_entries.len() != right_entries.len() {
            return Err(StructuralMismatch::new(
                path,
                field,
                left_entries.len(),
                right_entries.len(),
                MismatchKind::EntryCount,
            ));
        }
        for (index, (left_entry, right_entry)) in
            left_entries.iter().zip(right_entries).enumerate()
        {
            let entry_path = format!("{path}.{field}[{index}]");
            compare_fields(&entry_path, CUSTOM_TIMING_FIELDS, left_entry, right_entry)?;
        }
    }
    Ok(())
}

fn missing_category(path: &str, category: &str, left: &str, right: &str) -> StructuralMismatch {
    StructuralMismatch::new(
        path,
        format!("custom_timings[{category:?}]"),
        left,
        right,
        MismatchKind::MissingCategory,
    )
}

fn describe_categories(map: &BTreeMap<String, Vec<CustomTiming>>) -> String {
    if map.is_empty() {
        return ABSENT.to_owned();
    }
    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    format!("{keys:?}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::fixtures;
    use spark_profiler::Ticks;

    #[test]
    fn identical_sessions_match() {
        let session = fixtures::sample_session();
        assert_eq!(compare_sessions(&session, &session), Ok(()));
        assert_eq!(compare_sessions(&session, &session.clone()), Ok(()));
    }

    #[test]
    fn nested_scalar_difference_reports_path() {
        let session = fixtures::sample_session();
        let mut other = session.clone();
        other.root.children[1].children[0].name = "renamed".to_owned();
        let mismatch = compare_sessions(&session, &other).unwrap_err();
        assert_eq!(mismatch.path, "session.root.children[1].children[0]");
        assert_eq!(mismatch.field, "name");
        assert_eq!(mismatch.kind, MismatchKind::Scalar);
        assert_eq!(mismatch.right, "\"renamed\"");
    }

    #[test]
    fn custom_timing_entry_difference_reports_entry_path() {
        let session = fixtures::sample_session();
        let mut other = session.clone();
        let entries = other.root.children[1]
            .custom_timings
            .get_mut("sql")
            .unwrap();
        entries[0].errored = !entries[0].errored;
        let mismatch = compare_sessions(&session, &other).unwrap_err();
        assert_eq!(
            mismatch.path,
            "session.root.children[1].custom_timings[\"sql\"][0]"
        );
        assert_eq!(mismatch.field, "errored");
    }

    #[test]
    fn entry_count_difference() {
        let session = fixtures::sample_session();
        let mut other = session.clone();
        other.root.children[1]
            .custom_timings
            .get_mut("sql")
            .unwrap()
            .pop();
        let mismatch = compare_sessions(&session, &other).unwrap_err();
        assert_eq!(mismatch.kind, MismatchKind::EntryCount);
        assert_eq!(mismatch.left, "2");
        assert_eq!(mismatch.right, "1");
    }

    #[test]
    fn presence_difference() {
        let session = fixtures::sample_session();
        let mut other = session.clone();
        other.root.children[1].custom_timings.clear();
        let mismatch = compare_sessions(&session, &other).unwrap_err();
        assert_eq!(mismatch.kind, MismatchKind::CustomTimingsPresence);
        assert_eq!(mismatch.right, ABSENT);
    }

    #[test]
    fn compare_timings_uses_root_path() {
        let session = fixtures::sample_session();
        let mut other = session.root.clone();
        other.children[0].duration = Ticks::from_millis(99);
        let mismatch = compare_timings(&session.root, &other).unwrap_err();
        assert_eq!(mismatch.path, "root.children[0]");
        assert_eq!(mismatch.field, "duration");
        assert_eq!(
            mismatch.to_string(),
            "scalar mismatch at root.children[0].duration: 10000 ticks != 990000 ticks"
        );
    }

    #[test]
    #[should_panic(expected = "sessions are not structurally equal")]
    fn assert_panics_on_mismatch() {
        let session = fixtures::sample_session();
        let mut other = session.clone();
        other.name = "/other".to_owned();
        assert_sessions_eq(&session, &other);
    }
}
