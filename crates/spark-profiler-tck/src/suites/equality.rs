use chrono::TimeDelta;
use spark_profiler::{CustomTiming, Ticks};
use uuid::Uuid;

use crate::case::{TckCase, TckSuite};
use crate::support::fixtures;
use crate::verify::{MismatchKind, assert_sessions_eq, compare_sessions};

const CASES: &[TckCase] = &[
    TckCase {
        name: "comparison_is_reflexive",
        test: comparison_is_reflexive,
    },
    TckCase {
        name: "timestamps_within_a_decisecond_are_equal",
        test: timestamps_within_a_decisecond_are_equal,
    },
    TckCase {
        name: "timestamps_across_deciseconds_differ",
        test: timestamps_across_deciseconds_differ,
    },
    TckCase {
        name: "child_count_mismatch_is_reported_at_root",
        test: child_count_mismatch_is_reported_at_root,
    },
    TckCase {
        name: "missing_category_is_reported",
        test: missing_category_is_reported,
    },
    TckCase {
        name: "every_allowlisted_field_is_sensitive",
        test: every_allowlisted_field_is_sensitive,
    },
    TckCase {
        name: "children_are_compared_by_position",
        test: children_are_compared_by_position,
    },
];

const SUITE: TckSuite = TckSuite {
    name: "equality",
    cases: CASES,
};

/// 返回“结构等价”主题的测试套件。
pub const fn suite() -> &'static TckSuite {
    &SUITE
}

/// 会话与自身、与深拷贝都等价。
fn comparison_is_reflexive() {
    let session = fixtures::sample_session();
    assert_sessions_eq(&session, &session);
    let copy = session.clone();
    assert_sessions_eq(&session, &copy);
    assert_sessions_eq(&copy, &session);
}

/// 开始时间相差 50ms 但落在同一个 100ms 桶内：判定为等价。
fn timestamps_within_a_decisecond_are_equal() {
    let session = fixtures::sample_session();
    let mut shifted = session.clone();
    shifted.started_at = session.started_at + TimeDelta::milliseconds(50);
    assert_sessions_eq(&session, &shifted);
}

/// 相差 20ms 但跨越桶边界：判定为不等价，差异落在 `started_at`。
fn timestamps_across_deciseconds_differ() {
    let mut left = fixtures::sample_session();
    left.started_at = fixtures::origin() + TimeDelta::milliseconds(90);
    let mut right = left.clone();
    right.started_at = fixtures::origin() + TimeDelta::milliseconds(110);
    let mismatch = compare_sessions(&left, &right).expect_err("跨桶的时间戳应不等价");
    assert_eq!(mismatch.path, "session");
    assert_eq!(mismatch.field, "started_at");
    assert_eq!(mismatch.kind, MismatchKind::Scalar);
}

/// 一侧两个子步骤、另一侧一个：在根路径报告数量差异。
fn child_count_mismatch_is_reported_at_root() {
    let session = fixtures::flat_session(fixtures::origin(), 2, 1);
    let mut clone = session.clone();
    clone.root.children.truncate(1);
    let mismatch = compare_sessions(&session, &clone).expect_err("子步骤数量不同应不等价");
    assert_eq!(mismatch.kind, MismatchKind::ChildCount);
    assert_eq!(mismatch.path, "session.root");
    assert_eq!(mismatch.field, "children");
    assert_eq!((mismatch.left.as_str(), mismatch.right.as_str()), ("2", "1"));
}

/// 自定义计时分类只存在于一侧：报告缺失分类。
fn missing_category_is_reported() {
    let session = fixtures::sample_session();
    let mut other = session.clone();
    other.root.children[1].custom_timings.insert(
        "http".to_owned(),
        vec![CustomTiming {
            id: Uuid::new_v4(),
            command: Some("GET /inventory".to_owned()),
            execute_type: None,
            start: Ticks::from_millis(1),
            duration: Ticks::from_millis(1),
            first_fetch: None,
            errored: false,
        }],
    );
    let mismatch = compare_sessions(&session, &other).expect_err("分类集合不同应不等价");
    assert_eq!(mismatch.kind, MismatchKind::MissingCategory);
    assert_eq!(mismatch.path, "session.root.children[1]");
    assert_eq!(mismatch.field, "custom_timings[\"http\"]");
    assert_eq!(mismatch.left, "<absent>");

    let mismatch = compare_sessions(&other, &session).expect_err("比较方向不影响判定");
    assert_eq!(mismatch.right, "<absent>");
}

/// 修改任意一个白名单字段都会被检测到，且报告的字段名正确。
fn every_allowlisted_field_is_sensitive() {
    let session = fixtures::sample_session();
    type Mutation = (&'static str, &'static str, fn(&mut spark_profiler::Session));
    let mutations: &[Mutation] = &[
        ("session", "id", |s| s.id = Uuid::new_v4()),
        ("session", "name", |s| s.name.push('!')),
        ("session", "started_at", |s| {
            s.started_at += TimeDelta::seconds(1);
        }),
        ("session", "duration", |s| {
            s.duration = s.duration + Ticks(1);
        }),
        ("session", "machine_name", |s| {
            s.machine_name = Some("other-host".to_owned());
        }),
        ("session", "user", |s| s.user = None),
        ("session.root", "id", |s| s.root.id = Uuid::new_v4()),
        ("session.root.children[0]", "name", |s| {
            s.root.children[0].name.push('!');
        }),
        ("session.root.children[0]", "start", |s| {
            s.root.children[0].start = s.root.children[0].start + Ticks(1);
        }),
        ("session.root.children[1].children[0]", "duration", |s| {
            s.root.children[1].children[0].duration = Ticks::ZERO;
        }),
    ];
    for (path, field, mutate) in mutations {
        let mut changed = session.clone();
        mutate(&mut changed);
        let mismatch = compare_sessions(&session, &changed)
            .expect_err("修改白名单字段后应不等价");
        assert_eq!((mismatch.path.as_str(), mismatch.field.as_str()), (*path, *field));
    }

    let entry_path = "session.root.children[1].custom_timings[\"sql\"][0]";
    let entry_mutations: &[(&str, fn(&mut CustomTiming))] = &[
        ("id", |e| e.id = Uuid::new_v4()),
        ("command", |e| e.command = None),
        ("execute_type", |e| e.execute_type = Some("Scalar".to_owned())),
        ("start", |e| e.start = e.start + Ticks(1)),
        ("duration", |e| e.duration = e.duration + Ticks(1)),
        ("first_fetch", |e| e.first_fetch = None),
        ("errored", |e| e.errored = !e.errored),
    ];
    for (field, mutate) in entry_mutations {
        let mut changed = session.clone();
        if let Some(entries) = changed.root.children[1].custom_timings.get_mut("sql") {
            mutate(&mut entries[0]);
        }
        let mismatch = compare_sessions(&session, &changed)
            .expect_err("修改自定义计时字段后应不等价");
        assert_eq!(mismatch.path, entry_path);
        assert_eq!(mismatch.field, *field);
    }
}

/// 子步骤按位置而非名称配对：交换顺序即不等价。
fn children_are_compared_by_position() {
    let session = fixtures::flat_session(fixtures::origin(), 3, 2);
    let mut swapped = session.clone();
    swapped.root.children.swap(0, 2);
    let mismatch = compare_sessions(&session, &swapped).expect_err("顺序是身份的一部分");
    assert_eq!(mismatch.path, "session.root.children[0]");
    assert_eq!(mismatch.field, "id");
}
