//! 结构等价校验器的性质测试。
//!
//! - 自反：任意会话与自身及其深拷贝等价；
//! - 敏感：修改任意一个节点的名称，校验器在该节点的路径上报告 `name` 差异；
//! - 容差：同一 100ms 桶内移动开始时间不影响判定。

use std::sync::Arc;

use chrono::TimeDelta;
use proptest::prelude::*;
use spark_profiler::{ActiveSession, MockClock, Profiler, ProfilingContext, Session, Timing};
use spark_profiler_tck::support::fixtures;
use spark_profiler_tck::{MismatchKind, compare_sessions};

/// 一个步骤子树的形状：进入后推进 `millis`，可选地记录一条 SQL 计时，再依次展开子步骤。
#[derive(Clone, Debug)]
struct Shape {
    millis: u8,
    custom: bool,
    children: Vec<Shape>,
}

fn shape_strategy() -> impl Strategy<Value = Shape> {
    let leaf = (0u8..4, any::<bool>()).prop_map(|(millis, custom)| Shape {
        millis,
        custom,
        children: Vec::new(),
    });
    leaf.prop_recursive(3, 24, 3, |inner| {
        (0u8..4, any::<bool>(), prop::collection::vec(inner, 0..3)).prop_map(
            |(millis, custom, children)| Shape {
                millis,
                custom,
                children,
            },
        )
    })
}

fn replay(session: &ActiveSession, clock: &MockClock, shape: &Shape, label: &str) {
    let _guard = session.step(label.to_owned()).unwrap();
    if shape.custom {
        drop(session.custom_timing("sql", label).unwrap());
    }
    clock.advance(i64::from(shape.millis)).unwrap();
    for (index, child) in shape.children.iter().enumerate() {
        replay(session, clock, child, &format!("{label}.{index}"));
    }
}

fn build(shapes: &[Shape]) -> Session {
    let clock = MockClock::with_origin(fixtures::origin());
    let profiler = Profiler::new(Arc::new(clock.clone()));
    let session = profiler.start(&ProfilingContext::new("/prop")).unwrap();
    for (index, shape) in shapes.iter().enumerate() {
        replay(&session, &clock, shape, &format!("step {index}"));
    }
    session.stop().unwrap()
}

/// 先序收集每个节点的校验路径。
fn paths(timing: &Timing, path: String, out: &mut Vec<String>) {
    for (index, child) in timing.children.iter().enumerate() {
        let child_path = format!("{path}.children[{index}]");
        out.push(child_path.clone());
        paths(child, child_path, out);
    }
}

fn preorder_paths(session: &Session) -> Vec<String> {
    let mut out = vec!["session.root".to_owned()];
    paths(&session.root, "session.root".to_owned(), &mut out);
    out
}

fn rename_nth(timing: &mut Timing, target: usize, seen: &mut usize) -> bool {
    if *seen == target {
        timing.name.push_str("-changed");
        return true;
    }
    *seen += 1;
    timing
        .children
        .iter_mut()
        .any(|child| rename_nth(child, target, seen))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn comparison_is_reflexive(shapes in prop::collection::vec(shape_strategy(), 0..4)) {
        let session = build(&shapes);
        prop_assert_eq!(compare_sessions(&session, &session), Ok(()));
        prop_assert_eq!(compare_sessions(&session, &session.clone()), Ok(()));
    }

    #[test]
    fn renaming_any_node_is_detected(
        shapes in prop::collection::vec(shape_strategy(), 1..4),
        pick in any::<prop::sample::Index>(),
    ) {
        let session = build(&shapes);
        let all_paths = preorder_paths(&session);
        prop_assert_eq!(all_paths.len(), session.timing_count());
        let target = pick.index(all_paths.len());

        let mut changed = session.clone();
        let mut seen = 0;
        prop_assert!(rename_nth(&mut changed.root, target, &mut seen));

        let mismatch = compare_sessions(&session, &changed).unwrap_err();
        prop_assert_eq!(mismatch.kind, MismatchKind::Scalar);
        prop_assert_eq!(&mismatch.path, &all_paths[target]);
        prop_assert_eq!(mismatch.field.as_str(), "name");
    }

    #[test]
    fn started_at_within_bucket_is_tolerated(
        shapes in prop::collection::vec(shape_strategy(), 0..3),
        offset in 0i64..100,
    ) {
        let session = build(&shapes);
        let mut shifted = session.clone();
        shifted.started_at = fixtures::origin() + TimeDelta::milliseconds(offset);
        prop_assert_eq!(compare_sessions(&session, &shifted), Ok(()));
    }
}
