use spark_profiler::{ProfilerError, ProfilingContext, Ticks};

use crate::case::{TckCase, TckSuite};
use crate::support::fixtures;

const CASES: &[TckCase] = &[
    TckCase {
        name: "single_step_records_exact_duration",
        test: single_step_records_exact_duration,
    },
    TckCase {
        name: "nested_steps_form_a_chain",
        test: nested_steps_form_a_chain,
    },
    TckCase {
        name: "conflicting_start_is_rejected",
        test: conflicting_start_is_rejected,
    },
    TckCase {
        name: "forgotten_step_makes_stop_unbalanced",
        test: forgotten_step_makes_stop_unbalanced,
    },
    TckCase {
        name: "early_close_closes_descendants",
        test: early_close_closes_descendants,
    },
];

const SUITE: TckSuite = TckSuite {
    name: "lifecycle",
    cases: CASES,
};

/// 返回“会话生命周期”主题的测试套件。
pub const fn suite() -> &'static TckSuite {
    &SUITE
}

/// 单个子步骤推进 1ms：根与子步骤耗时都应恰为 1ms。
fn single_step_records_exact_duration() {
    let (clock, profiler) = fixtures::profiler();
    let session = profiler
        .start(&ProfilingContext::new("/test"))
        .expect("上下文空闲时应能开始会话");
    {
        let _step = session.step("Depth 1").expect("步骤名合法");
        clock.advance(1).expect("推进非负时长");
    }
    let result = session.stop().expect("步骤已全部关闭");

    assert_eq!(result.root.duration, Ticks::from_millis(1), "根耗时应为 1ms");
    assert_eq!(result.root.children.len(), 1, "根下应恰有一个子步骤");
    assert_eq!(
        result.root.children[0].duration,
        Ticks::from_millis(1),
        "子步骤耗时应为 1ms"
    );
    assert_eq!(result.started_at, fixtures::origin(), "开始时间取自注入的时钟");
}

/// 三层嵌套、每层推进 1ms：形成一条链，子步骤数量依次为 1,1,1,0。
fn nested_steps_form_a_chain() {
    let (clock, profiler) = fixtures::profiler();
    let session = profiler
        .start(&ProfilingContext::new("/test"))
        .expect("上下文空闲时应能开始会话");
    {
        let _one = session.step("Depth 1").expect("步骤名合法");
        clock.advance(1).expect("推进非负时长");
        let _two = session.step("Depth 2").expect("步骤名合法");
        clock.advance(1).expect("推进非负时长");
        let _three = session.step("Depth 3").expect("步骤名合法");
        clock.advance(1).expect("推进非负时长");
        assert_eq!(session.open_steps(), 4, "根加三层嵌套步骤均处于打开状态");
    }
    let result = session.stop().expect("步骤已全部关闭");

    assert_eq!(result.root.duration, Ticks::from_millis(3));
    let counts: Vec<usize> = result
        .hierarchy()
        .map(|(_, timing)| timing.children.len())
        .collect();
    assert_eq!(counts, vec![1, 1, 1, 0], "应形成单链");
    for (_, timing) in result.hierarchy().skip(1) {
        assert_eq!(
            timing.duration_without_children(),
            Ticks::from_millis(1),
            "每层自身耗时应为 1ms：{}",
            timing.name
        );
    }
}

/// 同一上下文已有活跃会话时，再次开始必须失败；停止后可再次开始。
fn conflicting_start_is_rejected() {
    let (_clock, profiler) = fixtures::profiler();
    let context = ProfilingContext::new("/busy");
    let active = profiler.start(&context).expect("首次开始应成功");
    let err = profiler.start(&context).expect_err("重复开始必须失败");
    assert!(
        matches!(err, ProfilerError::ConflictingSession { .. }),
        "应返回上下文冲突错误：{err}"
    );
    active.stop().expect("会话应平衡");
    profiler.start(&context).expect("停止后上下文应被释放");
}

/// 被遗忘的步骤守卫让 `stop` 观察到失衡。
fn forgotten_step_makes_stop_unbalanced() {
    let (_clock, profiler) = fixtures::profiler();
    let session = profiler
        .start(&ProfilingContext::new("/leak"))
        .expect("上下文空闲时应能开始会话");
    std::mem::forget(session.step("leaked").expect("步骤名合法"));
    match session.stop() {
        Err(ProfilerError::UnbalancedStep { open, .. }) => {
            assert_eq!(open, vec!["leaked".to_owned()], "应列出未关闭的步骤");
        }
        other => panic!("期望 UnbalancedStep，实际为 {other:?}"),
    }
    assert!(!profiler.is_active("/leak"), "失衡的会话同样释放上下文");
}

/// 显式关闭外层步骤时，仍打开的内层步骤被一并关闭，并报告失衡。
fn early_close_closes_descendants() {
    let (clock, profiler) = fixtures::profiler();
    let session = profiler
        .start(&ProfilingContext::new("/early"))
        .expect("上下文空闲时应能开始会话");
    let outer = session.step("outer").expect("步骤名合法");
    let inner = session.step("inner").expect("步骤名合法");
    clock.advance(2).expect("推进非负时长");
    let err = outer.close().expect_err("后代未关闭时显式关闭应报告失衡");
    assert!(matches!(err, ProfilerError::UnbalancedStep { .. }));
    assert_eq!(session.open_steps(), 1, "只剩根节点打开");
    clock.advance(3).expect("推进非负时长");
    assert_eq!(
        inner.close(),
        Ok(Ticks::from_millis(2)),
        "被强制关闭的步骤保持关闭时刻的耗时"
    );
    let result = session.stop().expect("树已恢复平衡");
    assert_eq!(result.root.children[0].children[0].duration, Ticks::from_millis(2));
}
