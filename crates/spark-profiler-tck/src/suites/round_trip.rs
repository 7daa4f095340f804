use chrono::TimeDelta;
use futures::executor::block_on;
use spark_profiler::{InMemoryStorage, Profiler, ProfilingContext, SessionStorage};

use crate::case::{TckCase, TckSuite};
use crate::support::{fixtures, json_round_trip};
use crate::verify::{assert_sessions_eq, compare_sessions};

const CASES: &[TckCase] = &[
    TckCase {
        name: "json_round_trip_is_structurally_equal",
        test: json_round_trip_is_structurally_equal,
    },
    TckCase {
        name: "storage_round_trip_is_structurally_equal",
        test: storage_round_trip_is_structurally_equal,
    },
    TckCase {
        name: "stored_sessions_are_listed_newest_first",
        test: stored_sessions_are_listed_newest_first,
    },
];

const SUITE: TckSuite = TckSuite {
    name: "round_trip",
    cases: CASES,
};

/// 返回“往返”主题的测试套件。
pub const fn suite() -> &'static TckSuite {
    &SUITE
}

/// JSON 往返丢失亚毫秒精度，但校验器仍判定等价。
fn json_round_trip_is_structurally_equal() {
    let mut session = fixtures::sample_session();
    session.started_at += TimeDelta::microseconds(1_234);
    let restored = json_round_trip(&session);
    assert_ne!(
        restored.started_at, session.started_at,
        "毫秒精度序列化应丢弃亚毫秒部分"
    );
    assert_sessions_eq(&session, &restored);
}

/// 经内存存储保存并取回后结构等价。
fn storage_round_trip_is_structurally_equal() {
    let storage = InMemoryStorage::shared();
    let (clock, _) = fixtures::profiler();
    clock.advance_by(std::time::Duration::from_micros(2_500));
    let profiler = Profiler::builder()
        .clock(std::sync::Arc::new(clock.clone()))
        .storage(storage.clone())
        .build()
        .expect("默认配置合法");
    let session = profiler
        .start(&ProfilingContext::new("/stored"))
        .expect("上下文空闲时应能开始会话");
    {
        let _step = session.step("work").expect("步骤名合法");
        clock.advance(4).expect("推进非负时长");
        drop(session.custom_timing("redis", "GET key").expect("分类名合法"));
    }
    let stopped = block_on(session.stop_async()).expect("会话应平衡并保存");
    let loaded = block_on(storage.load(stopped.id))
        .expect("存储读取应成功")
        .expect("已保存的会话应能取回");
    assert_eq!(compare_sessions(&stopped, &loaded), Ok(()));
}

/// 存储按保存顺序由新到旧列出会话。
fn stored_sessions_are_listed_newest_first() {
    let storage = InMemoryStorage::new();
    let first = fixtures::sample_session();
    let second = fixtures::flat_session(fixtures::origin(), 1, 1);
    block_on(storage.save(&first)).expect("保存应成功");
    block_on(storage.save(&second)).expect("保存应成功");
    assert_eq!(
        block_on(storage.list(10)).expect("列出应成功"),
        vec![second.id, first.id]
    );
}
