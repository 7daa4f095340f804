use std::fmt::Write;
use std::panic;

use spark_profiler::Session;
use tracing_subscriber::EnvFilter;

/// 在附加上下文的情况下重新抛出 panic。
///
/// # 教案式说明
/// - **意图 (Why)**：`case::run_suite` 捕获 panic 后，需要在原始 payload 之上追加“套件/用例”描述，
///   帮助调试者快速定位失败来源。
/// - **逻辑 (How)**：尝试将 payload 解析为 `&str` / `String`，格式化后通过 [`panic::resume_unwind`] 重新抛出。
/// - **契约 (What)**：调用前必须处于 `catch_unwind` 的错误分支中；函数不会正常返回。
pub fn panic_with_context(suite: &str, case: &str, payload: Box<dyn std::any::Any + Send>) -> ! {
    let mut message = String::new();
    let _ = write!(&mut message, "[spark-profiler-tck::{suite}::{case}] 测试失败：");

    if let Some(text) = payload.downcast_ref::<&str>() {
        let _ = write!(&mut message, "{text}");
    } else if let Some(text) = payload.downcast_ref::<String>() {
        let _ = write!(&mut message, "{text}");
    } else {
        let _ = write!(&mut message, "<未知 panic 类型>");
    }

    panic::resume_unwind(Box::new(message));
}

/// 安装测试用的日志订阅者。
///
/// # 契约（What）
/// - 过滤规则取自 `RUST_LOG`，缺省为 `spark_profiler=debug`；
/// - 使用 `try_init`，重复调用或已有全局订阅者时静默忽略。
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("spark_profiler=debug,spark_profiler_tck=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// 经 JSON 序列化往返的会话副本。
///
/// `started_at` 以毫秒精度序列化，副本会丢失亚毫秒部分。
pub fn json_round_trip(session: &Session) -> Session {
    let document = serde_json::to_string(session).expect("会话应可序列化");
    serde_json::from_str(&document).expect("会话 JSON 应可反序列化")
}

/// 确定性的会话构造工具。
pub mod fixtures {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};
    use spark_profiler::{MockClock, Profiler, ProfilingContext, Session};

    /// 所有夹具共用的墙钟起点：2024-06-01T08:00:00.000Z。
    pub fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0)
            .single()
            .expect("固定起点应唯一")
    }

    /// 以固定起点构造虚拟时钟与剖析器。
    pub fn profiler() -> (MockClock, Profiler) {
        profiler_at(origin())
    }

    pub fn profiler_at(origin: DateTime<Utc>) -> (MockClock, Profiler) {
        let clock = MockClock::with_origin(origin);
        let profiler = Profiler::new(Arc::new(clock.clone()));
        (clock, profiler)
    }

    /// 构造包含两层子步骤与自定义计时的样例会话。
    ///
    /// 结构：
    /// ```text
    /// /orders
    /// ├── auth                 1ms
    /// └── load                 6ms, sql × 2
    ///     └── deserialize      2ms
    /// ```
    pub fn sample_session() -> Session {
        let (clock, profiler) = profiler();
        let session = profiler
            .start(&ProfilingContext::new("/orders").user("alice"))
            .expect("样例会话应能开始");
        {
            let _auth = session.step("auth").expect("步骤名合法");
            advance(&clock, 1);
        }
        {
            let _load = session.step("load").expect("步骤名合法");
            {
                let mut query = session
                    .custom_timing_typed("sql", "select * from orders", "Reader")
                    .expect("分类名合法");
                advance(&clock, 1);
                query.first_fetch_completed();
                advance(&clock, 1);
            }
            drop(
                session
                    .custom_timing("sql", "select * from items")
                    .expect("分类名合法"),
            );
            {
                let _deserialize = session.step("deserialize").expect("步骤名合法");
                advance(&clock, 2);
            }
            advance(&clock, 2);
        }
        session.stop().expect("样例会话应平衡")
    }

    /// 含 `children` 个等长子步骤的会话，每个子步骤耗时 `millis`。
    pub fn flat_session(origin: DateTime<Utc>, children: usize, millis: i64) -> Session {
        let (clock, profiler) = profiler_at(origin);
        let session = profiler
            .start(&ProfilingContext::new("/flat"))
            .expect("会话应能开始");
        for index in 0..children {
            let _step = session.step(format!("child {index}")).expect("步骤名合法");
            advance(&clock, millis);
        }
        session.stop().expect("会话应平衡")
    }

    fn advance(clock: &MockClock, millis: i64) {
        clock.advance(millis).expect("夹具只推进非负时长");
    }
}
