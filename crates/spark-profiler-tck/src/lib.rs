//! spark-profiler 契约测试套件（TCK）与结构等价校验器。
//!
//! # 教案式综述（Why / How / What）
//! - **为什么存在**：剖析会话停止后会被交给存储、序列化或跨进程传输；调用方需要一把统一的尺子判断
//!   “取回来的会话是否仍是同一次测量”。本 crate 提供该尺子（[`verify`]）以及围绕它的回归套件。
//! - **如何集成**：在测试中调用 [`compare_sessions`] 获取首个差异，或调用 [`assert_sessions_eq`] 直接断言；
//!   需要整体回归时调用 `run_*_suite` 入口或遍历 [`all_suites`]。
//! - **测试对象**：生命周期套件覆盖会话构建器的嵌套、失衡与冲突语义；等价套件覆盖时间戳容差、
//!   子步骤数量与自定义计时分类差异；往返套件覆盖 JSON 与内存存储。
//!
//! # 契约说明（What）
//! - 校验器是纯函数，只借用输入；差异以 [`StructuralMismatch`] 值返回；
//! - 套件用例在失败时 panic，`run_suite` 为其附加“套件/用例”上下文。
//!
//! # 模块结构
//! - `case` 模块：用例与套件的元信息结构体，以及统一的执行辅助函数；
//! - `fields`：参与比较的字段白名单；`verify`：递归比较算法；
//! - `suites`：三大主题的实际断言逻辑；`support`：夹具与日志初始化。

pub mod fields;
mod suites;
pub mod support;
pub mod verify;

use case::run_suite;
pub use case::{TckCase, TckSuite};
pub use verify::{
    MismatchKind, StructuralMismatch, assert_sessions_eq, compare_sessions, compare_timings,
};

const ALL_SUITES: [&TckSuite; 3] = [
    suites::lifecycle::suite(),
    suites::equality::suite(),
    suites::round_trip::suite(),
];

mod case {
    use super::support;
    use std::panic;

    /// 表示单个 TCK 用例的元信息。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：以结构体封装测试函数与名称，便于统一遍历、打印上下文信息。
    /// - **契约 (What)**：`test` 必须在失败时 `panic`；名称会用于错误提示。
    #[derive(Clone, Copy)]
    pub struct TckCase {
        /// 用例的人类可读名称。
        pub name: &'static str,
        /// 实际执行的断言逻辑。
        pub test: fn(),
    }

    /// 代表同一主题的一组 TCK 用例。
    #[derive(Clone, Copy)]
    pub struct TckSuite {
        /// 套件名称，供日志使用。
        pub name: &'static str,
        /// 归属该套件的用例集合。
        pub cases: &'static [TckCase],
    }

    /// 在捕获 panic 的前提下执行整个套件。
    ///
    /// # 教案式说明
    /// - **逻辑 (How)**：遍历 `cases`，借助 [`panic::catch_unwind`] 捕获 panic，将 payload 交给
    ///   `support::panic_with_context` 二次抛出；
    /// - **契约 (What)**：`suite.cases` 不能为空；全部成功时正常返回，否则 panic。
    pub fn run_suite(suite: &TckSuite) {
        assert!(!suite.cases.is_empty(), "TCK 套件不应为空");
        for case in suite.cases {
            tracing::debug!(suite = suite.name, case = case.name, "running tck case");
            let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| (case.test)()));
            if let Err(payload) = outcome {
                support::panic_with_context(suite.name, case.name, payload);
            }
        }
    }
}

/// 返回所有已注册的 TCK 套件，顺序固定。
pub fn all_suites() -> &'static [&'static TckSuite] {
    &ALL_SUITES
}

/// 运行“会话生命周期”主题的全部用例，覆盖嵌套步骤、失衡检测与上下文冲突。
pub fn run_lifecycle_suite() {
    run_suite(suites::lifecycle::suite());
}

/// 运行“结构等价”主题的全部用例，覆盖时间戳容差与各类结构差异的报告。
pub fn run_equality_suite() {
    run_suite(suites::equality::suite());
}

/// 运行“往返”主题的全部用例。
///
/// # 教案式说明
/// - **意图 (Why)**：确认会话经 JSON 序列化或 [`spark_profiler::InMemoryStorage`] 往返后，
///   仍被校验器判定为同一次测量；
/// - **契约 (What)**：调用前无需额外前置条件，存储用例内部使用 `futures::executor::block_on`。
pub fn run_round_trip_suite() {
    run_suite(suites::round_trip::suite());
}
